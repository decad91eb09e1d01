//! Float RGB image buffers
//!
//! `ImageBuffer` is an immutable raster: every transform returns a new buffer
//! and pixel storage is shared behind an `Arc`, so passing a stage's input
//! through unchanged is a reference-count bump.
//!
//! Each buffer carries
//! - an `Extent` (origin and size of this raster inside its frame),
//! - a `FrameSize` (the full frame at this buffer's resolution), and
//! - a `ColorSpace` tag that operators assert against in debug builds.

use crate::color;
use crate::error::{ForgeError, Result};
use image::{DynamicImage, Rgb32FImage, RgbImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Encoding of the values currently held by a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorSpace {
    /// Scene-linear RGB (sensor / P3 before the gamut conversion, AWG after)
    Linear,
    /// ARRI LogC3 code values
    Log,
    /// [hue, polar angle, magnitude] of LogC values
    Spherical,
    /// Negative densities as normalized Cineon code values
    Density,
    /// Display-referred gamma 2.2
    Display,
}

/// Pixel rectangle of a buffer inside its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn long_edge(&self) -> u32 {
        self.width.max(self.height)
    }
}

/// Size of the full frame a buffer belongs to, at that buffer's resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn long_edge(&self) -> u32 {
        self.width.max(self.height)
    }
}

#[derive(Debug, Clone)]
pub struct ImageBuffer {
    extent: Extent,
    frame: FrameSize,
    space: ColorSpace,
    pixels: Arc<Vec<[f32; 3]>>,
}

impl ImageBuffer {
    /// Create a full-frame buffer from row-major pixels.
    pub fn new(width: u32, height: u32, space: ColorSpace, pixels: Vec<[f32; 3]>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(ForgeError::ValidationError(format!(
                "Image dimensions must be non-zero, got {}x{}",
                width, height
            )));
        }
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(ForgeError::ValidationError(format!(
                "Pixel count {} does not match {}x{}",
                pixels.len(),
                width,
                height
            )));
        }
        Ok(Self {
            extent: Extent::new(0, 0, width, height),
            frame: FrameSize { width, height },
            space,
            pixels: Arc::new(pixels),
        })
    }

    /// A flat, single-color full-frame buffer.
    pub fn filled(width: u32, height: u32, space: ColorSpace, rgb: [f32; 3]) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        Self {
            extent: Extent::new(0, 0, width, height),
            frame: FrameSize { width, height },
            space,
            pixels: Arc::new(vec![rgb; width as usize * height as usize]),
        }
    }

    /// Build a full-frame buffer from a per-pixel function, evaluated in parallel.
    pub fn from_fn<F>(width: u32, height: u32, space: ColorSpace, f: F) -> Self
    where
        F: Fn(u32, u32) -> [f32; 3] + Sync,
    {
        let width = width.max(1);
        let height = height.max(1);
        let mut pixels = vec![[0.0f32; 3]; width as usize * height as usize];
        pixels
            .par_chunks_mut(width as usize)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, px) in row.iter_mut().enumerate() {
                    *px = f(x as u32, y as u32);
                }
            });
        Self {
            extent: Extent::new(0, 0, width, height),
            frame: FrameSize { width, height },
            space,
            pixels: Arc::new(pixels),
        }
    }

    /// Linearize an 8/16-bit sRGB-ish image into a `Linear` buffer.
    pub fn from_dynamic(img: &DynamicImage) -> Result<Self> {
        let rgb = img.to_rgb32f();
        let (width, height) = rgb.dimensions();
        let pixels: Vec<[f32; 3]> = rgb
            .into_raw()
            .par_chunks_exact(3)
            .map(|c| [color::gamma_decode(c[0]), color::gamma_decode(c[1]), color::gamma_decode(c[2])])
            .collect();
        Self::new(width, height, ColorSpace::Linear, pixels)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn frame(&self) -> FrameSize {
        self.frame
    }

    pub fn space(&self) -> ColorSpace {
        self.space
    }

    pub fn width(&self) -> u32 {
        self.extent.width
    }

    pub fn height(&self) -> u32 {
        self.extent.height
    }

    pub fn pixels(&self) -> &[[f32; 3]] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> [f32; 3] {
        self.pixels[y as usize * self.extent.width as usize + x as usize]
    }

    /// True when both buffers share the same pixel storage.
    pub fn shares_pixels(&self, other: &ImageBuffer) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }

    /// Same pixels with a different color-space tag. Only conversion points
    /// that reinterpret values without changing them should use this.
    pub fn retagged(&self, space: ColorSpace) -> Self {
        Self {
            space,
            ..self.clone()
        }
    }

    /// Place this buffer inside a larger frame at the given origin.
    pub fn placed_in_frame(&self, frame: FrameSize, x: u32, y: u32) -> Self {
        Self {
            extent: Extent::new(x, y, self.extent.width, self.extent.height),
            frame,
            ..self.clone()
        }
    }

    // ========================================================================
    // Pixel transforms
    // ========================================================================

    /// Apply a per-pixel function in parallel.
    pub fn map<F>(&self, space: ColorSpace, f: F) -> Self
    where
        F: Fn([f32; 3]) -> [f32; 3] + Sync + Send,
    {
        let pixels: Vec<[f32; 3]> = self.pixels.par_iter().map(|&p| f(p)).collect();
        self.with_pixels(space, pixels)
    }

    /// Apply a per-pixel function that also sees the pixel's frame coordinates.
    pub fn map_indexed<F>(&self, space: ColorSpace, f: F) -> Self
    where
        F: Fn(u32, u32, [f32; 3]) -> [f32; 3] + Sync + Send,
    {
        let w = self.extent.width as usize;
        let (ox, oy) = (self.extent.x, self.extent.y);
        let mut pixels = self.pixels.as_ref().clone();
        pixels.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
            for (x, px) in row.iter_mut().enumerate() {
                *px = f(ox + x as u32, oy + y as u32, *px);
            }
        });
        self.with_pixels(space, pixels)
    }

    /// Combine two equally sized buffers pixel by pixel.
    pub fn zip_map<F>(&self, other: &ImageBuffer, space: ColorSpace, f: F) -> Result<Self>
    where
        F: Fn([f32; 3], [f32; 3]) -> [f32; 3] + Sync + Send,
    {
        if self.extent.width != other.extent.width || self.extent.height != other.extent.height {
            return Err(ForgeError::ProcessingError(format!(
                "Buffer size mismatch: {}x{} vs {}x{}",
                self.extent.width, self.extent.height, other.extent.width, other.extent.height
            )));
        }
        let pixels: Vec<[f32; 3]> = self
            .pixels
            .par_iter()
            .zip(other.pixels.par_iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        Ok(self.with_pixels(space, pixels))
    }

    /// Per-pixel blend `self → other` by a single-channel alpha plane.
    /// Spherical buffers interpolate hue along the shorter arc.
    pub fn blend_with_alpha(&self, other: &ImageBuffer, alpha: &[f32]) -> Result<Self> {
        if alpha.len() != self.pixels.len() {
            return Err(ForgeError::ProcessingError(format!(
                "Alpha plane has {} values for {} pixels",
                alpha.len(),
                self.pixels.len()
            )));
        }
        if self.extent.width != other.extent.width || self.extent.height != other.extent.height {
            return Err(ForgeError::ProcessingError("Blend operands differ in size".to_string()));
        }
        let spherical = self.space == ColorSpace::Spherical && other.space == ColorSpace::Spherical;
        let lerp: fn([f32; 3], [f32; 3], f32) -> [f32; 3] = if spherical {
            color::lerp_spherical
        } else {
            color::lerp3
        };
        let pixels: Vec<[f32; 3]> = self
            .pixels
            .par_iter()
            .zip(other.pixels.par_iter())
            .zip(alpha.par_iter())
            .map(|((&a, &b), &t)| lerp(a, b, t.clamp(0.0, 1.0)))
            .collect();
        Ok(self.with_pixels(self.space, pixels))
    }

    fn with_pixels(&self, space: ColorSpace, pixels: Vec<[f32; 3]>) -> Self {
        Self {
            extent: self.extent,
            frame: self.frame,
            space,
            pixels: Arc::new(pixels),
        }
    }

    // ========================================================================
    // Geometry
    // ========================================================================

    /// Cut out a rectangle given in frame coordinates, clamped to this
    /// buffer's extent. The result keeps the frame, so its extent origin
    /// records where it came from.
    pub fn crop(&self, rect: Extent) -> Self {
        let x0 = rect.x.clamp(self.extent.x, self.extent.x + self.extent.width - 1);
        let y0 = rect.y.clamp(self.extent.y, self.extent.y + self.extent.height - 1);
        let x1 = (rect.x.saturating_add(rect.width)).clamp(x0 + 1, self.extent.x + self.extent.width);
        let y1 = (rect.y.saturating_add(rect.height)).clamp(y0 + 1, self.extent.y + self.extent.height);
        let (w, h) = (x1 - x0, y1 - y0);
        let src_w = self.extent.width as usize;

        let mut pixels = Vec::with_capacity(w as usize * h as usize);
        for y in y0..y1 {
            let row = (y - self.extent.y) as usize * src_w;
            let start = row + (x0 - self.extent.x) as usize;
            pixels.extend_from_slice(&self.pixels[start..start + w as usize]);
        }

        Self {
            extent: Extent::new(x0, y0, w, h),
            frame: self.frame,
            space: self.space,
            pixels: Arc::new(pixels),
        }
    }

    /// Resample to a new size. Frame and extent origin scale with the raster.
    pub fn resize(&self, width: u32, height: u32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        if width == self.extent.width && height == self.extent.height {
            return self.clone();
        }
        let sx = width as f64 / self.extent.width as f64;
        let sy = height as f64 / self.extent.height as f64;
        let pixels = resample(&self.pixels, self.extent.width, self.extent.height, width, height);
        Self {
            extent: Extent::new(
                (self.extent.x as f64 * sx).round() as u32,
                (self.extent.y as f64 * sy).round() as u32,
                width,
                height,
            ),
            frame: FrameSize {
                width: ((self.frame.width as f64 * sx).round() as u32).max(width),
                height: ((self.frame.height as f64 * sy).round() as u32).max(height),
            },
            space: self.space,
            pixels: Arc::new(pixels),
        }
    }

    /// Resample so the long edge equals `long_edge`, keeping aspect ratio.
    pub fn resize_long_edge(&self, long_edge: u32) -> Self {
        let (w, h) = fit_long_edge(self.extent.width, self.extent.height, long_edge);
        self.resize(w, h)
    }

    /// Separable Gaussian blur with clamped edges.
    ///
    /// Large radii blur a downscaled copy and scale it back up, which keeps
    /// the cost bounded for halation-sized kernels.
    pub fn gaussian_blur(&self, sigma: f32) -> Self {
        if sigma <= 0.0 || !sigma.is_finite() {
            return self.clone();
        }
        const DIRECT_LIMIT: f32 = 6.0;
        if sigma > DIRECT_LIMIT {
            let factor = (sigma / (DIRECT_LIMIT / 2.0)).floor().max(2.0);
            let w = ((self.extent.width as f32 / factor).round() as u32).max(1);
            let h = ((self.extent.height as f32 / factor).round() as u32).max(1);
            let small = resample(&self.pixels, self.extent.width, self.extent.height, w, h);
            let blurred = blur_separable(&small, w as usize, h as usize, sigma / factor);
            let pixels = resample(&blurred, w, h, self.extent.width, self.extent.height);
            return self.with_pixels(self.space, pixels);
        }
        let pixels = blur_separable(
            &self.pixels,
            self.extent.width as usize,
            self.extent.height as usize,
            sigma,
        );
        self.with_pixels(self.space, pixels)
    }

    // ========================================================================
    // Statistics and export
    // ========================================================================

    pub fn mean(&self) -> [f32; 3] {
        let n = self.pixels.len().max(1) as f64;
        let sum = self
            .pixels
            .par_iter()
            .fold(
                || [0.0f64; 3],
                |mut acc, p| {
                    acc[0] += p[0] as f64;
                    acc[1] += p[1] as f64;
                    acc[2] += p[2] as f64;
                    acc
                },
            )
            .reduce(|| [0.0f64; 3], |a, b| [a[0] + b[0], a[1] + b[1], a[2] + b[2]]);
        [(sum[0] / n) as f32, (sum[1] / n) as f32, (sum[2] / n) as f32]
    }

    /// Mean scene-linear luminance, decoding the buffer's encoding first.
    pub fn mean_luminance(&self) -> f32 {
        let space = self.space;
        let n = self.pixels.len().max(1) as f64;
        let sum: f64 = self
            .pixels
            .par_iter()
            .map(|&p| {
                let linear = match space {
                    ColorSpace::Linear => p,
                    ColorSpace::Log => color::logc_decode_rgb(p),
                    ColorSpace::Spherical => color::logc_decode_rgb(color::spherical_to_rgb(p)),
                    ColorSpace::Display => color::gamma_decode_rgb(p),
                    ColorSpace::Density => p.map(|c| color::density_to_transmittance(color::cineon_to_density(c))),
                };
                color::luminance(linear) as f64
            })
            .sum();
        (sum / n) as f32
    }

    /// Largest per-channel absolute difference against another buffer.
    pub fn max_abs_diff(&self, other: &ImageBuffer) -> f32 {
        if self.pixels.len() != other.pixels.len() {
            return f32::INFINITY;
        }
        self.pixels
            .par_iter()
            .zip(other.pixels.par_iter())
            .map(|(a, b)| {
                (a[0] - b[0])
                    .abs()
                    .max((a[1] - b[1]).abs())
                    .max((a[2] - b[2]).abs())
            })
            .reduce(|| 0.0, f32::max)
    }

    /// Quantize display values to 8-bit RGB.
    pub fn to_rgb8(&self) -> RgbImage {
        debug_assert_eq!(self.space, ColorSpace::Display, "to_rgb8 expects display values");
        let raw: Vec<u8> = self
            .pixels
            .par_iter()
            .flat_map_iter(|p| p.map(|c| (c.clamp(0.0, 1.0) * 255.0 + 0.5) as u8))
            .collect();
        RgbImage::from_raw(self.extent.width, self.extent.height, raw)
            .unwrap_or_else(|| RgbImage::new(self.extent.width, self.extent.height))
    }
}

/// Dimensions with the given long edge and the same aspect ratio.
pub fn fit_long_edge(width: u32, height: u32, long_edge: u32) -> (u32, u32) {
    let long = width.max(height).max(1) as f64;
    let scale = long_edge as f64 / long;
    (
        ((width as f64 * scale).round() as u32).max(1),
        ((height as f64 * scale).round() as u32).max(1),
    )
}

fn resample(pixels: &[[f32; 3]], w: u32, h: u32, dst_w: u32, dst_h: u32) -> Vec<[f32; 3]> {
    let flat: Vec<f32> = pixels.iter().flat_map(|p| p.iter().copied()).collect();
    let Some(src) = Rgb32FImage::from_raw(w, h, flat) else {
        return vec![[0.0; 3]; dst_w as usize * dst_h as usize];
    };
    let filter = if dst_w < w || dst_h < h {
        image::imageops::FilterType::Triangle
    } else {
        image::imageops::FilterType::CatmullRom
    };
    image::imageops::resize(&src, dst_w, dst_h, filter)
        .into_raw()
        .chunks_exact(3)
        .map(|c| [c[0], c[1], c[2]])
        .collect()
}

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (sigma * 3.0).ceil().max(1.0) as i32;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-(i * i) as f32 / denom).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

fn blur_separable(pixels: &[[f32; 3]], w: usize, h: usize, sigma: f32) -> Vec<[f32; 3]> {
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as isize;

    // Horizontal pass
    let mut horizontal = vec![[0.0f32; 3]; w * h];
    horizontal
        .par_chunks_mut(w)
        .enumerate()
        .for_each(|(y, row)| {
            let src = &pixels[y * w..(y + 1) * w];
            for (x, out) in row.iter_mut().enumerate() {
                let mut acc = [0.0f32; 3];
                for (k, weight) in kernel.iter().enumerate() {
                    let sx = (x as isize + k as isize - radius).clamp(0, w as isize - 1) as usize;
                    let p = src[sx];
                    acc[0] += p[0] * weight;
                    acc[1] += p[1] * weight;
                    acc[2] += p[2] * weight;
                }
                *out = acc;
            }
        });

    // Vertical pass
    let mut output = vec![[0.0f32; 3]; w * h];
    output.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        for (x, out) in row.iter_mut().enumerate() {
            let mut acc = [0.0f32; 3];
            for (k, weight) in kernel.iter().enumerate() {
                let sy = (y as isize + k as isize - radius).clamp(0, h as isize - 1) as usize;
                let p = horizontal[sy * w + x];
                acc[0] += p[0] * weight;
                acc[1] += p[1] * weight;
                acc[2] += p[2] * weight;
            }
            *out = acc;
        }
    });

    output
}
