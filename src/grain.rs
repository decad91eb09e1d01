//! Film grain synthesis
//!
//! Grain is built in two steps:
//! 1. A **base plate** per (gate format, native size): a square, periodic,
//!    multi-octave value-noise field normalized to zero mean and unit
//!    variance. Shadow grain is coarser than highlight grain. Plates are
//!    deterministic for a seed and built once per key.
//! 2. A **tiled field** covering the pixels being rendered. Copies of the
//!    plate are laid on a jittered grid, each with its own plate offset and a
//!    small rotation, and composited with a feathered edge weight. The sum is
//!    normalized by the root of the summed squared weights so overlaps keep
//!    unit variance and copy edges never show.
//!
//! The tiled field is defined over the whole frame, so a zoom crop gets the
//! same grain as the matching pixels of the full render.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let grain = GrainSynthesizer::new(calibration, &PipelineConfig::default());
//! let plate = grain.plate(GateFormat::ThirtyFive, 6000);
//! let field = grain.field(&plate, buffer.frame(), buffer.extent(), scale);
//! ```

use crate::buffer::{ColorSpace, Extent, FrameSize, ImageBuffer};
use crate::color;
use crate::config::{CalibrationTable, GrainCalibration, PipelineConfig};
use crate::error::Result;
use crate::metrics::{Metrics, Timer};
use crate::operators::{Operator, RenderContext};
use crate::params::{GateFormat, ParameterSet};
use rayon::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::debug;

// ============================================================================
// Hashing and noise
// ============================================================================

/// Thomas Wang's 32-bit integer hash.
pub fn wang_hash(mut seed: u32) -> u32 {
    seed = (seed ^ 61) ^ (seed >> 16);
    seed = seed.wrapping_mul(9);
    seed ^= seed >> 4;
    seed = seed.wrapping_mul(0x27d4_eb2d);
    seed ^= seed >> 15;
    seed
}

fn hash2(seed: u32, a: u32, b: u32) -> u32 {
    wang_hash(seed ^ wang_hash(a ^ wang_hash(b.wrapping_add(0x9e37_79b9))))
}

/// Uniform value in `-1..1`.
fn unit(h: u32) -> f32 {
    (h as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32
}

/// Periodic value noise with `cells` lattice cells across `size` pixels.
fn value_noise(seed: u32, x: f32, y: f32, cells: u32, size: u32) -> f32 {
    let fx = x * cells as f32 / size as f32;
    let fy = y * cells as f32 / size as f32;
    let (x0, y0) = (fx.floor(), fy.floor());
    let smooth = |t: f32| t * t * (3.0 - 2.0 * t);
    let (tx, ty) = (smooth(fx - x0), smooth(fy - y0));
    let wrap = |v: f32| (v as i64).rem_euclid(cells as i64) as u32;
    let (ix0, iy0) = (wrap(x0), wrap(y0));
    let (ix1, iy1) = ((ix0 + 1) % cells, (iy0 + 1) % cells);

    let v00 = unit(hash2(seed, ix0, iy0));
    let v10 = unit(hash2(seed, ix1, iy0));
    let v01 = unit(hash2(seed, ix0, iy1));
    let v11 = unit(hash2(seed, ix1, iy1));
    let top = v00 + (v10 - v00) * tx;
    let bottom = v01 + (v11 - v01) * tx;
    top + (bottom - top) * ty
}

/// Octave cell-size multipliers and amplitudes.
const OCTAVES: [(f32, f32); 3] = [(1.0, 1.0), (2.0, 0.5), (4.0, 0.25)];

/// Square periodic grain plane with independent channels, normalized to
/// zero mean and unit standard deviation.
fn build_plane(size: u32, feature_px: f32, seed: u32) -> ImageBuffer {
    let plane = ImageBuffer::from_fn(size, size, ColorSpace::Linear, |x, y| {
        let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
        let mut out = [0.0f32; 3];
        for (c, value) in out.iter_mut().enumerate() {
            for (octave, &(mult, amp)) in OCTAVES.iter().enumerate() {
                let cells = ((size as f32 / (feature_px * mult)).round() as u32).max(1);
                let octave_seed = hash2(seed, c as u32, octave as u32);
                *value += amp * value_noise(octave_seed, px, py, cells, size);
            }
        }
        out
    });

    let mean = plane.mean();
    let n = plane.pixels().len().max(1) as f64;
    let mut var = [0.0f64; 3];
    for p in plane.pixels() {
        for c in 0..3 {
            let d = (p[c] - mean[c]) as f64;
            var[c] += d * d;
        }
    }
    let inv_std = var.map(|v| {
        let std = (v / n).sqrt();
        if std > 1e-12 {
            (1.0 / std) as f32
        } else {
            0.0
        }
    });
    plane.map(ColorSpace::Linear, move |p| {
        [
            (p[0] - mean[0]) * inv_std[0],
            (p[1] - mean[1]) * inv_std[1],
            (p[2] - mean[2]) * inv_std[2],
        ]
    })
}

/// Bilinear sample of a periodic square plane.
fn sample_periodic(plane: &ImageBuffer, x: f32, y: f32) -> [f32; 3] {
    let size = plane.width() as i64;
    let fx = x - 0.5;
    let fy = y - 0.5;
    let (x0, y0) = (fx.floor(), fy.floor());
    let (tx, ty) = (fx - x0, fy - y0);
    let xi0 = (x0 as i64).rem_euclid(size) as u32;
    let yi0 = (y0 as i64).rem_euclid(size) as u32;
    let xi1 = ((xi0 as i64 + 1) % size) as u32;
    let yi1 = ((yi0 as i64 + 1) % size) as u32;
    let top = color::lerp3(plane.pixel(xi0, yi0), plane.pixel(xi1, yi0), tx);
    let bottom = color::lerp3(plane.pixel(xi0, yi1), plane.pixel(xi1, yi1), tx);
    color::lerp3(top, bottom, ty)
}

// ============================================================================
// GrainPlate
// ============================================================================

/// Shadow and highlight base plates of one gate format.
#[derive(Debug, Clone)]
pub struct GrainPlate {
    pub format: GateFormat,
    pub native_long_edge: u32,
    pub size: u32,
    /// Grain feature size in plate pixels
    pub feature_px: f32,
    pub shadow: ImageBuffer,
    pub highlight: ImageBuffer,
}

/// Grain feature size in plate pixels for a gate.
///
/// The reference feature is measured on a `reference_long_edge` capture of a
/// `reference_gate_mm` gate; plates are authored against `base_length`, and a
/// smaller gate enlarges the grain by `reference_gate / gate`.
pub fn feature_size_px(calibration: &GrainCalibration, gate_mm: f32) -> f32 {
    let size = calibration.reference_feature_px * (calibration.base_length / calibration.reference_long_edge)
        * (calibration.reference_gate_mm / gate_mm.max(1e-3));
    size.clamp(1.0, calibration.plate_size as f32 / 4.0)
}

impl GrainPlate {
    pub fn build(calibration: &CalibrationTable, format: GateFormat, native_long_edge: u32, seed: u32) -> Self {
        let grain = &calibration.grain;
        let size = grain.plate_size;
        let feature = feature_size_px(grain, calibration.gate_width_mm(format));
        let key_seed = hash2(seed, format.index() as u32, native_long_edge);
        let max_feature = size as f32 / 4.0;
        Self {
            format,
            native_long_edge,
            size,
            feature_px: feature,
            shadow: build_plane(size, (feature * 1.6).min(max_feature), wang_hash(key_seed ^ 0x5ad0)),
            highlight: build_plane(size, (feature * 0.8).max(1.0), wang_hash(key_seed ^ 0x4141)),
        }
    }
}

// ============================================================================
// TileLayout
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct TileCopy {
    cx: f32,
    cy: f32,
    cos: f32,
    sin: f32,
    offset: [f32; 2],
}

/// Placement of plate copies over a frame.
#[derive(Debug, Clone)]
pub struct TileLayout {
    /// Tile side in frame pixels
    tile: f32,
    plate_size: u32,
    /// Feather band as a fraction of the tile side
    feather: f32,
    step: f32,
    origin: f32,
    reach: f32,
    cols: usize,
    rows: usize,
    copies: Vec<TileCopy>,
}

impl TileLayout {
    /// Lay out copies for a frame. `scale` is frame pixels per plate pixel.
    pub fn new(frame: FrameSize, scale: f32, calibration: &GrainCalibration, seed: u32) -> Self {
        let plate_size = calibration.plate_size;
        let tile = (plate_size as f32 * scale).max(1.0);
        let step = tile * calibration.step;
        let jitter = calibration.jitter * step;
        let origin = -tile;
        let cols = ((frame.width as f32 + 2.0 * tile) / step).ceil() as usize + 1;
        let rows = ((frame.height as f32 + 2.0 * tile) / step).ceil() as usize + 1;
        let max_angle = calibration.max_rotation_deg.to_radians();
        let max_offset = calibration.plate_offset * plate_size as f32;

        let mut copies = Vec::with_capacity(cols * rows);
        for j in 0..rows {
            for i in 0..cols {
                let h = |k: u32| unit(hash2(seed ^ k.wrapping_mul(0x0100_0193), i as u32, j as u32));
                let angle = h(1) * max_angle;
                copies.push(TileCopy {
                    cx: origin + i as f32 * step + tile / 2.0 + h(2) * jitter,
                    cy: origin + j as f32 * step + tile / 2.0 + h(3) * jitter,
                    cos: angle.cos(),
                    sin: angle.sin(),
                    offset: [h(4) * max_offset, h(5) * max_offset],
                });
            }
        }

        Self {
            tile,
            plate_size,
            feather: calibration.feather,
            step,
            origin,
            // Farthest a covered point can sit from a copy's nominal grid centre.
            reach: tile * std::f32::consts::FRAC_1_SQRT_2 + jitter,
            cols,
            rows,
            copies,
        }
    }

    pub fn tile_size(&self) -> f32 {
        self.tile
    }

    pub fn copy_count(&self) -> usize {
        self.copies.len()
    }

    fn candidates(&self, x: f32, y: f32) -> impl Iterator<Item = usize> + '_ {
        let index = |v: f32, n: usize| {
            let lo = ((v - self.reach - self.origin - self.tile / 2.0) / self.step).floor();
            let hi = ((v + self.reach - self.origin - self.tile / 2.0) / self.step).ceil();
            let clamp = |t: f32| (t.max(0.0) as usize).min(n.saturating_sub(1));
            clamp(lo)..=clamp(hi)
        };
        let xs = index(x, self.cols);
        let ys = index(y, self.rows);
        ys.flat_map(move |j| xs.clone().map(move |i| j * self.cols + i))
    }

    /// Edge weight and plate coordinates of a frame point within one copy.
    fn contribution(&self, copy: &TileCopy, x: f32, y: f32) -> Option<(f32, f32, f32)> {
        let (dx, dy) = (x - copy.cx, y - copy.cy);
        let lx = dx * copy.cos + dy * copy.sin;
        let ly = -dx * copy.sin + dy * copy.cos;
        let u = lx / self.tile + 0.5;
        let v = ly / self.tile + 0.5;
        if !(0.0..=1.0).contains(&u) || !(0.0..=1.0).contains(&v) {
            return None;
        }
        let edge = |t: f32| color::smoothstep(0.0, self.feather, t) * color::smoothstep(0.0, self.feather, 1.0 - t);
        let weight = edge(u) * edge(v);
        if weight <= 0.0 {
            return None;
        }
        let size = self.plate_size as f32;
        Some((weight, u * size + copy.offset[0], v * size + copy.offset[1]))
    }

    /// Normalized composite of every copy covering a frame point,
    /// optionally leaving one copy out.
    fn composite(&self, plane: &ImageBuffer, x: f32, y: f32, exclude: Option<usize>) -> [f32; 3] {
        let mut sum = [0.0f32; 3];
        let mut sum_sq = 0.0f32;
        for index in self.candidates(x, y) {
            if Some(index) == exclude {
                continue;
            }
            if let Some((w, px, py)) = self.contribution(&self.copies[index], x, y) {
                let n = sample_periodic(plane, px, py);
                sum[0] += w * n[0];
                sum[1] += w * n[1];
                sum[2] += w * n[2];
                sum_sq += w * w;
            }
        }
        if sum_sq <= 0.0 {
            return [0.0; 3];
        }
        let norm = sum_sq.sqrt().recip();
        sum.map(|s| s * norm)
    }

    /// Render the tiled field for the pixels of `extent` (frame coordinates).
    pub fn render(&self, plane: &ImageBuffer, frame: FrameSize, extent: Extent) -> ImageBuffer {
        ImageBuffer::from_fn(extent.width, extent.height, ColorSpace::Linear, |x, y| {
            let fx = (extent.x + x) as f32 + 0.5;
            let fy = (extent.y + y) as f32 + 0.5;
            self.composite(plane, fx, fy, None)
        })
        .placed_in_frame(frame, extent.x, extent.y)
    }
}

/// Value at the 2nd and 98th percentile of a plane's first channel.
fn contrast_range(plane: &ImageBuffer) -> f32 {
    let mut values: Vec<f32> = plane.pixels().iter().map(|p| p[0]).collect();
    values.sort_by(|a, b| a.total_cmp(b));
    let at = |q: f32| values[((values.len() - 1) as f32 * q).round() as usize];
    (at(0.98) - at(0.02)).max(1e-6)
}

// ============================================================================
// GrainSynthesizer
// ============================================================================

type PlateKey = (GateFormat, u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FieldKey {
    format: GateFormat,
    native_long_edge: u32,
    frame: FrameSize,
    extent: Extent,
    scale_bits: u32,
}

/// Tiled shadow and highlight grain for one render extent.
#[derive(Debug, Clone)]
pub struct GrainField {
    pub shadow: ImageBuffer,
    pub highlight: ImageBuffer,
}

/// Builds and caches grain plates and tiled fields.
pub struct GrainSynthesizer {
    calibration: Arc<CalibrationTable>,
    seed: u32,
    field_capacity: usize,
    plates: Mutex<HashMap<PlateKey, Arc<OnceLock<Arc<GrainPlate>>>>>,
    fields: Mutex<VecDeque<(FieldKey, Arc<GrainField>)>>,
    metrics: Arc<Metrics>,
}

impl GrainSynthesizer {
    pub fn new(calibration: Arc<CalibrationTable>, config: &PipelineConfig) -> Self {
        Self {
            calibration,
            seed: config.grain_seed,
            field_capacity: config.tiled_grain_cache,
            plates: Mutex::new(HashMap::new()),
            fields: Mutex::new(VecDeque::new()),
            metrics: Metrics::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Base plate for a format and native size, built on first use.
    ///
    /// Concurrent callers for the same key wait on one build; other keys
    /// proceed independently.
    pub fn plate(&self, format: GateFormat, native_long_edge: u32) -> Arc<GrainPlate> {
        let cell = {
            let mut plates = self.plates.lock().unwrap_or_else(|e| e.into_inner());
            plates.entry((format, native_long_edge)).or_default().clone()
        };
        if let Some(plate) = cell.get() {
            self.metrics.record_grain_hit();
            return plate.clone();
        }
        cell.get_or_init(|| {
            self.metrics.record_grain_miss();
            let timer = Timer::new();
            let plate = GrainPlate::build(&self.calibration, format, native_long_edge, self.seed);
            debug!(
                "Built {:?} grain plate ({} px, feature {:.2} px) in {} ms",
                format,
                plate.size,
                plate.feature_px,
                timer.elapsed_ms()
            );
            Arc::new(plate)
        })
        .clone()
    }

    /// Tiled grain covering `extent` of a frame, at `scale` frame pixels
    /// per plate pixel.
    pub fn field(&self, plate: &GrainPlate, frame: FrameSize, extent: Extent, scale: f32) -> Arc<GrainField> {
        let key = FieldKey {
            format: plate.format,
            native_long_edge: plate.native_long_edge,
            frame,
            extent,
            scale_bits: scale.to_bits(),
        };
        {
            let fields = self.fields.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((_, field)) = fields.iter().find(|(k, _)| *k == key) {
                self.metrics.record_grain_hit();
                return field.clone();
            }
        }
        self.metrics.record_grain_miss();

        let layout = TileLayout::new(frame, scale, &self.calibration.grain, wang_hash(self.seed ^ plate.format.index() as u32));
        let field = Arc::new(GrainField {
            shadow: layout.render(&plate.shadow, frame, extent),
            highlight: layout.render(&plate.highlight, frame, extent),
        });

        if self.field_capacity > 0 {
            let mut fields = self.fields.lock().unwrap_or_else(|e| e.into_inner());
            if !fields.iter().any(|(k, _)| *k == key) {
                fields.push_back((key, field.clone()));
                while fields.len() > self.field_capacity {
                    fields.pop_front();
                }
            }
        }
        field
    }

    /// Drop every cached plate and field of a format.
    pub fn invalidate(&self, format: GateFormat) {
        let mut plates = self.plates.lock().unwrap_or_else(|e| e.into_inner());
        plates.retain(|(f, _), _| *f != format);
        drop(plates);
        let mut fields = self.fields.lock().unwrap_or_else(|e| e.into_inner());
        fields.retain(|(k, _)| k.format != format);
        debug!("Invalidated {:?} grain cache", format);
    }

    pub fn cached_plates(&self) -> usize {
        let plates = self.plates.lock().unwrap_or_else(|e| e.into_inner());
        plates.values().filter(|cell| cell.get().is_some()).count()
    }

    /// Largest jump at copy edges, relative to the plate's 2–98% range.
    ///
    /// For copies well inside the frame, samples points just inside each
    /// copy's boundary and compares the composite with and without that copy.
    pub fn seam_discontinuity(&self, format: GateFormat, native_long_edge: u32, frame: FrameSize, scale: f32) -> f32 {
        let plate = self.plate(format, native_long_edge);
        let layout = TileLayout::new(frame, scale, &self.calibration.grain, wang_hash(self.seed ^ format.index() as u32));
        let contrast = contrast_range(&plate.shadow);
        let tile = layout.tile;
        let inset = 1.0;

        let mut worst = 0.0f32;
        for (index, copy) in layout.copies.iter().enumerate() {
            let inside = copy.cx - tile > 0.0
                && copy.cy - tile > 0.0
                && copy.cx + tile < frame.width as f32
                && copy.cy + tile < frame.height as f32;
            if !inside {
                continue;
            }
            const SAMPLES: usize = 32;
            for s in 0..SAMPLES {
                let t = (s as f32 + 0.5) / SAMPLES as f32 - 0.5;
                let half = tile / 2.0 - inset;
                for (lx, ly) in [(t * tile, -half), (t * tile, half), (-half, t * tile), (half, t * tile)] {
                    let x = copy.cx + lx * copy.cos - ly * copy.sin;
                    let y = copy.cy + lx * copy.sin + ly * copy.cos;
                    let with = layout.composite(&plate.shadow, x, y, None);
                    let without = layout.composite(&plate.shadow, x, y, Some(index));
                    let jump = (0..3).map(|c| (with[c] - without[c]).abs()).fold(0.0, f32::max);
                    worst = worst.max(jump / contrast);
                }
            }
        }
        worst
    }
}

// ============================================================================
// Grain operator
// ============================================================================

/// Soft-light grain in log space, shadow and highlight plates mixed by
/// luminance.
pub struct Grain;

/// Pegtop soft light of `blend` over `base`.
fn soft_light(base: f32, blend: f32) -> f32 {
    (1.0 - 2.0 * blend) * base * base + 2.0 * blend * base
}

impl Operator for Grain {
    fn name(&self) -> &'static str {
        "grain"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Log
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.apply_grain
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let calibration = &ctx.calibration.grain;
        let scale = input.frame().long_edge() as f32 / calibration.base_length * ctx.zoom;
        let plate = ctx.grain.plate(params.gate_format, ctx.source.native_long_edge());
        let field = ctx.grain.field(&plate, input.frame(), input.extent(), scale);

        let strength = calibration.strength;
        let amount = (params.grain_amount / 100.0).clamp(0.0, 1.0);
        let pixels: Vec<[f32; 3]> = input
            .pixels()
            .par_iter()
            .zip(field.shadow.pixels().par_iter())
            .zip(field.highlight.pixels().par_iter())
            .map(|((&p, s), h)| {
                let l = color::luminance(p).clamp(0.0, 1.0);
                let mut out = p;
                for c in 0..3 {
                    let g = (1.0 - l) * s[c] + l * h[c];
                    let grained = soft_light(p[c], 0.5 + strength * g);
                    out[c] = p[c] + (grained - p[c]) * amount;
                }
                out
            })
            .collect();
        Ok(ImageBuffer::new(input.width(), input.height(), ColorSpace::Log, pixels)?
            .placed_in_frame(input.frame(), input.extent().x, input.extent().y))
    }
}
