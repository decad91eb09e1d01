//! Export and thumbnails
//!
//! Writes display-encoded renders to disk. WEBP goes straight through
//! libwebp, the other formats through the `image` crate. Thumbnails are
//! resized with `fast_image_resize`.
//!
//! Original-file metadata (EXIF/GPS/IPTC) is never parsed: the bytes are
//! written unchanged to a `<output>.meta` sidecar next to the image.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use colorforge::export::{Exporter, ExportConfig, ExportFormat};
//!
//! let exporter = Exporter::new(ExportConfig { format: ExportFormat::Webp, ..Default::default() });
//! let summary = exporter.write(&display, "print.webp", Some(&exif_bytes), &job)?;
//! ```

use crate::buffer::{ColorSpace, ImageBuffer};
use crate::error::{ForgeError, Result};
use crate::params::{ParameterSet, RenderJob};
use crate::pipeline::STAGE_ORDER_VERSION;
use fast_image_resize as fr;
use fr::images::Image as FrImage;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Jpeg,
    Png,
    Webp,
    Tiff,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Jpeg => "jpg",
            ExportFormat::Png => "png",
            ExportFormat::Webp => "webp",
            ExportFormat::Tiff => "tif",
        }
    }

    /// Guess the format from a path's extension.
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let ext = path.as_ref().extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(ExportFormat::Jpeg),
            "png" => Some(ExportFormat::Png),
            "webp" => Some(ExportFormat::Webp),
            "tif" | "tiff" => Some(ExportFormat::Tiff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub format: ExportFormat,
    /// 1-100 for JPEG/WEBP
    pub quality: u8,
    /// Also write `<stem>_thumb.<ext>` with this long edge
    pub thumbnail_long_edge: Option<u32>,
    /// Write the `<output>.json` settings sidecar
    pub write_settings_sidecar: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            format: ExportFormat::Jpeg,
            quality: 92,
            thumbnail_long_edge: None,
            write_settings_sidecar: true,
        }
    }
}

/// JSON written next to an export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSidecar {
    pub image_id: String,
    pub width: u32,
    pub height: u32,
    pub format: ExportFormat,
    pub stage_order_version: u32,
    pub exported_at: String,
    pub params: ParameterSet,
    pub region_count: usize,
}

/// Files produced by one export.
#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub output: PathBuf,
    pub thumbnail: Option<PathBuf>,
    pub metadata: Option<PathBuf>,
    pub sidecar: Option<PathBuf>,
    pub bytes: u64,
}

/// Downscale a display buffer to `long_edge` with SIMD resizing.
pub fn thumbnail(image: &ImageBuffer, long_edge: u32) -> Result<RgbImage> {
    let rgb = image.to_rgb8();
    let (src_w, src_h) = rgb.dimensions();
    let (dst_w, dst_h) = crate::buffer::fit_long_edge(src_w, src_h, long_edge.min(src_w.max(src_h)));

    let src_image = FrImage::from_vec_u8(src_w, src_h, rgb.into_raw(), fr::PixelType::U8x3)
        .map_err(|e| ForgeError::ProcessingError(format!("Failed to create source image: {:?}", e)))?;
    let mut dst_image = FrImage::new(dst_w, dst_h, src_image.pixel_type());

    let mut resizer = fr::Resizer::new();
    resizer
        .resize(&src_image, &mut dst_image, None)
        .map_err(|e| ForgeError::ProcessingError(format!("Resize failed: {:?}", e)))?;

    RgbImage::from_raw(dst_w, dst_h, dst_image.buffer().to_vec())
        .ok_or_else(|| ForgeError::ProcessingError("Failed to create image from resized data".to_string()))
}

/// `<dir>/<stem>_thumb.<ext>`
fn thumbnail_path(output: &Path, format: ExportFormat) -> PathBuf {
    let stem = output.file_stem().and_then(|s| s.to_str()).unwrap_or("export");
    output.with_file_name(format!("{}_thumb.{}", stem, format.extension()))
}

/// `<output>.<suffix>`, keeping the original extension.
fn sidecar_path(output: &Path, suffix: &str) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

pub struct Exporter {
    config: ExportConfig,
}

impl Exporter {
    pub fn new(config: ExportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    fn encode(&self, img: &RgbImage, path: &Path) -> Result<()> {
        match self.config.format {
            ExportFormat::Webp => {
                // Direct libwebp encoding
                let encoder = webp::Encoder::from_rgb(img.as_raw(), img.width(), img.height());
                let webp_data = encoder.encode(self.config.quality as f32);
                std::fs::write(path, &*webp_data)?;
            }
            ExportFormat::Jpeg => {
                let writer = BufWriter::new(File::create(path)?);
                let mut encoder = JpegEncoder::new_with_quality(writer, self.config.quality.clamp(1, 100));
                encoder.encode_image(img)?;
            }
            ExportFormat::Png | ExportFormat::Tiff => {
                let format = match self.config.format {
                    ExportFormat::Png => ImageFormat::Png,
                    _ => ImageFormat::Tiff,
                };
                DynamicImage::ImageRgb8(img.clone()).save_with_format(path, format)?;
            }
        }
        Ok(())
    }

    /// Write a display-encoded render plus its sidecars.
    pub fn write(
        &self,
        image: &ImageBuffer,
        output: impl AsRef<Path>,
        metadata: Option<&[u8]>,
        job: &RenderJob,
    ) -> Result<ExportSummary> {
        let output = output.as_ref();
        if image.space() != ColorSpace::Display {
            return Err(ForgeError::ValidationError(format!(
                "Export expects a display-encoded buffer, got {:?}",
                image.space()
            )));
        }
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let rgb = image.to_rgb8();
        self.encode(&rgb, output)?;
        let bytes = std::fs::metadata(output)?.len();
        debug!("Wrote {} ({} bytes)", output.display(), bytes);

        let thumbnail = match self.config.thumbnail_long_edge {
            Some(long_edge) => {
                let thumb = thumbnail(image, long_edge)?;
                let path = thumbnail_path(output, self.config.format);
                self.encode(&thumb, &path)?;
                Some(path)
            }
            None => None,
        };

        let metadata = match metadata {
            Some(blob) => {
                let path = sidecar_path(output, "meta");
                std::fs::write(&path, blob)?;
                Some(path)
            }
            None => None,
        };

        let sidecar = if self.config.write_settings_sidecar {
            let record = ExportSidecar {
                image_id: job.id.to_string(),
                width: image.width(),
                height: image.height(),
                format: self.config.format,
                stage_order_version: STAGE_ORDER_VERSION,
                exported_at: chrono::Utc::now().to_rfc3339(),
                params: job.global.clone(),
                region_count: job.regions.len(),
            };
            let path = sidecar_path(output, "json");
            std::fs::write(&path, serde_json::to_vec_pretty(&record)?)?;
            Some(path)
        } else {
            None
        };

        info!(
            "💾 Exported {} → {} ({}x{}, {:?})",
            job.id,
            output.display(),
            image.width(),
            image.height(),
            self.config.format
        );

        Ok(ExportSummary {
            output: output.to_path_buf(),
            thumbnail,
            metadata,
            sidecar,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::SourceInfo;
    use tempfile::tempdir;

    fn display(width: u32, height: u32) -> ImageBuffer {
        ImageBuffer::from_fn(width, height, ColorSpace::Display, |x, y| {
            [x as f32 / width as f32, y as f32 / height as f32, 0.5]
        })
    }

    #[test]
    fn test_thumbnail_keeps_aspect() {
        let thumb = thumbnail(&display(200, 100), 50).unwrap();
        assert_eq!(thumb.dimensions(), (50, 25));
    }

    #[test]
    fn test_thumbnail_never_upscales() {
        let thumb = thumbnail(&display(40, 20), 500).unwrap();
        assert_eq!(thumb.dimensions(), (40, 20));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ExportFormat::from_path("a/b.JPEG"), Some(ExportFormat::Jpeg));
        assert_eq!(ExportFormat::from_path("x.tiff"), Some(ExportFormat::Tiff));
        assert_eq!(ExportFormat::from_path("x.gif"), None);
    }

    #[test]
    fn test_write_carries_metadata_untouched() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("print.png");
        let exporter = Exporter::new(ExportConfig {
            format: ExportFormat::Png,
            thumbnail_long_edge: Some(16),
            ..Default::default()
        });
        let job = RenderJob::new("print", SourceInfo::default(), ParameterSet::print_preset());
        let blob = [0x45u8, 0x78, 0x69, 0x66, 0x00, 0x00, 0xff];

        let summary = exporter.write(&display(64, 32), &output, Some(&blob[..]), &job).unwrap();
        assert!(summary.bytes > 0);
        assert_eq!(image::open(&output).unwrap().width(), 64);
        assert_eq!(image::open(summary.thumbnail.unwrap()).unwrap().width(), 16);
        assert_eq!(std::fs::read(summary.metadata.unwrap()).unwrap(), blob);

        let sidecar: ExportSidecar = serde_json::from_slice(&std::fs::read(summary.sidecar.unwrap()).unwrap()).unwrap();
        assert_eq!(sidecar.image_id, "print");
        assert_eq!(sidecar.stage_order_version, STAGE_ORDER_VERSION);
        assert!(sidecar.params.convert_to_neg);
    }

    #[test]
    fn test_rejects_non_display_buffer() {
        let dir = tempdir().unwrap();
        let exporter = Exporter::new(ExportConfig::default());
        let job = RenderJob::new("x", SourceInfo::default(), ParameterSet::default());
        let linear = ImageBuffer::filled(4, 4, ColorSpace::Linear, [0.2; 3]);
        assert!(exporter.write(&linear, dir.path().join("x.jpg"), None, &job).is_err());
    }
}
