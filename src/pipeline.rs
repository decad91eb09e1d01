//! Pipeline executor
//!
//! Owns the fixed stage order and the color-space conversions between
//! stages. Maskable stages are routed through the [`MaskCompositor`]; the
//! rest run once with the global parameters.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use colorforge::pipeline::PipelineExecutor;
//!
//! let executor = PipelineExecutor::new(Arc::new(CalibrationTable::default()), PipelineConfig::default());
//! let report = executor.render(&linear_input, &job, 1.0)?;
//! let display = report.image;
//! ```

use crate::buffer::{ColorSpace, ImageBuffer};
use crate::color::{self, P3_TO_AWG};
use crate::config::{CalibrationTable, PipelineConfig};
use crate::error::{ForgeError, Result};
use crate::grain::{Grain, GrainSynthesizer};
use crate::lut::LutBank;
use crate::mask::MaskCompositor;
use crate::metrics::{Metrics, Timer};
use crate::operators::negative::awg_to_display;
use crate::operators::scan::scan_to_display;
use crate::operators::*;
use crate::params::{ParameterSet, RenderJob, SourceInfo};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Bumped whenever stages or conversion points move.
pub const STAGE_ORDER_VERSION: u32 = 3;

// ============================================================================
// Stage order
// ============================================================================

/// Color-space conversion inserted by the executor between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// Camera P3 primaries → ARRI Wide Gamut, stays linear
    P3ToAwg,
    LinearToLog,
    LogToSpherical,
    SphericalToLog,
    /// Scanned negative densities → display, scan path only
    ScanToDisplay,
    /// Whatever space the chain ended in → display
    OutputTransform,
}

impl Conversion {
    pub fn name(&self) -> &'static str {
        match self {
            Conversion::P3ToAwg => "p3_to_awg",
            Conversion::LinearToLog => "linear_to_log",
            Conversion::LogToSpherical => "log_to_spherical",
            Conversion::SphericalToLog => "spherical_to_log",
            Conversion::ScanToDisplay => "scan_to_display",
            Conversion::OutputTransform => "output_transform",
        }
    }
}

/// One entry of the stage order.
#[derive(Clone, Copy)]
pub enum Stage {
    Node {
        op: &'static dyn Operator,
        maskable: bool,
    },
    Convert(Conversion),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Node { op, .. } => op.name(),
            Stage::Convert(conversion) => conversion.name(),
        }
    }

    pub fn is_maskable(&self) -> bool {
        matches!(self, Stage::Node { maskable: true, .. })
    }
}

const fn node(op: &'static dyn Operator) -> Stage {
    Stage::Node { op, maskable: false }
}

const fn masked(op: &'static dyn Operator) -> Stage {
    Stage::Node { op, maskable: true }
}

pub const STAGE_ORDER: [Stage; 28] = [
    masked(&TempTint),
    Stage::Convert(Conversion::P3ToAwg),
    masked(&Exposure),
    Stage::Convert(Conversion::LinearToLog),
    masked(&Contrast),
    Stage::Convert(Conversion::LogToSpherical),
    masked(&Saturation),
    Stage::Convert(Conversion::SphericalToLog),
    masked(&Hdr),
    Stage::Convert(Conversion::LogToSpherical),
    masked(&Hsd),
    Stage::Convert(Conversion::SphericalToLog),
    node(&Mtf),
    node(&Grain),
    node(&FilmStockLut),
    node(&DecodeNegative),
    node(&Paper),
    node(&ScanOffset),
    Stage::Convert(Conversion::ScanToDisplay),
    node(&PrintFilmLut),
    node(&ScanContrast),
    masked(&Enlarger),
    masked(&PrintHalation),
    node(&Flash),
    node(&PrintGamut),
    masked(&BwEnlarger),
    node(&OutputCurve),
    Stage::Convert(Conversion::OutputTransform),
];

/// Apply an executor conversion. Conversions that do not match the
/// buffer's current space leave it alone.
pub fn convert(image: &ImageBuffer, conversion: Conversion, params: &ParameterSet) -> ImageBuffer {
    use ColorSpace::*;
    match (conversion, image.space()) {
        (Conversion::P3ToAwg, Linear) => image.map(Linear, |p| color::apply_matrix(&P3_TO_AWG, p)),
        (Conversion::LinearToLog, Linear) => image.map(Log, color::logc_encode_rgb),
        (Conversion::LogToSpherical, Log) => image.map(Spherical, color::rgb_to_spherical),
        (Conversion::SphericalToLog, Spherical) => image.map(Log, color::spherical_to_rgb),
        (Conversion::ScanToDisplay, Density) if params.scanning() => {
            let stock = params.stock;
            image.map(Display, move |p| scan_to_display(p, stock))
        }
        (Conversion::OutputTransform, space) => to_display(image, space, params),
        _ => image.clone(),
    }
}

fn to_display(image: &ImageBuffer, space: ColorSpace, params: &ParameterSet) -> ImageBuffer {
    use ColorSpace::*;
    match space {
        Display => image.clone(),
        Linear => image.map(Display, awg_to_display),
        Log => image.map(Display, |p| awg_to_display(color::logc_decode_rgb(p))),
        Spherical => image.map(Display, |p| awg_to_display(color::logc_decode_rgb(color::spherical_to_rgb(p)))),
        Density => {
            let stock = params.stock;
            image.map(Display, move |p| scan_to_display(p, stock))
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Outcome of one render.
#[derive(Debug, Clone)]
pub struct RenderReport {
    /// Display-encoded result with the input's extent
    pub image: ImageBuffer,
    /// Nodes that ran with at least one enabling parameter set
    pub stages_applied: Vec<&'static str>,
    /// Nodes skipped because an earlier fallback left the wrong space
    pub stages_skipped: Vec<&'static str>,
    pub regions_composited: usize,
    pub cache_barriers: usize,
    pub elapsed_ms: u64,
}

/// Runs the stage order over one image with shared services.
#[derive(Clone)]
pub struct PipelineExecutor {
    calibration: Arc<CalibrationTable>,
    luts: Arc<LutBank>,
    grain: Arc<GrainSynthesizer>,
    metrics: Arc<Metrics>,
    config: PipelineConfig,
}

impl PipelineExecutor {
    pub fn new(calibration: Arc<CalibrationTable>, config: PipelineConfig) -> Self {
        let metrics = Metrics::new();
        Self {
            luts: Arc::new(LutBank::procedural(config.lut_size)),
            grain: Arc::new(GrainSynthesizer::new(calibration.clone(), &config).with_metrics(metrics.clone())),
            calibration,
            metrics,
            config,
        }
    }

    /// Replace the LUT bank, e.g. with `.cube` files loaded from disk.
    pub fn with_luts(mut self, luts: LutBank) -> Self {
        self.luts = Arc::new(luts);
        self
    }

    /// Share a metrics collector; the grain cache reports into it too.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.grain = Arc::new(GrainSynthesizer::new(self.calibration.clone(), &self.config).with_metrics(metrics.clone()));
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn calibration(&self) -> &Arc<CalibrationTable> {
        &self.calibration
    }

    pub fn grain(&self) -> &Arc<GrainSynthesizer> {
        &self.grain
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn context(&self, source: SourceInfo, zoom: f32) -> RenderContext {
        RenderContext {
            calibration: self.calibration.clone(),
            luts: self.luts.clone(),
            grain: self.grain.clone(),
            metrics: self.metrics.clone(),
            source,
            zoom: 1.0,
            export: false,
        }
        .with_zoom(zoom)
    }

    /// Render a linear input through the full stage order.
    ///
    /// Stage failures are absorbed; only an unusable input is an error.
    pub fn render(&self, input: &ImageBuffer, job: &RenderJob, zoom: f32) -> Result<RenderReport> {
        self.render_with(input, job, self.context(job.source, zoom))
    }

    /// Full-quality render for export.
    pub fn render_export(&self, input: &ImageBuffer, job: &RenderJob) -> Result<RenderReport> {
        let ctx = RenderContext {
            export: true,
            ..self.context(job.source, 1.0)
        };
        self.render_with(input, job, ctx)
    }

    fn render_with(&self, input: &ImageBuffer, job: &RenderJob, ctx: RenderContext) -> Result<RenderReport> {
        if input.space() != ColorSpace::Linear {
            return Err(ForgeError::ValidationError(format!(
                "Pipeline input for {} must be linear, got {:?}",
                job.id,
                input.space()
            )));
        }

        let timer = Timer::new();
        let compositor = MaskCompositor::new(&job.regions, &job.region_params);
        let mut image = input.clone();
        let mut report = RenderReport {
            image: input.clone(),
            stages_applied: Vec::new(),
            stages_skipped: Vec::new(),
            regions_composited: 0,
            cache_barriers: 0,
            elapsed_ms: 0,
        };

        for stage in STAGE_ORDER.iter() {
            match *stage {
                Stage::Convert(conversion) => {
                    image = convert(&image, conversion, &job.global);
                }
                Stage::Node { op, maskable } => {
                    let masked = maskable && compositor.region_count() > 0;
                    let enabled = op.is_enabled(&job.global)
                        || (masked && job.region_params.values().any(|p| op.is_enabled(p)));
                    if !enabled {
                        continue;
                    }
                    if image.space() != op.input_space() {
                        warn!(
                            "⚠️ {} skipped for {}: expected {:?}, buffer is {:?}",
                            op.name(),
                            job.id,
                            op.input_space(),
                            image.space()
                        );
                        report.stages_skipped.push(op.name());
                        continue;
                    }

                    if masked {
                        let composite = compositor.composite(op, &image, &job.global, &ctx);
                        report.regions_composited += composite.regions_applied;
                        image = composite.image;
                        if composite.regions_applied > 1 {
                            report.cache_barriers += 1;
                            self.metrics.record_cache_barrier();
                            trace!("Cache barrier after {} ({} regions)", op.name(), composite.regions_applied);
                        }
                    } else {
                        image = run(op, &image, &job.global, &ctx);
                    }
                    report.stages_applied.push(op.name());
                }
            }
        }

        report.elapsed_ms = timer.elapsed_ms();
        debug!(
            "Rendered {} ({}x{}) through {} stages in {} ms",
            job.id,
            image.width(),
            image.height(),
            report.stages_applied.len(),
            report.elapsed_ms
        );
        report.image = image;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Point, RegionGeometry};

    fn executor() -> PipelineExecutor {
        PipelineExecutor::new(Arc::new(CalibrationTable::default()), PipelineConfig::default())
    }

    fn gray(width: u32, height: u32) -> ImageBuffer {
        ImageBuffer::filled(width, height, ColorSpace::Linear, [0.18; 3])
    }

    #[test]
    fn test_stage_order_shape() {
        assert_eq!(STAGE_ORDER.len(), 28);
        let maskable: Vec<_> = STAGE_ORDER.iter().filter(|s| s.is_maskable()).map(|s| s.name()).collect();
        assert_eq!(
            maskable,
            vec![
                "temp_tint",
                "exposure",
                "contrast",
                "saturation",
                "hdr",
                "hsd",
                "enlarger",
                "print_halation",
                "bw_enlarger"
            ]
        );
        assert_eq!(STAGE_ORDER[27].name(), "output_transform");
    }

    #[test]
    fn test_every_path_ends_in_display() {
        let executor = executor();
        let input = gray(24, 16);
        let presets = [
            ParameterSet::default(),
            ParameterSet::print_preset(),
            ParameterSet::scan_preset(),
            ParameterSet {
                bw_mode: true,
                ..ParameterSet::print_preset()
            },
            ParameterSet {
                convert_to_neg: true,
                ..Default::default()
            },
        ];
        for params in presets {
            let job = RenderJob::new("gray", SourceInfo::with_native_size(24, 16), params);
            let report = executor.render(&input, &job, 1.0).unwrap();
            assert_eq!(report.image.space(), ColorSpace::Display);
            assert_eq!(report.image.extent(), input.extent());
            assert!(report.stages_skipped.is_empty(), "{:?}", report.stages_skipped);
            assert!(report.image.pixels().iter().all(|p| p.iter().all(|c| c.is_finite())));
        }
    }

    #[test]
    fn test_rejects_non_linear_input() {
        let job = RenderJob::new("x", SourceInfo::default(), ParameterSet::default());
        let input = ImageBuffer::filled(4, 4, ColorSpace::Display, [0.5; 3]);
        assert!(executor().render(&input, &job, 1.0).is_err());
    }

    #[test]
    fn test_log_round_trip_is_lossless() {
        let params = ParameterSet::default();
        let input = ImageBuffer::from_fn(16, 8, ColorSpace::Linear, |x, y| {
            [0.01 + x as f32 * 0.05, 0.02 + y as f32 * 0.1, 0.3]
        });
        let log = convert(&input, Conversion::LinearToLog, &params);
        let back = log.map(ColorSpace::Linear, color::logc_decode_rgb);
        assert!(back.max_abs_diff(&input) < 1e-5);

        let sph = convert(&log, Conversion::LogToSpherical, &params);
        let log_again = convert(&sph, Conversion::SphericalToLog, &params);
        assert!(log_again.max_abs_diff(&log) < 1e-5);
    }

    #[test]
    fn test_conversion_ignores_mismatched_space() {
        let input = ImageBuffer::filled(2, 2, ColorSpace::Display, [0.5; 3]);
        let out = convert(&input, Conversion::LinearToLog, &ParameterSet::default());
        assert!(out.shares_pixels(&input));
    }

    #[test]
    fn test_barrier_counted_for_multiple_regions() {
        let executor = executor();
        let mut job = RenderJob::new("regions", SourceInfo::with_native_size(32, 32), ParameterSet::default());
        for (id, x) in [(1, 0.25), (2, 0.75)] {
            job.regions.push(crate::params::Region {
                id,
                geometry: RegionGeometry::radial(Point::new(x, 0.5), 0.4, 0.4, 20.0),
            });
            job.region_params.insert(
                id,
                ParameterSet {
                    exposure: 1.0,
                    ..Default::default()
                },
            );
        }
        let report = executor.render(&gray(32, 32), &job, 1.0).unwrap();
        // Every maskable stage enabled by default sees both regions
        assert_eq!(report.cache_barriers, 6);
        assert_eq!(report.regions_composited, 12);
        assert_eq!(executor.metrics().snapshot().pipeline.cache_barriers, 6);
    }
}
