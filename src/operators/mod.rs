//! Operator nodes
//!
//! Every stage of the print pipeline is a small struct implementing
//! [`Operator`]. Nodes are pure: they read one [`ParameterSet`] and one
//! input buffer and return a new buffer of the same extent.
//!
//! Callers go through [`run`], which
//! 1. returns the input untouched when the node is disabled,
//! 2. asserts the input color space in debug builds,
//! 3. falls back to the input (with a warning) when the node errors,
//!    panics, or breaks the extent contract.

pub mod enlarger;
pub mod negative;
pub mod print;
pub mod raw;
pub mod scan;
pub mod texture;

use crate::buffer::{ColorSpace, ImageBuffer};
use crate::config::CalibrationTable;
use crate::error::Result;
use crate::grain::GrainSynthesizer;
use crate::lut::LutBank;
use crate::metrics::Metrics;
use crate::params::{ParameterSet, SourceInfo};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

pub use enlarger::{BwEnlarger, Enlarger};
pub use negative::{DecodeNegative, FilmStockLut, Paper};
pub use print::{Flash, OutputCurve, PrintGamut, PrintHalation};
pub use raw::{Contrast, Exposure, Hdr, Hsd, Saturation, TempTint};
pub use scan::{PrintFilmLut, ScanContrast, ScanOffset};
pub use texture::Mtf;

/// Shared services and view state for one render.
#[derive(Clone)]
pub struct RenderContext {
    pub calibration: Arc<CalibrationTable>,
    pub luts: Arc<LutBank>,
    pub grain: Arc<GrainSynthesizer>,
    pub metrics: Arc<Metrics>,
    pub source: SourceInfo,
    /// View magnification of the rendered buffer relative to its frame
    pub zoom: f32,
    pub export: bool,
}

impl RenderContext {
    /// Context backed by freshly built default services.
    pub fn detached(source: SourceInfo) -> Self {
        let calibration = Arc::new(CalibrationTable::default());
        let config = crate::config::PipelineConfig::default();
        let metrics = Metrics::new();
        Self {
            luts: Arc::new(LutBank::procedural(config.lut_size)),
            grain: Arc::new(GrainSynthesizer::new(calibration.clone(), &config).with_metrics(metrics.clone())),
            metrics,
            calibration,
            source,
            zoom: 1.0,
            export: false,
        }
    }

    pub fn with_zoom(mut self, zoom: f32) -> Self {
        self.zoom = zoom.max(1e-3);
        self
    }

    /// Ratio of the buffer's frame to the native capture.
    pub fn ui_scalar(&self, input: &ImageBuffer) -> f32 {
        input.frame().long_edge() as f32 / self.source.native_long_edge() as f32
    }
}

/// A single pipeline stage.
pub trait Operator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Color space the node expects on input.
    fn input_space(&self) -> ColorSpace;

    /// Color space the node produces when enabled.
    fn output_space(&self) -> ColorSpace {
        self.input_space()
    }

    /// Enable flag plus governing preconditions.
    fn is_enabled(&self, params: &ParameterSet) -> bool;

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer>;
}

/// Run a node with the common no-op and fallback rules.
pub fn run(op: &dyn Operator, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> ImageBuffer {
    if !op.is_enabled(params) {
        return input.clone();
    }
    debug_assert_eq!(
        input.space(),
        op.input_space(),
        "{} expects {:?} input",
        op.name(),
        op.input_space()
    );

    let outcome = catch_unwind(AssertUnwindSafe(|| op.apply(input, params, ctx)));
    let reason = match outcome {
        Ok(Ok(output)) if output.extent() == input.extent() && output.frame() == input.frame() => {
            return output;
        }
        Ok(Ok(output)) => format!("extent changed from {:?} to {:?}", input.extent(), output.extent()),
        Ok(Err(e)) => e.to_string(),
        Err(_) => "panicked".to_string(),
    };

    warn!("⚠️ {} failed ({}), passing input through", op.name(), reason);
    ctx.metrics.record_stage_fallback();
    input.clone()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Every node with a parameter set that enables it.
    pub fn enabled_nodes() -> Vec<(Box<dyn Operator>, ParameterSet)> {
        let print = ParameterSet::print_preset();
        let scan = ParameterSet::scan_preset();
        let bw = ParameterSet {
            bw_mode: true,
            ..ParameterSet::print_preset()
        };
        vec![
            (Box::new(TempTint), ParameterSet { temperature: 7000.0, ..Default::default() }),
            (Box::new(Exposure), ParameterSet { exposure: 1.0, ..Default::default() }),
            (Box::new(Contrast), ParameterSet { contrast: 40.0, ..Default::default() }),
            (Box::new(Saturation), ParameterSet { saturation: 40.0, ..Default::default() }),
            (Box::new(Hdr), ParameterSet { hdr_shadow: 50.0, ..Default::default() }),
            (Box::new(Hsd), ParameterSet { hsd_hue: [50.0; 6], ..Default::default() }),
            (Box::new(Mtf), ParameterSet { apply_mtf: true, ..Default::default() }),
            (Box::new(crate::grain::Grain), ParameterSet { apply_grain: true, ..Default::default() }),
            (Box::new(FilmStockLut), print.clone()),
            (Box::new(DecodeNegative), print.clone()),
            (Box::new(Paper), print.clone()),
            (Box::new(ScanOffset), ParameterSet { offset_red: 20.0, ..scan.clone() }),
            (Box::new(PrintFilmLut), ParameterSet { apply_print_film_lut: true, ..scan.clone() }),
            (Box::new(ScanContrast), ParameterSet { scan_contrast: 30.0, ..scan }),
            (Box::new(Enlarger), ParameterSet { cyan: 20.0, ..print.clone() }),
            (Box::new(PrintHalation), ParameterSet { print_halation_apply: true, ..print.clone() }),
            (Box::new(Flash), ParameterSet { apply_flash: true, ..print.clone() }),
            (Box::new(PrintGamut), print.clone()),
            (Box::new(BwEnlarger), bw),
            (Box::new(OutputCurve), print),
        ]
    }

    /// Disable a node by flipping its enable flag or governing precondition.
    pub fn disabled(op: &dyn Operator, params: &ParameterSet) -> ParameterSet {
        let mut p = params.clone();
        match op.name() {
            "temp_tint" => p.apply_temp_tint = false,
            "exposure" => p.apply_exposure = false,
            "contrast" => p.apply_contrast = false,
            "saturation" => p.apply_saturation = false,
            "hdr" => p.apply_hdr = false,
            "hsd" => p.apply_hsd = false,
            "mtf" => p.apply_mtf = false,
            "grain" => p.apply_grain = false,
            "print_halation" => p.print_halation_apply = false,
            "flash" => p.apply_flash = false,
            "print_film_lut" => p.apply_print_film_lut = false,
            "output_curve" => p.apply_output_curve = false,
            _ => p.convert_to_neg = false,
        }
        p
    }

    pub fn sample_input(space: ColorSpace) -> ImageBuffer {
        ImageBuffer::from_fn(48, 32, space, |x, y| {
            let u = x as f32 / 47.0;
            let v = y as f32 / 31.0;
            [0.15 + 0.6 * u, 0.2 + 0.5 * v, 0.35 + 0.3 * (1.0 - u)]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::error::ForgeError;

    struct Failing;

    impl Operator for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn input_space(&self) -> ColorSpace {
            ColorSpace::Linear
        }
        fn is_enabled(&self, _params: &ParameterSet) -> bool {
            true
        }
        fn apply(&self, _input: &ImageBuffer, _params: &ParameterSet, _ctx: &RenderContext) -> Result<ImageBuffer> {
            Err(ForgeError::ProcessingError("kernel unavailable".to_string()))
        }
    }

    struct Shrinking;

    impl Operator for Shrinking {
        fn name(&self) -> &'static str {
            "shrinking"
        }
        fn input_space(&self) -> ColorSpace {
            ColorSpace::Linear
        }
        fn is_enabled(&self, _params: &ParameterSet) -> bool {
            true
        }
        fn apply(&self, input: &ImageBuffer, _params: &ParameterSet, _ctx: &RenderContext) -> Result<ImageBuffer> {
            Ok(input.resize(input.width() / 2, input.height() / 2))
        }
    }

    #[test]
    fn test_disabled_nodes_are_identity() {
        let ctx = RenderContext::detached(SourceInfo::default());
        for (op, params) in enabled_nodes() {
            let input = sample_input(op.input_space());
            let off = disabled(op.as_ref(), &params);
            assert!(!op.is_enabled(&off), "{} still enabled", op.name());
            let out = run(op.as_ref(), &input, &off, &ctx);
            assert_eq!(out.extent(), input.extent(), "{}", op.name());
            assert_eq!(out.space(), input.space(), "{}", op.name());
            assert!(out.max_abs_diff(&input) <= 1e-6, "{} changed pixels", op.name());
        }
    }

    #[test]
    fn test_enabled_nodes_preserve_extent() {
        let ctx = RenderContext::detached(SourceInfo::with_native_size(480, 320));
        for (op, params) in enabled_nodes() {
            let input = sample_input(op.input_space());
            assert!(op.is_enabled(&params), "{} not enabled", op.name());
            let out = run(op.as_ref(), &input, &params, &ctx);
            assert_eq!(out.extent(), input.extent(), "{}", op.name());
            assert_eq!(out.space(), op.output_space(), "{}", op.name());
            assert!(out.pixels().iter().all(|p| p.iter().all(|c| c.is_finite())), "{}", op.name());
        }
    }

    #[test]
    fn test_failures_fall_back_to_input() {
        let ctx = RenderContext::detached(SourceInfo::default());
        let input = sample_input(ColorSpace::Linear);
        let params = ParameterSet::default();

        let out = run(&Failing, &input, &params, &ctx);
        assert!(out.shares_pixels(&input));
        let out = run(&Shrinking, &input, &params, &ctx);
        assert!(out.shares_pixels(&input));
        assert_eq!(ctx.metrics.snapshot().pipeline.stage_fallbacks, 2);
    }
}
