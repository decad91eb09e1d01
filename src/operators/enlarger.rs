//! Darkroom enlarger: color-head filtration and multigrade black-and-white.
//!
//! Both nodes work on the decoded positive in linear light. Filtration on
//! the color head acts on the complementary paper layer: cyan filtration
//! controls red, magenta green and yellow blue.

use super::{Operator, RenderContext};
use crate::buffer::{ColorSpace, ImageBuffer};
use crate::color;
use crate::config::EnlargerCalibration;
use crate::error::Result;
use crate::params::ParameterSet;

/// Per-channel print gain for a filter pack and exposure.
///
/// `gain_c = cc(offset_c) / cc(value_c + offset_c) · 2^−ev`
pub fn filtration_gains(calibration: &EnlargerCalibration, filters: [f32; 3], ev: f32) -> [f32; 3] {
    let exposure = color::ev_to_gain(-ev);
    let mut gains = [0.0f32; 3];
    for c in 0..3 {
        let k = calibration.density_per_unit[c];
        let dmax = calibration.paper_dmax[c];
        let offset = calibration.pack_offsets[c];
        let reference = color::filtration_gain(offset, k, dmax);
        let filtered = color::filtration_gain(filters[c] + offset, k, dmax);
        gains[c] = reference / filtered.max(1e-9) * exposure;
    }
    gains
}

pub struct Enlarger;

impl Operator for Enlarger {
    fn name(&self) -> &'static str {
        "enlarger"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Display
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.printing() && !params.apply_scan_mode && !params.bw_mode
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let ev = color::stops_to_ev(params.enlarger_seconds, params.enlarger_fstop);
        let gains = filtration_gains(
            &ctx.calibration.enlarger,
            [params.cyan, params.magenta, params.yellow],
            ev,
        );
        Ok(input.map(ColorSpace::Display, move |p| {
            let linear = color::gamma_decode_rgb(p);
            color::gamma_encode_rgb([linear[0] * gains[0], linear[1] * gains[1], linear[2] * gains[2]])
        }))
    }
}

/// Multigrade black-and-white print: luminance only, magenta sets the grade.
pub struct BwEnlarger;

impl BwEnlarger {
    /// Exposure offset relative to the reference time plus the B&W time offset.
    pub fn exposure_ev(params: &ParameterSet, calibration: &EnlargerCalibration) -> f32 {
        let offset = calibration.bw_time_offset;
        let seconds = (params.enlarger_seconds + offset).max(1e-3);
        let reference = color::REFERENCE_SECONDS + offset;
        (seconds / reference).log2() - 2.0 * (params.enlarger_fstop.max(1e-3) / color::REFERENCE_FSTOP).log2()
    }

    pub fn grade_gamma(params: &ParameterSet, calibration: &EnlargerCalibration) -> f32 {
        (1.0 + params.magenta * calibration.density_per_unit[1] * calibration.bw_grade_per_density).max(0.05)
    }
}

impl Operator for BwEnlarger {
    fn name(&self) -> &'static str {
        "bw_enlarger"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Display
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.printing() && !params.apply_scan_mode && params.bw_mode
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let calibration = &ctx.calibration.enlarger;
        let gain = color::ev_to_gain(-Self::exposure_ev(params, calibration));
        let gamma = Self::grade_gamma(params, calibration);
        let mid = ctx.calibration.tone.mid_gray;
        Ok(input.map(ColorSpace::Display, move |p| {
            let y = color::luminance(color::gamma_decode_rgb(p)).max(0.0);
            let out = mid * (y * gain / mid).powf(gamma);
            [color::gamma_encode(out); 3]
        }))
    }
}
