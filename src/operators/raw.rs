//! Raw-stage adjustments: white balance, exposure, contrast, saturation,
//! zone HDR and per-hue grading.

use super::{Operator, RenderContext};
use crate::buffer::{ColorSpace, ImageBuffer};
use crate::color::{self, MAX_POLAR_ANGLE};
use crate::error::Result;
use crate::params::ParameterSet;

// ============================================================================
// White balance and exposure (scene-linear)
// ============================================================================

/// Re-balance from the as-shot neutral to the requested white.
pub struct TempTint;

impl Operator for TempTint {
    fn name(&self) -> &'static str {
        "temp_tint"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Linear
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.apply_temp_tint
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let [x, y] = ctx.source.neutral;
        let as_shot = color::chromaticity_to_cct(x, y);
        let mut target = params.temperature;
        if params.convert_to_neg {
            target += ctx.calibration.tone.negative_temperature_offset;
        }
        let gains = color::white_balance_gains(as_shot, target, params.tint);
        Ok(input.map(ColorSpace::Linear, move |p| [p[0] * gains[0], p[1] * gains[1], p[2] * gains[2]]))
    }
}

pub struct Exposure;

impl Exposure {
    /// Total stops applied, including baseline and mode offsets.
    pub fn total_stops(params: &ParameterSet, ctx: &RenderContext) -> f32 {
        let tone = &ctx.calibration.tone;
        let mut stops = params.exposure + ctx.source.baseline_exposure;
        if params.convert_to_neg && !params.bw_mode {
            stops += tone.negative_exposure_offset;
        }
        if params.scanning() {
            stops += tone.scan_exposure_offset;
        }
        stops
    }
}

impl Operator for Exposure {
    fn name(&self) -> &'static str {
        "exposure"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Linear
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.apply_exposure
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let gain = color::ev_to_gain(Self::total_stops(params, ctx));
        Ok(input.map(ColorSpace::Linear, move |p| p.map(|c| c * gain)))
    }
}

// ============================================================================
// Log-space tone
// ============================================================================

/// Slope around LogC mid-gray; a power curve in linear light.
pub struct Contrast;

impl Operator for Contrast {
    fn name(&self) -> &'static str {
        "contrast"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Log
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.apply_contrast
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let pivot = color::logc_encode(ctx.calibration.tone.mid_gray);
        let slope = 1.0 + params.contrast / 100.0;
        Ok(input.map(ColorSpace::Log, move |p| p.map(|c| pivot + (c - pivot) * slope)))
    }
}

/// Zone-weighted offsets for whites, highlights, shadows and blacks.
pub struct Hdr;

/// Zone weights `[white, highlight, shadow, black]` for a LogC luminance.
pub fn hdr_zone_weights(y: f32) -> [f32; 4] {
    let tent = |centre: f32| (1.0 - (y - centre).abs() / 0.2).max(0.0);
    [
        color::smoothstep(0.6, 0.9, y),
        tent(0.6),
        tent(0.3),
        1.0 - color::smoothstep(0.0, 0.3, y),
    ]
}

impl Operator for Hdr {
    fn name(&self) -> &'static str {
        "hdr"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Log
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.apply_hdr
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let strength = ctx.calibration.tone.hdr_strength;
        let sliders = [
            params.hdr_white,
            -params.hdr_highlight,
            params.hdr_shadow,
            params.hdr_black,
        ];
        Ok(input.map(ColorSpace::Log, move |p| {
            let weights = hdr_zone_weights(color::luminance(p));
            let delta: f32 = weights.iter().zip(sliders).map(|(w, s)| w * s).sum::<f32>() * strength / 100.0;
            p.map(|c| c + delta)
        }))
    }
}

// ============================================================================
// Spherical grading
// ============================================================================

pub struct Saturation;

impl Operator for Saturation {
    fn name(&self) -> &'static str {
        "saturation"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Spherical
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.apply_saturation
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, _ctx: &RenderContext) -> Result<ImageBuffer> {
        let scale = (params.saturation / 100.0 + 1.0).max(0.0);
        Ok(input.map(ColorSpace::Spherical, move |[hue, angle, magnitude]| {
            [hue, (angle * scale).min(MAX_POLAR_ANGLE), magnitude]
        }))
    }
}

/// Hue turns per unit of hue slider.
const HUE_SHIFT_PER_UNIT: f32 = 0.5 * 0.000833;

/// Triangular weights of the six hue sectors; adjacent weights sum to one.
pub fn sector_weights(hue: f32, centres: &[f32; 6]) -> [f32; 6] {
    centres.map(|c| (1.0 - color::hue_distance(hue, c).abs() * 6.0).max(0.0))
}

/// Per-sector hue, saturation and density grading.
pub struct Hsd;

impl Operator for Hsd {
    fn name(&self) -> &'static str {
        "hsd"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Spherical
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.apply_hsd
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let tone = &ctx.calibration.tone;
        let centres = tone.hue_sectors;
        let knee = tone.hsd_chroma_knee;
        let (hues, sats, dens) = (params.hsd_hue, params.hsd_saturation, params.hsd_density);

        Ok(input.map(ColorSpace::Spherical, move |[hue, angle, magnitude]| {
            let weights = sector_weights(hue, &centres);
            // Neutrals carry no hue, so grading fades out near the axis.
            let chroma = color::smoothstep(0.0, knee, angle);

            let mut hue_shift = 0.0;
            let mut sat_scale = 0.0;
            let mut density = 0.0;
            for i in 0..6 {
                hue_shift += weights[i] * hues[i] * HUE_SHIFT_PER_UNIT;
                sat_scale += weights[i] * (sats[i] / 200.0 + 1.0);
                density += weights[i] * dens[i] / 200.0;
            }

            let hue = (hue + chroma * hue_shift).rem_euclid(1.0);
            let angle = (angle * (1.0 + chroma * (sat_scale - 1.0))).clamp(0.0, MAX_POLAR_ANGLE);
            let magnitude = magnitude * (1.0 - chroma * density);
            [hue, angle, magnitude]
        }))
    }
}
