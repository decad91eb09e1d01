//! Film sharpness (MTF) simulation
//!
//! The log image is split into frequency bands with Gaussian blurs whose
//! 50% response sits at each calibrated frequency (line pairs per mm of
//! film gate). Each band is rescaled by a per-channel gain and the bands are
//! summed back on top of the coarsest blur. With every gain at one the
//! decomposition reconstructs the input exactly.

use super::{Operator, RenderContext};
use crate::buffer::{ColorSpace, ImageBuffer};
use crate::color;
use crate::error::Result;
use crate::params::ParameterSet;

/// `σ·f` at which a Gaussian's MTF crosses 50%: `sqrt(ln 2 / 2) / π`.
pub const HALF_RESPONSE: f32 = 0.1874;

/// Gaussian sigma (px) whose response halves at `lp_per_mm`.
pub fn band_sigma(px_per_mm: f32, lp_per_mm: f32) -> f32 {
    HALF_RESPONSE * px_per_mm / lp_per_mm.max(1e-3)
}

pub struct Mtf;

impl Mtf {
    /// Per-band `[r, g, b]` gains, finest band last.
    fn band_gains(params: &ParameterSet, ctx: &RenderContext) -> [[f32; 3]; 4] {
        let mtf = &ctx.calibration.mtf;
        let mut gains = [[0.0; 3]; 4];
        for (band, gain) in gains.iter_mut().enumerate() {
            *gain = [mtf.red_gains[band], mtf.green_gains[band], mtf.blue_gains[band]];
        }
        if params.apply_grain {
            // Grain carries its own fine detail; soften the finest band less.
            gains[3] = gains[3].map(|g| g + (1.0 - g) / 2.0);
        }
        gains
    }
}

impl Operator for Mtf {
    fn name(&self) -> &'static str {
        "mtf"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Log
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.apply_mtf
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let mtf = &ctx.calibration.mtf;
        let gate_mm = ctx.calibration.gate_width_mm(params.gate_format);
        let px_per_mm = input.frame().long_edge() as f32 / gate_mm;

        // Coarsest band first; a band too fine for this resolution is the input itself.
        let blurs: Vec<ImageBuffer> = mtf
            .frequencies
            .iter()
            .map(|&f| {
                let sigma = band_sigma(px_per_mm, f);
                if sigma < mtf.min_sigma_px {
                    input.clone()
                } else {
                    input.gaussian_blur(sigma)
                }
            })
            .collect();

        let gains = Self::band_gains(params, ctx);
        let mut out = blurs[0].clone();
        for band in 0..blurs.len() {
            let finer = blurs.get(band + 1).unwrap_or(input);
            if finer.shares_pixels(&blurs[band]) {
                continue;
            }
            let g = gains[band];
            let detail = finer.zip_map(&blurs[band], ColorSpace::Log, |f, b| [f[0] - b[0], f[1] - b[1], f[2] - b[2]])?;
            out = out.zip_map(&detail, ColorSpace::Log, move |o, d| {
                [o[0] + g[0] * d[0], o[1] + g[1] * d[1], o[2] + g[2] * d[2]]
            })?;
        }

        let amount = (params.mtf_amount / 100.0).clamp(0.0, 1.0);
        input.zip_map(&out, ColorSpace::Log, move |a, b| color::lerp3(a, b, amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{GateFormat, SourceInfo};

    fn edge(width: u32) -> ImageBuffer {
        ImageBuffer::from_fn(width, 8, ColorSpace::Log, |x, _| if x < width / 2 { [0.3; 3] } else { [0.6; 3] })
    }

    #[test]
    fn test_coarse_frames_skip_every_band() {
        let ctx = RenderContext::detached(SourceInfo::default());
        let input = edge(48);
        let params = ParameterSet {
            apply_mtf: true,
            ..Default::default()
        };
        let out = Mtf.apply(&input, &params, &ctx).unwrap();
        assert!(out.max_abs_diff(&input) < 1e-6);
    }

    #[test]
    fn test_band_sigma_half_response() {
        // 100 px/mm, 10 lp/mm → 0.1 cycles/px → sigma 1.874 px
        assert!((band_sigma(100.0, 10.0) - 1.874).abs() < 1e-4);
    }

    #[test]
    fn test_unit_gains_reconstruct_input() {
        let mut ctx = RenderContext::detached(SourceInfo::default());
        let mut calibration = (*ctx.calibration).clone();
        calibration.mtf.red_gains = [1.0; 4];
        calibration.mtf.green_gains = [1.0; 4];
        calibration.mtf.blue_gains = [1.0; 4];
        ctx.calibration = std::sync::Arc::new(calibration);

        let input = edge(400);
        let params = ParameterSet {
            apply_mtf: true,
            gate_format: GateFormat::Motion8,
            ..Default::default()
        };
        let out = Mtf.apply(&input, &params, &ctx).unwrap();
        assert!(out.max_abs_diff(&input) < 1e-4);
    }

    #[test]
    fn test_softens_edges_at_high_resolution() {
        let ctx = RenderContext::detached(SourceInfo::default());
        let input = edge(400);
        let params = ParameterSet {
            apply_mtf: true,
            gate_format: GateFormat::Motion8,
            ..Default::default()
        };
        let out = Mtf.apply(&input, &params, &ctx).unwrap();
        // Just right of the edge the value is pulled toward the dark side.
        assert!(out.pixel(200, 4)[1] < 0.6);
        // Far from the edge nothing changes.
        assert!((out.pixel(20, 4)[1] - 0.3).abs() < 1e-4);
    }
}
