//! Print finishing: halation, flash pre-exposure, gamut compression and the
//! output tone curve.

use super::{Operator, RenderContext};
use crate::buffer::{ColorSpace, ImageBuffer};
use crate::color;
use crate::error::{ForgeError, Result};
use crate::params::ParameterSet;

fn printing(params: &ParameterSet) -> bool {
    params.printing() && !params.apply_scan_mode
}

// ============================================================================
// Print halation
// ============================================================================

/// Light scattered in the paper base, mixed back as a lighten or darken.
pub struct PrintHalation;

impl Operator for PrintHalation {
    fn name(&self) -> &'static str {
        "print_halation"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Display
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.print_halation_apply && printing(params)
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let sigma = params.print_halation_size * ctx.ui_scalar(input) * ctx.zoom;
        let blurred = input.gaussian_blur(sigma);
        let amount = (params.print_halation_amount / 100.0).clamp(0.0, 1.0);
        let darken = params.print_halation_darken;
        input.zip_map(&blurred, ColorSpace::Display, move |p, b| {
            let mix = color::lerp3(p, b, amount);
            let mut out = [0.0f32; 3];
            for c in 0..3 {
                out[c] = if darken { p[c].min(mix[c]) } else { p[c].max(mix[c]) };
            }
            out
        })
    }
}

// ============================================================================
// Flash
// ============================================================================

/// Uniform paper pre-exposure through its own filter pack.
pub struct Flash;

impl Flash {
    /// Flash exposure per channel.
    pub fn exposure(params: &ParameterSet, ctx: &RenderContext) -> [f32; 3] {
        let flash = &ctx.calibration.flash;
        let enlarger = &ctx.calibration.enlarger;
        let ev = color::stops_to_ev(params.flash_seconds, params.flash_fstop);
        let scale = color::ev_to_gain(ev) * flash.strength;
        let filters = [params.flash_cyan, params.flash_magenta, params.flash_yellow];
        let mut exposure = [0.0f32; 3];
        for c in 0..3 {
            let k = enlarger.density_per_unit[c];
            let dmax = enlarger.paper_dmax[c];
            let open = color::filtration_gain(0.0, k, dmax);
            let filtered = color::filtration_gain(filters[c] + flash.filter_offsets[c], k, dmax);
            exposure[c] = flash.base_color[c] * scale * filtered / open;
        }
        exposure
    }
}

impl Operator for Flash {
    fn name(&self) -> &'static str {
        "flash"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Display
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.apply_flash && printing(params)
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let e = Self::exposure(params, ctx);
        Ok(input.map(ColorSpace::Display, move |p| {
            let linear = color::gamma_decode_rgb(p);
            let mut out = [0.0f32; 3];
            for c in 0..3 {
                out[c] = linear[c] / (1.0 + e[c] * linear[c].max(0.0));
            }
            color::gamma_encode_rgb(out)
        }))
    }
}

// ============================================================================
// Gamut compression
// ============================================================================

/// Distance-based gamut compression toward the achromatic axis.
pub struct PrintGamut;

/// Compress a normalized distance from the achromatic axis. Distances below
/// `threshold` pass through; `limit` maps onto the gamut boundary (1.0).
pub fn compress_distance(d: f32, threshold: f32, limit: f32, power: f32) -> f32 {
    if d < threshold || limit <= 1.0 || threshold >= 1.0 {
        return d;
    }
    let scale = (limit - threshold) / (((1.0 - threshold) / (limit - threshold)).powf(-power) - 1.0).powf(1.0 / power);
    let x = (d - threshold) / scale;
    threshold + scale * x / (1.0 + x.powf(power)).powf(1.0 / power)
}

impl Operator for PrintGamut {
    fn name(&self) -> &'static str {
        "print_gamut"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Display
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        printing(params) && !params.bw_mode
    }

    fn apply(&self, input: &ImageBuffer, _params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let paper = &ctx.calibration.paper;
        let (threshold, limit, power) = (paper.gamut_threshold, paper.gamut_limit, paper.gamut_power);
        Ok(input.map(ColorSpace::Display, move |p| {
            let linear = color::gamma_decode_rgb(p);
            let achromatic = linear[0].max(linear[1]).max(linear[2]);
            if achromatic <= 0.0 {
                return p;
            }
            let out = linear.map(|c| {
                let d = (achromatic - c) / achromatic;
                achromatic - compress_distance(d, threshold, limit, power) * achromatic
            });
            color::gamma_encode_rgb(out)
        }))
    }
}

// ============================================================================
// Output curve
// ============================================================================

/// Monotone cubic (Fritsch–Carlson) interpolant through sorted points.
#[derive(Debug, Clone)]
pub struct ToneCurve {
    xs: Vec<f32>,
    ys: Vec<f32>,
    slopes: Vec<f32>,
}

impl ToneCurve {
    pub fn new(points: &[[f32; 2]]) -> Result<Self> {
        if points.len() < 2 {
            return Err(ForgeError::Config("Tone curve needs at least two points".to_string()));
        }
        let xs: Vec<f32> = points.iter().map(|p| p[0]).collect();
        let ys: Vec<f32> = points.iter().map(|p| p[1]).collect();
        if xs.windows(2).any(|w| w[1] <= w[0]) {
            return Err(ForgeError::Config("Tone curve x values must increase".to_string()));
        }

        let n = xs.len();
        let secants: Vec<f32> = (0..n - 1).map(|i| (ys[i + 1] - ys[i]) / (xs[i + 1] - xs[i])).collect();
        let mut slopes = vec![0.0f32; n];
        slopes[0] = secants[0];
        slopes[n - 1] = secants[n - 2];
        for i in 1..n - 1 {
            slopes[i] = if secants[i - 1] * secants[i] <= 0.0 {
                0.0
            } else {
                (secants[i - 1] + secants[i]) / 2.0
            };
        }
        for i in 0..n - 1 {
            if secants[i] == 0.0 {
                slopes[i] = 0.0;
                slopes[i + 1] = 0.0;
                continue;
            }
            let a = slopes[i] / secants[i];
            let b = slopes[i + 1] / secants[i];
            let h = a * a + b * b;
            if h > 9.0 {
                let t = 3.0 / h.sqrt();
                slopes[i] = t * a * secants[i];
                slopes[i + 1] = t * b * secants[i];
            }
        }
        Ok(Self { xs, ys, slopes })
    }

    pub fn eval(&self, x: f32) -> f32 {
        let n = self.xs.len();
        if x <= self.xs[0] {
            return self.ys[0] + self.slopes[0] * (x - self.xs[0]);
        }
        if x >= self.xs[n - 1] {
            return self.ys[n - 1] + self.slopes[n - 1] * (x - self.xs[n - 1]);
        }
        let i = self.xs.partition_point(|&v| v <= x).saturating_sub(1).min(n - 2);
        let h = self.xs[i + 1] - self.xs[i];
        let t = (x - self.xs[i]) / h;
        let (t2, t3) = (t * t, t * t * t);
        (2.0 * t3 - 3.0 * t2 + 1.0) * self.ys[i]
            + (t3 - 2.0 * t2 + t) * h * self.slopes[i]
            + (-2.0 * t3 + 3.0 * t2) * self.ys[i + 1]
            + (t3 - t2) * h * self.slopes[i + 1]
    }
}

/// Output tone curve followed by the paper black lift.
pub struct OutputCurve;

impl Operator for OutputCurve {
    fn name(&self) -> &'static str {
        "output_curve"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Display
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.apply_output_curve && params.convert_to_neg && !params.apply_scan_mode
    }

    fn apply(&self, input: &ImageBuffer, _params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let paper = &ctx.calibration.paper;
        let curve = ToneCurve::new(&paper.output_curve)?;
        let black = color::density_to_transmittance(paper.dmax);
        Ok(input.map(ColorSpace::Display, move |p| {
            let toned = p.map(|c| curve.eval(c.clamp(0.0, 1.0)));
            let linear = color::gamma_decode_rgb(toned).map(|c| black + (1.0 - black) * c.max(0.0));
            color::gamma_encode_rgb(linear)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::SourceInfo;

    fn ctx() -> RenderContext {
        RenderContext::detached(SourceInfo::with_native_size(64, 64))
    }

    #[test]
    fn test_tone_curve_hits_points_and_stays_monotone() {
        let points = crate::config::PaperCalibration::default().output_curve;
        let curve = ToneCurve::new(&points).unwrap();
        for p in &points {
            assert!((curve.eval(p[0]) - p[1]).abs() < 1e-6);
        }
        let mut last = curve.eval(0.0);
        for i in 1..=200 {
            let v = curve.eval(i as f32 / 200.0);
            assert!(v >= last - 1e-6);
            last = v;
        }
        assert!(ToneCurve::new(&[[0.0, 0.0]]).is_err());
        assert!(ToneCurve::new(&[[0.5, 0.0], [0.2, 1.0]]).is_err());
    }

    #[test]
    fn test_output_curve_lifts_black_to_paper_dmax() {
        let input = ImageBuffer::filled(1, 1, ColorSpace::Display, [0.0; 3]);
        let out = OutputCurve.apply(&input, &ParameterSet::print_preset(), &ctx()).unwrap();
        let black = color::gamma_decode(out.pixel(0, 0)[0]);
        assert!((black - 10f32.powf(-2.3)).abs() < 1e-5);
    }

    #[test]
    fn test_gamut_compression_keeps_in_gamut_colors() {
        assert_eq!(compress_distance(0.5, 0.8, 1.2, 1.2), 0.5);
        assert!((compress_distance(1.2, 0.8, 1.2, 1.2) - 1.0).abs() < 1e-4);
        assert!(compress_distance(1.1, 0.8, 1.2, 1.2) < 1.0);

        let input = ImageBuffer::filled(1, 1, ColorSpace::Display, [0.6, 0.5, 0.45]);
        let out = PrintGamut.apply(&input, &ParameterSet::print_preset(), &ctx()).unwrap();
        assert!(out.max_abs_diff(&input) < 1e-5);
    }

    #[test]
    fn test_flash_compresses_highlights() {
        let params = ParameterSet {
            apply_flash: true,
            flash_seconds: 12.0,
            flash_fstop: 11.0,
            ..ParameterSet::print_preset()
        };
        let e = Flash::exposure(&params, &ctx());
        assert!(e[0] > e[1] && e[0] > e[2]);

        let input = ImageBuffer::new(2, 1, ColorSpace::Display, vec![[0.2; 3], [0.9; 3]]).unwrap();
        let out = Flash.apply(&input, &params, &ctx()).unwrap();
        let drop_dark = input.pixel(0, 0)[0] - out.pixel(0, 0)[0];
        let drop_bright = input.pixel(1, 0)[0] - out.pixel(1, 0)[0];
        assert!(drop_bright > drop_dark && drop_dark > 0.0);
    }

    #[test]
    fn test_halation_darken_never_brightens() {
        let input = ImageBuffer::from_fn(32, 32, ColorSpace::Display, |x, _| if x < 16 { [0.9; 3] } else { [0.1; 3] });
        let params = ParameterSet {
            print_halation_apply: true,
            print_halation_size: 40.0,
            ..ParameterSet::print_preset()
        };
        let out = PrintHalation.apply(&input, &params, &ctx()).unwrap();
        assert!(out.pixels().iter().zip(input.pixels()).all(|(o, i)| o[0] <= i[0] + 1e-6));
        assert!(out.pixel(15, 16)[0] < 0.9);

        let lighten = ParameterSet {
            print_halation_darken: false,
            ..params
        };
        let out = PrintHalation.apply(&input, &lighten, &ctx()).unwrap();
        assert!(out.pixel(16, 16)[0] > 0.1);
    }
}
