//! Film-scanner path
//!
//! In scan mode the negative is not printed optically. Densities get a
//! per-channel code offset, are converted Cineon-style to display values,
//! and can be finished with a print-film emulation LUT and a contrast pivot.

use super::negative::awg_to_display;
use super::{Operator, RenderContext};
use crate::buffer::{ColorSpace, ImageBuffer};
use crate::color::{self, CINEON_DENSITY_PER_CODE, CINEON_MAX_CODE};
use crate::error::Result;
use crate::lut::StockCurve;
use crate::params::{FilmStock, ParameterSet};

/// Cineon reference white code.
const CINEON_WHITE_CODE: f32 = 685.0;
/// Negative gamma assumed by the Cineon log → linear conversion.
const CINEON_NEGATIVE_GAMMA: f32 = 0.6;

/// Scanner code offsets applied to the negative densities.
pub struct ScanOffset;

impl Operator for ScanOffset {
    fn name(&self) -> &'static str {
        "scan_offset"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Density
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.scanning()
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let scan = &ctx.calibration.scan;
        let sliders = [params.offset_red, params.offset_green, params.offset_blue];
        let mut offsets = [0.0f32; 3];
        for c in 0..3 {
            offsets[c] = params.offset_rgb / scan.code_scale
                + ((sliders[c] + scan.channel_offsets[c]) / scan.code_scale) / scan.channel_divisor;
        }
        Ok(input.map(ColorSpace::Density, move |p| {
            [p[0] + offsets[0], p[1] + offsets[1], p[2] + offsets[2]]
        }))
    }
}

/// Scanned negative codes → display values.
///
/// The stock's base density is removed, then codes follow the Cineon
/// log → linear conversion with the black point normalized to zero.
pub fn scan_to_display(codes: [f32; 3], stock: FilmStock) -> [f32; 3] {
    let curve = StockCurve::for_stock(stock);
    let black = 10f32.powf((color::CINEON_BLACK_CODE - CINEON_WHITE_CODE) * CINEON_DENSITY_PER_CODE / CINEON_NEGATIVE_GAMMA);
    let mut linear = [0.0f32; 3];
    for c in 0..3 {
        let base = curve.dmin[c] / CINEON_DENSITY_PER_CODE;
        let code = codes[c] * CINEON_MAX_CODE - base;
        let v = 10f32.powf((code - CINEON_WHITE_CODE) * CINEON_DENSITY_PER_CODE / CINEON_NEGATIVE_GAMMA);
        linear[c] = (v - black) / (1.0 - black);
    }
    if curve.monochrome {
        linear = [color::luminance(linear); 3];
    }
    awg_to_display(linear)
}

/// Print-film emulation on the scanned image.
pub struct PrintFilmLut;

impl Operator for PrintFilmLut {
    fn name(&self) -> &'static str {
        "print_film_lut"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Display
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.scanning() && params.apply_print_film_lut
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let lut = ctx.luts.print_film();
        let blend = (params.print_film_lut_blend / 100.0).clamp(0.0, 1.0);
        Ok(input.map(ColorSpace::Display, move |p| color::lerp3(p, lut.sample(p), blend)))
    }
}

/// Display contrast pivoting on 0.5.
pub struct ScanContrast;

impl Operator for ScanContrast {
    fn name(&self) -> &'static str {
        "scan_contrast"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Display
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.scanning()
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, _ctx: &RenderContext) -> Result<ImageBuffer> {
        let slope = 1.0 + params.scan_contrast / 100.0;
        Ok(input.map(ColorSpace::Display, move |p| p.map(|c| (0.5 + (c - 0.5) * slope).max(0.0))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::SourceInfo;

    fn ctx() -> RenderContext {
        RenderContext::detached(SourceInfo::default())
    }

    #[test]
    fn test_scan_offsets_follow_code_formula() {
        let params = ParameterSet {
            offset_rgb: 40.0,
            offset_red: 68.0,
            offset_green: -3.0,
            offset_blue: 85.0,
            ..ParameterSet::scan_preset()
        };
        let input = ImageBuffer::filled(1, 1, ColorSpace::Density, [0.5; 3]);
        let p = ScanOffset.apply(&input, &params, &ctx()).unwrap().pixel(0, 0);
        assert!((p[0] - 0.6).abs() < 1e-6);
        assert!((p[1] - 0.6).abs() < 1e-6);
        assert!((p[2] - (0.6 + (120.0 / 400.0) / 3.0)).abs() < 1e-6);
    }

    #[test]
    fn test_scan_conversion_black_point_and_order() {
        let curve = StockCurve::for_stock(FilmStock::Portra400);
        let base = scan_to_display(curve.dmin.map(color::density_to_cineon), FilmStock::Portra400);
        assert!(base.iter().all(|c| c.abs() < 5e-3), "{:?}", base);

        let thin = scan_to_display(curve.dmin.map(|d| color::density_to_cineon(d + 0.4)), FilmStock::Portra400);
        let dense = scan_to_display(curve.dmin.map(|d| color::density_to_cineon(d + 1.2)), FilmStock::Portra400);
        assert!(dense[1] > thin[1]);
        assert!((dense[0] - dense[2]).abs() < 1e-3, "{:?}", dense);
    }

    #[test]
    fn test_scan_contrast_pivot() {
        let params = ParameterSet {
            scan_contrast: 100.0,
            ..ParameterSet::scan_preset()
        };
        let input = ImageBuffer::new(3, 1, ColorSpace::Display, vec![[0.5; 3], [0.6; 3], [0.1; 3]]).unwrap();
        let out = ScanContrast.apply(&input, &params, &ctx()).unwrap();
        assert_eq!(out.pixel(0, 0)[0], 0.5);
        assert!((out.pixel(1, 0)[0] - 0.7).abs() < 1e-6);
        assert_eq!(out.pixel(2, 0)[0], 0.0);
    }

    #[test]
    fn test_print_film_blend_zero_is_identity() {
        let params = ParameterSet {
            apply_print_film_lut: true,
            print_film_lut_blend: 0.0,
            ..ParameterSet::scan_preset()
        };
        let input = ImageBuffer::filled(2, 2, ColorSpace::Display, [0.3, 0.5, 0.7]);
        let out = PrintFilmLut.apply(&input, &params, &ctx()).unwrap();
        assert!(out.max_abs_diff(&input) < 1e-6);
    }
}
