//! Negative film path: exposing the stock, decoding the negative and the
//! paper it is printed on.

use super::{Operator, RenderContext};
use super::texture::band_sigma;
use crate::buffer::{ColorSpace, ImageBuffer};
use crate::color::{self, AWG_TO_P3};
use crate::error::{ForgeError, Result};
use crate::lut::StockCurve;
use crate::params::ParameterSet;

/// Expose the selected stock: scene LogC → negative densities.
pub struct FilmStockLut;

impl Operator for FilmStockLut {
    fn name(&self) -> &'static str {
        "film_stock"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Log
    }

    fn output_space(&self) -> ColorSpace {
        ColorSpace::Density
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.convert_to_neg
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let lut = ctx
            .luts
            .stock(params.stock)
            .ok_or_else(|| ForgeError::Lut(format!("No LUT loaded for {:?}", params.stock)))?;
        Ok(input.map(ColorSpace::Density, |p| lut.sample(p)))
    }
}

/// Invert negative densities to a positive, display-encoded image.
pub struct DecodeNegative;

/// Positive scene-linear (AWG) → display P3, gamma encoded.
pub fn awg_to_display(linear: [f32; 3]) -> [f32; 3] {
    color::gamma_encode_rgb(color::apply_matrix(&AWG_TO_P3, linear).map(|c| c.max(0.0)))
}

impl Operator for DecodeNegative {
    fn name(&self) -> &'static str {
        "decode_negative"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Density
    }

    fn output_space(&self) -> ColorSpace {
        ColorSpace::Display
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.convert_to_neg && !params.apply_scan_mode
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, _ctx: &RenderContext) -> Result<ImageBuffer> {
        let curve = StockCurve::for_stock(params.stock);
        Ok(input.map(ColorSpace::Display, move |codes| {
            let mut linear = curve.develop(codes);
            if curve.monochrome {
                linear = [color::luminance(linear); 3];
            }
            awg_to_display(linear)
        }))
    }
}

/// Paper soften and paper-base tint.
pub struct Paper;

impl Operator for Paper {
    fn name(&self) -> &'static str {
        "paper"
    }

    fn input_space(&self) -> ColorSpace {
        ColorSpace::Display
    }

    fn is_enabled(&self, params: &ParameterSet) -> bool {
        params.printing() && !params.apply_scan_mode
    }

    fn apply(&self, input: &ImageBuffer, params: &ParameterSet, ctx: &RenderContext) -> Result<ImageBuffer> {
        let paper = &ctx.calibration.paper;

        let mut softened = input.clone();
        if params.apply_paper_soften {
            let px_per_mm = input.frame().long_edge() as f32 / paper.print_width_mm;
            let sigma = band_sigma(px_per_mm, paper.soften_lpmm);
            if sigma >= ctx.calibration.mtf.min_sigma_px {
                let gain = paper.soften_gain;
                let blurred = input.gaussian_blur(sigma);
                softened = blurred.zip_map(input, ColorSpace::Display, move |b, p| {
                    [b[0] + gain * (p[0] - b[0]), b[1] + gain * (p[1] - b[1]), b[2] + gain * (p[2] - b[2])]
                })?;
            }
        }

        let base = paper.base_color;
        Ok(softened.map(ColorSpace::Display, move |p| {
            let linear = color::gamma_decode_rgb(p);
            color::gamma_encode_rgb([linear[0] * base[0], linear[1] * base[1], linear[2] * base[2]])
        }))
    }
}
