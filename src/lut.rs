//! 3D lookup tables
//!
//! Film-stock and print-film transforms are evaluated through 3D LUTs with
//! trilinear interpolation. The built-in tables are generated from parametric
//! characteristic curves; `.cube` files can replace any of them.

use crate::color::{self, Matrix3};
use crate::error::{ForgeError, Result};
use crate::params::FilmStock;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// ============================================================================
// Lut3D
// ============================================================================

#[derive(Debug, Clone)]
pub struct Lut3D {
    size: usize,
    domain_min: [f32; 3],
    domain_max: [f32; 3],
    /// Red varies fastest, then green, then blue
    table: Vec<[f32; 3]>,
}

impl Lut3D {
    /// Sample `f` on a `size³` lattice over the unit cube.
    pub fn from_fn<F>(size: usize, f: F) -> Self
    where
        F: Fn([f32; 3]) -> [f32; 3] + Sync,
    {
        let size = size.max(2);
        let step = 1.0 / (size - 1) as f32;
        let mut table = vec![[0.0f32; 3]; size * size * size];
        table
            .par_chunks_mut(size * size)
            .enumerate()
            .for_each(|(b, slice)| {
                for g in 0..size {
                    for r in 0..size {
                        slice[g * size + r] = f([r as f32 * step, g as f32 * step, b as f32 * step]);
                    }
                }
            });
        Self {
            size,
            domain_min: [0.0; 3],
            domain_max: [1.0; 3],
            table,
        }
    }

    pub fn identity(size: usize) -> Self {
        Self::from_fn(size, |rgb| rgb)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Parse an Adobe/Resolve `.cube` 3D table.
    pub fn parse_cube(text: &str) -> Result<Self> {
        let mut size = None;
        let mut domain_min = [0.0f32; 3];
        let mut domain_max = [1.0f32; 3];
        let mut table = Vec::new();

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(head) = parts.next() else { continue };
            match head {
                "TITLE" => {}
                "LUT_1D_SIZE" => {
                    return Err(ForgeError::Lut("1D tables are not supported".to_string()));
                }
                "LUT_3D_SIZE" => {
                    let n: usize = parts
                        .next()
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| ForgeError::Lut(format!("Bad LUT_3D_SIZE on line {}", line_no + 1)))?;
                    if !(2..=256).contains(&n) {
                        return Err(ForgeError::Lut(format!("Unsupported LUT size {}", n)));
                    }
                    size = Some(n);
                }
                "DOMAIN_MIN" => domain_min = parse_triplet(parts, line_no)?,
                "DOMAIN_MAX" => domain_max = parse_triplet(parts, line_no)?,
                _ => {
                    let first: f32 = head
                        .parse()
                        .map_err(|_| ForgeError::Lut(format!("Unknown keyword '{}' on line {}", head, line_no + 1)))?;
                    let rest = parse_pair(parts, line_no)?;
                    table.push([first, rest[0], rest[1]]);
                }
            }
        }

        let size = size.ok_or_else(|| ForgeError::Lut("Missing LUT_3D_SIZE".to_string()))?;
        if table.len() != size * size * size {
            return Err(ForgeError::Lut(format!(
                "Expected {} entries, found {}",
                size * size * size,
                table.len()
            )));
        }
        Ok(Self {
            size,
            domain_min,
            domain_max,
            table,
        })
    }

    pub fn from_cube_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let lut = Self::parse_cube(&text)?;
        info!("📦 Loaded {}³ LUT from {}", lut.size, path.as_ref().display());
        Ok(lut)
    }

    fn at(&self, r: usize, g: usize, b: usize) -> [f32; 3] {
        self.table[(b * self.size + g) * self.size + r]
    }

    /// Trilinear lookup; inputs outside the domain are clamped.
    pub fn sample(&self, rgb: [f32; 3]) -> [f32; 3] {
        let max_index = (self.size - 1) as f32;
        let mut base = [0usize; 3];
        let mut frac = [0.0f32; 3];
        for c in 0..3 {
            let span = (self.domain_max[c] - self.domain_min[c]).max(1e-6);
            let t = ((rgb[c] - self.domain_min[c]) / span).clamp(0.0, 1.0) * max_index;
            let i = (t.floor() as usize).min(self.size - 2);
            base[c] = i;
            frac[c] = t - i as f32;
        }
        let [r, g, b] = base;
        let [fr, fg, fb] = frac;

        let c00 = color::lerp3(self.at(r, g, b), self.at(r + 1, g, b), fr);
        let c10 = color::lerp3(self.at(r, g + 1, b), self.at(r + 1, g + 1, b), fr);
        let c01 = color::lerp3(self.at(r, g, b + 1), self.at(r + 1, g, b + 1), fr);
        let c11 = color::lerp3(self.at(r, g + 1, b + 1), self.at(r + 1, g + 1, b + 1), fr);
        let c0 = color::lerp3(c00, c10, fg);
        let c1 = color::lerp3(c01, c11, fg);
        color::lerp3(c0, c1, fb)
    }
}

fn parse_triplet<'a>(mut parts: impl Iterator<Item = &'a str>, line_no: usize) -> Result<[f32; 3]> {
    let mut out = [0.0f32; 3];
    for v in out.iter_mut() {
        *v = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ForgeError::Lut(format!("Expected three numbers on line {}", line_no + 1)))?;
    }
    Ok(out)
}

fn parse_pair<'a>(mut parts: impl Iterator<Item = &'a str>, line_no: usize) -> Result<[f32; 2]> {
    let mut out = [0.0f32; 2];
    for v in out.iter_mut() {
        *v = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ForgeError::Lut(format!("Expected three numbers on line {}", line_no + 1)))?;
    }
    Ok(out)
}

// ============================================================================
// Film stock characteristic curves
// ============================================================================

/// Parametric H&D response of a negative stock.
#[derive(Debug, Clone, Copy)]
pub struct StockCurve {
    /// Base + fog density per channel (the orange mask)
    pub dmin: [f32; 3],
    /// Density range above base per channel
    pub range: [f32; 3],
    /// Mid-tone slope (density per decade of exposure)
    pub gamma: [f32; 3],
    /// Log10 exposure offset of the curve midpoint relative to 18% gray
    pub speed: f32,
    /// Inter-layer crosstalk in log exposure; rows sum to one
    pub crosstalk: Matrix3,
    pub monochrome: bool,
}

const NEUTRAL_CROSSTALK: Matrix3 = [[0.90, 0.07, 0.03], [0.05, 0.90, 0.05], [0.02, 0.08, 0.90]];

impl StockCurve {
    pub fn for_stock(stock: FilmStock) -> Self {
        let base = Self {
            dmin: [0.22, 0.55, 0.78],
            range: [1.60, 1.60, 1.60],
            gamma: [0.60, 0.60, 0.60],
            speed: 4f32.log10(),
            crosstalk: NEUTRAL_CROSSTALK,
            monochrome: false,
        };
        match stock {
            FilmStock::Portra400 => base,
            FilmStock::Portra400Plus1 => Self {
                speed: base.speed - 2f32.log10(),
                ..base
            },
            FilmStock::Portra400Plus2 => Self {
                speed: base.speed - 4f32.log10(),
                ..base
            },
            FilmStock::Gold200 => Self {
                dmin: [0.25, 0.60, 0.85],
                gamma: [0.66, 0.63, 0.60],
                crosstalk: [[0.86, 0.10, 0.04], [0.06, 0.86, 0.08], [0.03, 0.11, 0.86]],
                ..base
            },
            FilmStock::TMax400 => Self {
                dmin: [0.18, 0.18, 0.18],
                range: [1.70, 1.70, 1.70],
                gamma: [0.62, 0.62, 0.62],
                crosstalk: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
                monochrome: true,
                ..base
            },
        }
    }

    fn midpoint(&self) -> f32 {
        0.18f32.log10() + self.speed
    }

    /// Scene LogC → negative densities (normalized Cineon codes).
    pub fn expose(&self, log_rgb: [f32; 3]) -> [f32; 3] {
        let mut linear = color::logc_decode_rgb(log_rgb).map(|v| v.max(1e-5));
        if self.monochrome {
            let y = color::luminance(linear).max(1e-5);
            linear = [y; 3];
        }
        let log_exposure = linear.map(|v| v.log10());
        let mixed = color::apply_matrix(&self.crosstalk, log_exposure);
        let mid = self.midpoint();
        let mut out = [0.0f32; 3];
        for c in 0..3 {
            let k = 4.0 * self.gamma[c] / self.range[c];
            let density = self.range[c] / (1.0 + (-k * (mixed[c] - mid)).exp());
            out[c] = color::density_to_cineon(self.dmin[c] + density);
        }
        out
    }

    /// Negative densities → positive scene-linear (AWG), inverting the
    /// straight-line portion of the curve.
    pub fn develop(&self, codes: [f32; 3]) -> [f32; 3] {
        let mut out = [0.0f32; 3];
        for c in 0..3 {
            let density = color::cineon_to_density(codes[c]) - self.dmin[c];
            let from_mid = density - self.range[c] * 0.5;
            out[c] = 0.18 * 10f32.powf(from_mid / self.gamma[c]);
        }
        out
    }
}

/// Print-film look on display-referred values: a soft-shouldered S-curve in
/// log exposure with a mild saturation boost.
fn print_film_response(display: [f32; 3]) -> [f32; 3] {
    const SLOPES: [f32; 3] = [1.22, 1.18, 1.14];
    const SHOULDER: f32 = 1.3;
    const BOOST: Matrix3 = [[1.08, -0.05, -0.03], [-0.04, 1.08, -0.04], [-0.02, -0.06, 1.08]];

    let linear = color::gamma_decode_rgb(display).map(|v| v.max(1e-5));
    let x = linear.map(|v| (v / 0.18).log10());
    let mixed = color::apply_matrix(&BOOST, x);
    let mut out = [0.0f32; 3];
    for c in 0..3 {
        let s = SLOPES[c] * mixed[c];
        let y = s / (1.0 + (s / SHOULDER).powi(2)).sqrt();
        out[c] = color::gamma_encode((0.18 * 10f32.powf(y)).clamp(0.0, 1.0));
    }
    out
}

// ============================================================================
// LutBank
// ============================================================================

/// Shared set of film-stock and print-film LUTs.
#[derive(Debug, Clone)]
pub struct LutBank {
    stocks: HashMap<FilmStock, Arc<Lut3D>>,
    print_film: Arc<Lut3D>,
}

impl LutBank {
    /// Generate the built-in tables at the given lattice size.
    pub fn procedural(size: usize) -> Self {
        let stocks = FilmStock::ALL
            .iter()
            .map(|&stock| {
                let curve = StockCurve::for_stock(stock);
                (stock, Arc::new(Lut3D::from_fn(size, move |rgb| curve.expose(rgb))))
            })
            .collect();
        debug!("Generated {} film-stock LUTs at {}³", FilmStock::ALL.len(), size);
        Self {
            stocks,
            print_film: Arc::new(Lut3D::from_fn(size, print_film_response)),
        }
    }

    pub fn with_stock_lut(mut self, stock: FilmStock, lut: Lut3D) -> Self {
        self.stocks.insert(stock, Arc::new(lut));
        self
    }

    pub fn with_print_film_lut(mut self, lut: Lut3D) -> Self {
        self.print_film = Arc::new(lut);
        self
    }

    pub fn stock(&self, stock: FilmStock) -> Option<&Lut3D> {
        self.stocks.get(&stock).map(|l| l.as_ref())
    }

    pub fn print_film(&self) -> &Lut3D {
        &self.print_film
    }
}
