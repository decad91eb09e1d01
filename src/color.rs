//! Color science primitives
//!
//! Stateless conversions shared by every operator: exposure stops and densities,
//! enlarger filtration, ARRI LogC3 encoding, gamma 2.2, the spherical
//! (hue, polar angle, magnitude) representation used by saturation and HSD
//! grading, gamut matrices and white balance helpers.
//!
//! All scalar functions work on `f32` but evaluate transcendental math in `f64`
//! so that encode/decode pairs round-trip well inside `1e-5`.

use std::f64::consts::{LOG10_2, PI, TAU};

/// Reference enlarger exposure time (seconds) for EV 0.
pub const REFERENCE_SECONDS: f32 = 12.0;
/// Reference enlarger aperture for EV 0.
pub const REFERENCE_FSTOP: f32 = 11.0;

/// Density contributed by one Cineon code value.
pub const CINEON_DENSITY_PER_CODE: f32 = 0.002;
/// Cineon code value of film base (black point).
pub const CINEON_BLACK_CODE: f32 = 95.0;
/// Maximum Cineon code value.
pub const CINEON_MAX_CODE: f32 = 1023.0;

// ============================================================================
// Stops, EV and density
// ============================================================================

/// Convert an enlarger exposure time / aperture pair into a single EV offset.
///
/// `ev = log2(seconds/12) − 2·log2(fstop/11)`; 12 s at f/11 is EV 0.
pub fn stops_to_ev(seconds: f32, fstop: f32) -> f32 {
    let seconds = (seconds as f64).max(1e-6);
    let fstop = (fstop as f64).max(1e-6);
    let stop = 2.0 * (fstop / REFERENCE_FSTOP as f64).log2();
    ((seconds / REFERENCE_SECONDS as f64).log2() - stop) as f32
}

/// Linear gain for an EV offset.
pub fn ev_to_gain(ev: f32) -> f32 {
    2f64.powf(ev as f64) as f32
}

/// Exposure stops expressed as optical density (one stop ≈ 0.30103 D).
pub fn stops_to_density(stops: f32) -> f32 {
    (stops as f64 * LOG10_2) as f32
}

pub fn density_to_stops(density: f32) -> f32 {
    (density as f64 / LOG10_2) as f32
}

/// Fraction of light passed by a layer of the given density.
pub fn density_to_transmittance(density: f32) -> f32 {
    10f64.powf(-(density as f64)) as f32
}

pub fn transmittance_to_density(transmittance: f32) -> f32 {
    -(transmittance.max(1e-9) as f64).log10() as f32
}

/// Multiplicative correction for a filter-pack value.
///
/// `value` is the dial setting (0–100 scale), `density_per_unit` the
/// channel-specific density per dial unit and `dmax` the paper's maximum
/// density for that channel:
///
/// `cc = 10^(−((value·k/0.002 − 95)/(1023/Dmax)))`
pub fn filtration_gain(value: f32, density_per_unit: f32, dmax: f32) -> f32 {
    let density = value as f64 * density_per_unit as f64;
    let code = density / CINEON_DENSITY_PER_CODE as f64 - CINEON_BLACK_CODE as f64;
    let codes_per_density = CINEON_MAX_CODE as f64 / dmax.max(1e-3) as f64;
    10f64.powf(-(code / codes_per_density)) as f32
}

/// Density above base → normalized Cineon code value (0..1).
pub fn density_to_cineon(density: f32) -> f32 {
    (CINEON_BLACK_CODE + density / CINEON_DENSITY_PER_CODE) / CINEON_MAX_CODE
}

/// Normalized Cineon code value → density above base.
pub fn cineon_to_density(code: f32) -> f32 {
    (code * CINEON_MAX_CODE - CINEON_BLACK_CODE) * CINEON_DENSITY_PER_CODE
}

// ============================================================================
// ARRI LogC3 (EI 800)
// ============================================================================

const LOGC_CUT: f64 = 0.010591;
const LOGC_A: f64 = 5.555556;
const LOGC_B: f64 = 0.052272;
const LOGC_C: f64 = 0.247190;
const LOGC_D: f64 = 0.385537;
const LOGC_E: f64 = 5.367655;
const LOGC_F: f64 = 0.092809;

/// Scene-linear → LogC code value.
pub fn logc_encode(x: f32) -> f32 {
    let x = x as f64;
    if x > LOGC_CUT {
        (LOGC_C * (LOGC_A * x + LOGC_B).log10() + LOGC_D) as f32
    } else {
        (LOGC_E * x + LOGC_F) as f32
    }
}

/// LogC code value → scene-linear.
pub fn logc_decode(t: f32) -> f32 {
    let t = t as f64;
    if t > LOGC_E * LOGC_CUT + LOGC_F {
        ((10f64.powf((t - LOGC_D) / LOGC_C) - LOGC_B) / LOGC_A) as f32
    } else {
        ((t - LOGC_F) / LOGC_E) as f32
    }
}

pub fn logc_encode_rgb(rgb: [f32; 3]) -> [f32; 3] {
    rgb.map(logc_encode)
}

pub fn logc_decode_rgb(rgb: [f32; 3]) -> [f32; 3] {
    rgb.map(logc_decode)
}

// ============================================================================
// Gamma 2.2
// ============================================================================

const GAMMA: f64 = 2.2;

/// Linear → display gamma 2.2 (sign preserving).
pub fn gamma_encode(x: f32) -> f32 {
    let v = x as f64;
    (v.signum() * v.abs().powf(1.0 / GAMMA)) as f32
}

/// Display gamma 2.2 → linear (sign preserving).
pub fn gamma_decode(x: f32) -> f32 {
    let v = x as f64;
    (v.signum() * v.abs().powf(GAMMA)) as f32
}

pub fn gamma_encode_rgb(rgb: [f32; 3]) -> [f32; 3] {
    rgb.map(gamma_encode)
}

pub fn gamma_decode_rgb(rgb: [f32; 3]) -> [f32; 3] {
    rgb.map(gamma_decode)
}

// ============================================================================
// Spherical representation
// ============================================================================
//
// The neutral axis (1,1,1) is the pole. A color is stored as
// [hue in turns 0..1, polar angle from the neutral axis in radians, magnitude].
// Hue 0 points at red; yellow, green, cyan, blue and magenta follow at
// sixth-turn intervals.

const INV_SQRT3: f64 = 0.577_350_269_189_625_8;
const INV_SQRT6: f64 = 0.408_248_290_463_863;
const INV_SQRT2: f64 = 0.707_106_781_186_547_5;

pub fn rgb_to_spherical(rgb: [f32; 3]) -> [f32; 3] {
    let [r, g, b] = rgb.map(|v| v as f64);
    let axial = (r + g + b) * INV_SQRT3;
    let p = (2.0 * r - g - b) * INV_SQRT6;
    let q = (g - b) * INV_SQRT2;
    let chroma = (p * p + q * q).sqrt();
    let magnitude = (axial * axial + chroma * chroma).sqrt();
    let angle = chroma.atan2(axial);
    let mut hue = q.atan2(p) / TAU;
    if hue < 0.0 {
        hue += 1.0;
    }
    if hue >= 1.0 {
        hue -= 1.0;
    }
    [hue as f32, angle as f32, magnitude as f32]
}

pub fn spherical_to_rgb(sph: [f32; 3]) -> [f32; 3] {
    let [hue, angle, magnitude] = sph.map(|v| v as f64);
    let axial = magnitude * angle.cos();
    let chroma = magnitude * angle.sin();
    let phi = hue * TAU;
    let p = chroma * phi.cos();
    let q = chroma * phi.sin();
    let n = axial * INV_SQRT3;
    let r = n + 2.0 * p * INV_SQRT6;
    let g = n - p * INV_SQRT6 + q * INV_SQRT2;
    let b = n - p * INV_SQRT6 - q * INV_SQRT2;
    [r as f32, g as f32, b as f32]
}

/// Largest polar angle the saturation operators may reach before a color
/// would cross to the opposite side of the neutral axis.
pub const MAX_POLAR_ANGLE: f32 = (PI / 2.0) as f32;

/// Signed distance between two hues in turns, in `-0.5..0.5`.
pub fn hue_distance(a: f32, b: f32) -> f32 {
    let mut d = a - b;
    d -= d.round();
    d
}

// ============================================================================
// Gamut matrices and luminance
// ============================================================================

pub type Matrix3 = [[f32; 3]; 3];

/// Display P3 (linear) → ARRI Wide Gamut.
pub const P3_TO_AWG: Matrix3 = [
    [0.760019, 0.132484, 0.107497],
    [0.008408, 0.804728, 0.186864],
    [-0.001355, 0.085570, 0.915786],
];

/// ARRI Wide Gamut → Display P3 (linear).
pub const AWG_TO_P3: Matrix3 = [
    [1.317822, -0.204953, -0.112869],
    [-0.014538, 1.272477, -0.257939],
    [0.003309, -0.119202, 1.115893],
];

pub fn apply_matrix(m: &Matrix3, rgb: [f32; 3]) -> [f32; 3] {
    [
        m[0][0] * rgb[0] + m[0][1] * rgb[1] + m[0][2] * rgb[2],
        m[1][0] * rgb[0] + m[1][1] * rgb[1] + m[1][2] * rgb[2],
        m[2][0] * rgb[0] + m[2][1] * rgb[1] + m[2][2] * rgb[2],
    ]
}

/// Rec.709 luminance weights.
pub fn luminance(rgb: [f32; 3]) -> f32 {
    0.2126 * rgb[0] + 0.7152 * rgb[1] + 0.0722 * rgb[2]
}

pub fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    if edge1 == edge0 {
        return if x < edge0 { 0.0 } else { 1.0 };
    }
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

pub fn lerp3(a: [f32; 3], b: [f32; 3], t: f32) -> [f32; 3] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
    ]
}

/// Interpolate spherical triplets, taking hue along the shorter arc.
pub fn lerp_spherical(a: [f32; 3], b: [f32; 3], t: f32) -> [f32; 3] {
    let hue = (a[0] - hue_distance(a[0], b[0]) * t).rem_euclid(1.0);
    [hue, a[1] + (b[1] - a[1]) * t, a[2] + (b[2] - a[2]) * t]
}

// ============================================================================
// White balance
// ============================================================================

/// Approximate color of a black-body light source, normalized to green = 1.
///
/// Tanner Helland's fit of the Planckian locus, valid for 1000–40000 K.
#[allow(clippy::excessive_precision)]
pub fn kelvin_to_rgb(kelvin: f32) -> [f32; 3] {
    let temp = (kelvin as f64 / 100.0).clamp(10.0, 400.0);

    let (r, g, b) = if temp <= 66.0 {
        let g = 99.4708025861 * temp.ln() - 161.1195681661;
        let b = if temp <= 19.0 {
            0.0
        } else {
            138.5177312231 * (temp - 10.0).ln() - 305.0447927307
        };
        (255.0, g.clamp(0.0, 255.0), b.clamp(0.0, 255.0))
    } else {
        let r = 329.698727446 * (temp - 60.0).powf(-0.1332047592);
        let g = 288.1221695283 * (temp - 60.0).powf(-0.0755148492);
        (r.clamp(0.0, 255.0), g.clamp(0.0, 255.0), 255.0)
    };

    let g = g.max(0.255);
    [
        (r.max(0.255) / g) as f32,
        1.0,
        (b.max(0.255) / g) as f32,
    ]
}

/// Correlated color temperature of a CIE 1931 chromaticity (McCamy).
pub fn chromaticity_to_cct(x: f32, y: f32) -> f32 {
    let (x, y) = (x as f64, y as f64);
    let denom = 0.1858 - y;
    if denom.abs() < 1e-9 {
        return 6504.0;
    }
    let n = (x - 0.3320) / denom;
    (449.0 * n.powi(3) + 3525.0 * n.powi(2) + 6823.3 * n + 5520.33) as f32
}

/// Per-channel gains that re-balance an image shot under `as_shot_kelvin`
/// to a target white of `target_kelvin`, with a green/magenta `tint`
/// (−100..100, positive is magenta).
pub fn white_balance_gains(as_shot_kelvin: f32, target_kelvin: f32, tint: f32) -> [f32; 3] {
    let shot = kelvin_to_rgb(as_shot_kelvin);
    let target = kelvin_to_rgb(target_kelvin);
    let tint_factor = 1.0 - tint / 200.0;
    [
        shot[0] / target[0],
        shot[1] / target[1] * tint_factor,
        shot[2] / target[2],
    ]
}
