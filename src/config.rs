//! Calibration and runtime configuration
//!
//! Every empirically tuned constant used by the operators lives in
//! [`CalibrationTable`] so it can be swapped from a JSON file without touching
//! code. Defaults carry the shipped calibration values.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use colorforge::config::{CalibrationTable, PipelineConfig};
//!
//! let calibration = CalibrationTable::from_json_file("calibration.json")?;
//! let pipeline = PipelineConfig::export();
//! ```

use crate::error::{ForgeError, Result};
use crate::params::GateFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// Calibration
// ============================================================================

/// Enlarger color-head calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnlargerCalibration {
    /// Density per dial unit for the cyan, magenta and yellow filters
    pub density_per_unit: [f32; 3],
    /// Paper maximum density for red, green and blue
    pub paper_dmax: [f32; 3],
    /// Dial offsets that place the reference filter pack for masked edits
    pub pack_offsets: [f32; 3],
    /// Seconds added to the enlarger time in black-and-white mode
    pub bw_time_offset: f32,
    /// Multigrade contrast gained per unit of magenta density
    pub bw_grade_per_density: f32,
}

impl Default for EnlargerCalibration {
    fn default() -> Self {
        Self {
            density_per_unit: [0.5632184 * 0.01, 0.41666667 * 0.01, 0.27011494 * 0.01],
            paper_dmax: [2.1466, 2.7104, 3.1870],
            pack_offsets: [33.71, 93.61 - 48.0, 157.33 - 87.0],
            bw_time_offset: 8.0,
            bw_grade_per_density: 1.5,
        }
    }
}

/// Flash (paper pre-exposure) calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashCalibration {
    /// Color of the unfiltered flash light on paper
    pub base_color: [f32; 3],
    /// Dial offsets of the flash filter pack (cyan, magenta, yellow)
    pub filter_offsets: [f32; 3],
    /// Exposure scale of the flash relative to the print exposure
    pub strength: f32,
}

impl Default for FlashCalibration {
    fn default() -> Self {
        Self {
            base_color: [0.466, 0.206, 0.109],
            filter_offsets: [0.0, -12.0, -81.0],
            strength: 1.0,
        }
    }
}

/// Sharpness (MTF) band calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MtfCalibration {
    /// Band centre frequencies in line pairs per millimetre
    pub frequencies: [f32; 4],
    pub red_gains: [f32; 4],
    pub green_gains: [f32; 4],
    pub blue_gains: [f32; 4],
    /// Bands whose Gaussian sigma falls below this many pixels are skipped
    pub min_sigma_px: f32,
}

impl Default for MtfCalibration {
    fn default() -> Self {
        Self {
            frequencies: [10.0, 20.0, 50.0, 100.0],
            red_gains: [0.95, 0.80, 0.45, 0.15],
            green_gains: [0.95, 0.85, 0.55, 0.25],
            blue_gains: [0.90, 0.70, 0.55, 0.30],
            min_sigma_px: 0.35,
        }
    }
}

/// Paper and print-finishing calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperCalibration {
    /// Paper base color (linear)
    pub base_color: [f32; 3],
    /// Maximum paper density, sets the print black
    pub dmax: f32,
    /// Print width used for paper soften
    pub print_width_mm: f32,
    /// Frequency above which the paper softens detail
    pub soften_lpmm: f32,
    pub soften_gain: f32,
    /// Gamut compression: distance where compression starts, distance mapped
    /// onto the gamut boundary, and curve power
    pub gamut_threshold: f32,
    pub gamut_limit: f32,
    pub gamut_power: f32,
    /// Output tone curve control points (input, output), display encoded
    pub output_curve: Vec<[f32; 2]>,
}

impl Default for PaperCalibration {
    fn default() -> Self {
        Self {
            base_color: [0.976, 0.976, 0.985],
            dmax: 2.3,
            print_width_mm: 406.4,
            soften_lpmm: 15.0,
            soften_gain: 0.5,
            gamut_threshold: 0.8,
            gamut_limit: 1.2,
            gamut_power: 1.2,
            output_curve: vec![
                [0.0, 0.0],
                [32.0 / 255.0, 22.0 / 255.0],
                [64.0 / 255.0, 56.0 / 255.0],
                [128.0 / 255.0, 128.0 / 255.0],
                [192.0 / 255.0, 196.0 / 255.0],
                [1.0, 1.0],
            ],
        }
    }
}

/// Grain geometry calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrainCalibration {
    /// Long edge (px) of the reference capture
    pub reference_long_edge: f32,
    /// Gate width (mm) of the reference capture
    pub reference_gate_mm: f32,
    /// Grain feature size in plate pixels at the reference geometry
    pub reference_feature_px: f32,
    /// Long edge the base plate is authored against
    pub base_length: f32,
    /// Side of the square base plate in plate pixels
    pub plate_size: u32,
    /// Fraction of the tile used for the feathered edge
    pub feather: f32,
    /// Grid step as a fraction of the tile side
    pub step: f32,
    /// Random grid jitter as a fraction of the step
    pub jitter: f32,
    /// Random plate offset as a fraction of the plate side
    pub plate_offset: f32,
    /// Maximum per-copy rotation in degrees
    pub max_rotation_deg: f32,
    /// Amplitude of the grain in LogC code values at amount 100
    pub strength: f32,
}

impl Default for GrainCalibration {
    fn default() -> Self {
        Self {
            reference_long_edge: 17512.0,
            reference_gate_mm: 36.0,
            reference_feature_px: 2.0,
            base_length: 11000.0,
            plate_size: 512,
            feather: 0.2,
            step: 0.5 * 0.95,
            jitter: 0.1,
            plate_offset: 0.25,
            max_rotation_deg: 3.0,
            strength: 0.06,
        }
    }
}

/// Film-scanner calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanCalibration {
    /// Slider units per normalized code value
    pub code_scale: f32,
    /// Per-channel base offsets added to the red, green and blue sliders
    pub channel_offsets: [f32; 3],
    /// Per-channel slider divisor
    pub channel_divisor: f32,
}

impl Default for ScanCalibration {
    fn default() -> Self {
        Self {
            code_scale: 400.0,
            channel_offsets: [-68.0, 3.0, 35.0],
            channel_divisor: 3.0,
        }
    }
}

/// Raw-stage tone constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneCalibration {
    /// Scene-linear mid gray used as the contrast pivot
    pub mid_gray: f32,
    /// Kelvin added to the target white when converting to a negative
    pub negative_temperature_offset: f32,
    /// Stops added in negative mode (color) and again in scan mode
    pub negative_exposure_offset: f32,
    pub scan_exposure_offset: f32,
    /// Log offset per unit of HDR slider at full zone weight
    pub hdr_strength: f32,
    /// Hue-sector centres in turns, order R, Y, G, C, B, M
    pub hue_sectors: [f32; 6],
    /// Polar angle (radians) at which HSD reaches full strength
    pub hsd_chroma_knee: f32,
}

impl Default for ToneCalibration {
    fn default() -> Self {
        Self {
            mid_gray: 0.18,
            negative_temperature_offset: 1650.0,
            negative_exposure_offset: 2.0,
            scan_exposure_offset: 2.0,
            hdr_strength: 0.1,
            hue_sectors: [0.0, 1.0 / 6.0, 2.0 / 6.0, 3.0 / 6.0, 4.0 / 6.0, 5.0 / 6.0],
            hsd_chroma_knee: 0.15,
        }
    }
}

/// All swappable calibration constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationTable {
    pub enlarger: EnlargerCalibration,
    pub flash: FlashCalibration,
    pub mtf: MtfCalibration,
    pub paper: PaperCalibration,
    pub grain: GrainCalibration,
    pub tone: ToneCalibration,
    pub scan: ScanCalibration,
    /// Gate width in millimetres for each [`GateFormat`], in enum order
    pub gate_widths_mm: Vec<f32>,
}

impl Default for CalibrationTable {
    fn default() -> Self {
        Self {
            enlarger: EnlargerCalibration::default(),
            flash: FlashCalibration::default(),
            mtf: MtfCalibration::default(),
            paper: PaperCalibration::default(),
            grain: GrainCalibration::default(),
            tone: ToneCalibration::default(),
            scan: ScanCalibration::default(),
            gate_widths_mm: vec![
                60.0, 43.8, 36.0, 18.0, 21.95, 24.89, 10.26, 4.8, 5.79, 127.0, 107.95,
            ],
        }
    }
}

impl CalibrationTable {
    /// Load a calibration table; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let table: Self = serde_json::from_str(&text)?;
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gate_widths_mm.len() != GateFormat::ALL.len() {
            return Err(ForgeError::Config(format!(
                "Expected {} gate widths, found {}",
                GateFormat::ALL.len(),
                self.gate_widths_mm.len()
            )));
        }
        if self.gate_widths_mm.iter().any(|w| *w <= 0.0) {
            return Err(ForgeError::Config("Gate widths must be positive".to_string()));
        }
        if self.paper.output_curve.len() < 2 {
            return Err(ForgeError::Config("Output curve needs at least two points".to_string()));
        }
        if self.grain.plate_size < 16 {
            return Err(ForgeError::Config("Grain plate size must be at least 16".to_string()));
        }
        Ok(())
    }

    pub fn gate_width_mm(&self, format: GateFormat) -> f32 {
        self.gate_widths_mm
            .get(format.index())
            .copied()
            .unwrap_or(self.grain.reference_gate_mm)
    }
}

// ============================================================================
// Runtime configuration
// ============================================================================

/// Resolution and caching behaviour of the render pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Long edge of the low-resolution UI buffer
    pub ui_long_edge: u32,
    /// Maximum number of tiled grain plates kept per synthesizer
    pub tiled_grain_cache: usize,
    /// Seed of the procedural grain field
    pub grain_seed: u32,
    /// Edge length of generated film LUTs
    pub lut_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ui_long_edge: 1600,
            tiled_grain_cache: 8,
            grain_seed: 0x5eed_f11d,
            lut_size: 33,
        }
    }
}

impl PipelineConfig {
    /// Small buffers and LUTs for interactive preview.
    pub fn preview() -> Self {
        Self {
            ui_long_edge: 1024,
            tiled_grain_cache: 4,
            lut_size: 25,
            ..Default::default()
        }
    }

    /// Larger LUTs for final output.
    pub fn export() -> Self {
        Self {
            ui_long_edge: 2048,
            tiled_grain_cache: 2,
            lut_size: 65,
            ..Default::default()
        }
    }
}

/// Execution-context pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of execution contexts; `None` uses available cores − 1
    pub contexts: Option<usize>,
    /// Maximum queued batches per context
    pub queue_depth: usize,
    /// Serve a placeholder instead of waiting for a first-touch source load
    pub serve_placeholders: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            contexts: None,
            queue_depth: 4,
            serve_placeholders: false,
        }
    }
}

impl SchedulerConfig {
    pub fn with_contexts(contexts: usize) -> Self {
        Self {
            contexts: Some(contexts),
            ..Default::default()
        }
    }

    /// Resolve the context count: `max(1, cores − 1)` unless overridden.
    pub fn resolved_contexts(&self) -> usize {
        match self.contexts {
            Some(n) => n,
            None => {
                let cores = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(2);
                cores.saturating_sub(1).max(1)
            }
        }
    }
}
