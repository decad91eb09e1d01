//! Parameter sets, regions and image records
//!
//! A [`ParameterSet`] is the flat value object every operator reads. Each
//! [`ImageRecord`] owns one global set plus an ordered list of [`Region`]s,
//! each with its own set. [`ParamStore`] is the caller-owned collection the
//! scheduler snapshots from and writes results back into.

use crate::buffer::ImageBuffer;
use crate::error::{ForgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};

// ============================================================================
// Enumerated settings
// ============================================================================

/// Negative film stock emulated by the film-stock LUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilmStock {
    #[default]
    Portra400,
    Portra400Plus1,
    Portra400Plus2,
    Gold200,
    TMax400,
}

impl FilmStock {
    pub const ALL: [FilmStock; 5] = [
        FilmStock::Portra400,
        FilmStock::Portra400Plus1,
        FilmStock::Portra400Plus2,
        FilmStock::Gold200,
        FilmStock::TMax400,
    ];

    pub fn is_monochrome(&self) -> bool {
        matches!(self, FilmStock::TMax400)
    }
}

/// Film format class; selects the grain plate and the MTF geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateFormat {
    MediumFormat,
    CropMedium,
    #[default]
    ThirtyFive,
    HalfFrame,
    MotionStandard35,
    MotionSuper35,
    Motion16,
    Motion8,
    MotionSuper8,
    LargeFormat,
    LargeFormatCrop,
}

impl GateFormat {
    pub const ALL: [GateFormat; 11] = [
        GateFormat::MediumFormat,
        GateFormat::CropMedium,
        GateFormat::ThirtyFive,
        GateFormat::HalfFrame,
        GateFormat::MotionStandard35,
        GateFormat::MotionSuper35,
        GateFormat::Motion16,
        GateFormat::Motion8,
        GateFormat::MotionSuper8,
        GateFormat::LargeFormat,
        GateFormat::LargeFormatCrop,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }
}

// ============================================================================
// ParameterSet
// ============================================================================

/// Flat set of operator parameters.
///
/// Slider values follow the UI scales: most are −100..100 with 0 neutral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterSet {
    // Raw adjustments
    pub apply_temp_tint: bool,
    /// Target white in Kelvin
    pub temperature: f32,
    pub tint: f32,
    pub apply_exposure: bool,
    /// Exposure in stops
    pub exposure: f32,
    pub apply_contrast: bool,
    pub contrast: f32,
    pub apply_saturation: bool,
    pub saturation: f32,
    pub apply_hdr: bool,
    pub hdr_white: f32,
    pub hdr_highlight: f32,
    pub hdr_shadow: f32,
    pub hdr_black: f32,

    // Hue / saturation / density per sector, order R, Y, G, C, B, M
    pub apply_hsd: bool,
    pub hsd_hue: [f32; 6],
    pub hsd_saturation: [f32; 6],
    pub hsd_density: [f32; 6],

    // Texture
    pub apply_mtf: bool,
    pub mtf_amount: f32,
    pub apply_grain: bool,
    pub grain_amount: f32,
    pub gate_format: GateFormat,

    // Negative / print / scan modes
    pub convert_to_neg: bool,
    pub stock: FilmStock,
    pub apply_print_mode: bool,
    pub apply_scan_mode: bool,
    pub bw_mode: bool,

    // Scan
    pub offset_rgb: f32,
    pub offset_red: f32,
    pub offset_green: f32,
    pub offset_blue: f32,
    pub apply_print_film_lut: bool,
    pub print_film_lut_blend: f32,
    pub scan_contrast: f32,

    // Enlarger
    pub enlarger_seconds: f32,
    pub enlarger_fstop: f32,
    pub cyan: f32,
    pub magenta: f32,
    pub yellow: f32,

    // Print halation
    pub print_halation_apply: bool,
    pub print_halation_size: f32,
    pub print_halation_amount: f32,
    pub print_halation_darken: bool,

    // Flash
    pub apply_flash: bool,
    pub flash_seconds: f32,
    pub flash_fstop: f32,
    pub flash_cyan: f32,
    pub flash_magenta: f32,
    pub flash_yellow: f32,

    // Paper finishing
    pub apply_paper_soften: bool,
    pub apply_output_curve: bool,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self {
            apply_temp_tint: true,
            temperature: 5500.0,
            tint: 0.0,
            apply_exposure: true,
            exposure: 0.0,
            apply_contrast: true,
            contrast: 0.0,
            apply_saturation: true,
            saturation: 0.0,
            apply_hdr: true,
            hdr_white: 0.0,
            hdr_highlight: 0.0,
            hdr_shadow: 0.0,
            hdr_black: 0.0,
            apply_hsd: true,
            hsd_hue: [0.0; 6],
            hsd_saturation: [0.0; 6],
            hsd_density: [0.0; 6],
            apply_mtf: false,
            mtf_amount: 100.0,
            apply_grain: false,
            grain_amount: 50.0,
            gate_format: GateFormat::ThirtyFive,
            convert_to_neg: false,
            stock: FilmStock::Portra400,
            apply_print_mode: false,
            apply_scan_mode: false,
            bw_mode: false,
            offset_rgb: 0.0,
            offset_red: 0.0,
            offset_green: 0.0,
            offset_blue: 0.0,
            apply_print_film_lut: false,
            print_film_lut_blend: 100.0,
            scan_contrast: 0.0,
            enlarger_seconds: 12.0,
            enlarger_fstop: 11.0,
            cyan: 0.0,
            magenta: 0.0,
            yellow: 0.0,
            print_halation_apply: false,
            print_halation_size: 10.0,
            print_halation_amount: 50.0,
            print_halation_darken: true,
            apply_flash: false,
            flash_seconds: 2.0,
            flash_fstop: 16.0,
            flash_cyan: 0.0,
            flash_magenta: 0.0,
            flash_yellow: 0.0,
            apply_paper_soften: true,
            apply_output_curve: true,
        }
    }
}

impl ParameterSet {
    /// Negative conversion with the darkroom print path active.
    pub fn print_preset() -> Self {
        Self {
            convert_to_neg: true,
            apply_print_mode: true,
            ..Default::default()
        }
    }

    /// Negative conversion with the film-scanner path active.
    pub fn scan_preset() -> Self {
        Self {
            convert_to_neg: true,
            apply_scan_mode: true,
            ..Default::default()
        }
    }

    /// Enlarger print path is active (color or black and white).
    pub fn printing(&self) -> bool {
        self.convert_to_neg && self.apply_print_mode
    }

    /// Film-scanner path is active.
    pub fn scanning(&self) -> bool {
        self.convert_to_neg && self.apply_scan_mode
    }
}

// ============================================================================
// Regions
// ============================================================================

pub type RegionId = u32;

/// Point in normalized frame coordinates (0..1 on both axes).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Single-channel mask raster used as alpha by freeform regions.
///
/// Deserialization goes through [`FreeformMask::new`], so a settings file
/// with the wrong number of values is rejected on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFreeformMask")]
pub struct FreeformMask {
    pub width: u32,
    pub height: u32,
    pub values: Arc<Vec<f32>>,
}

#[derive(Deserialize)]
struct RawFreeformMask {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl TryFrom<RawFreeformMask> for FreeformMask {
    type Error = ForgeError;

    fn try_from(raw: RawFreeformMask) -> Result<Self> {
        Self::new(raw.width, raw.height, raw.values)
    }
}

impl FreeformMask {
    pub fn new(width: u32, height: u32, values: Vec<f32>) -> Result<Self> {
        if values.len() != width as usize * height as usize {
            return Err(ForgeError::ValidationError(format!(
                "Mask has {} values for {}x{}",
                values.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            values: Arc::new(values),
        })
    }

    /// Load a grayscale mask image; white is full effect.
    pub fn from_image_file(path: impl AsRef<Path>) -> Result<Self> {
        let luma = image::open(path.as_ref())?.to_luma32f();
        let (width, height) = luma.dimensions();
        Self::new(width, height, luma.into_raw())
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.values.is_empty()
    }

    /// The raster holds exactly `width * height` values.
    pub fn is_valid(&self) -> bool {
        self.values.len() == self.width as usize * self.height as usize
    }

    /// Bilinear sample at normalized coordinates. Malformed masks sample as zero.
    pub fn sample(&self, u: f32, v: f32) -> f32 {
        if self.is_empty() || !self.is_valid() {
            return 0.0;
        }
        let fx = (u * self.width as f32 - 0.5).clamp(0.0, (self.width - 1) as f32);
        let fy = (v * self.height as f32 - 0.5).clamp(0.0, (self.height - 1) as f32);
        let (x0, y0) = (fx.floor() as usize, fy.floor() as usize);
        let x1 = (x0 + 1).min(self.width as usize - 1);
        let y1 = (y0 + 1).min(self.height as usize - 1);
        let (tx, ty) = (fx - x0 as f32, fy - y0 as f32);
        let w = self.width as usize;
        let top = self.values[y0 * w + x0] * (1.0 - tx) + self.values[y0 * w + x1] * tx;
        let bottom = self.values[y1 * w + x0] * (1.0 - tx) + self.values[y1 * w + x1] * tx;
        top * (1.0 - ty) + bottom * ty
    }
}

/// Region geometry. Coordinates are normalized to the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionGeometry {
    /// Full effect at `start`, fading to none at `end`
    Linear {
        start: Point,
        end: Point,
        invert: bool,
        opacity: f32,
    },
    /// Ellipse centred at `start`; `end` sets the rotation of the width axis
    Radial {
        start: Point,
        end: Point,
        width: f32,
        height: f32,
        feather: f32,
        invert: bool,
        opacity: f32,
    },
    Freeform {
        mask: FreeformMask,
        invert: bool,
        opacity: f32,
    },
}

impl RegionGeometry {
    pub fn linear(start: Point, end: Point) -> Self {
        RegionGeometry::Linear {
            start,
            end,
            invert: false,
            opacity: 100.0,
        }
    }

    pub fn radial(center: Point, width: f32, height: f32, feather: f32) -> Self {
        RegionGeometry::Radial {
            start: center,
            end: center,
            width,
            height,
            feather,
            invert: false,
            opacity: 100.0,
        }
    }

    pub fn freeform(mask: FreeformMask) -> Self {
        RegionGeometry::Freeform {
            mask,
            invert: false,
            opacity: 100.0,
        }
    }

    /// Coincident defining points mean "whole frame".
    pub fn is_degenerate(&self) -> bool {
        match self {
            RegionGeometry::Linear { start, end, .. } => start == end,
            RegionGeometry::Radial { width, height, .. } => *width == 0.0 || *height == 0.0,
            RegionGeometry::Freeform { mask, .. } => mask.is_empty(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RegionGeometry::Linear { .. } => "linear",
            RegionGeometry::Radial { .. } => "radial",
            RegionGeometry::Freeform { .. } => "freeform",
        }
    }

    /// Linear and radial geometry is always usable; a freeform raster must
    /// match its declared size.
    pub fn is_well_formed(&self) -> bool {
        match self {
            RegionGeometry::Freeform { mask, .. } => mask.is_valid(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub geometry: RegionGeometry,
}

// ============================================================================
// Image records
// ============================================================================

/// Stable image identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Values extracted from the source file by the external RAW decoder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceInfo {
    /// As-shot neutral chromaticity (CIE 1931 x, y)
    pub neutral: [f32; 2],
    /// Baseline exposure in stops
    pub baseline_exposure: f32,
    pub native_width: u32,
    pub native_height: u32,
}

impl Default for SourceInfo {
    fn default() -> Self {
        Self {
            neutral: [0.3324, 0.3474],
            baseline_exposure: 0.0,
            native_width: 6000,
            native_height: 4000,
        }
    }
}

impl SourceInfo {
    pub fn with_native_size(width: u32, height: u32) -> Self {
        Self {
            native_width: width,
            native_height: height,
            ..Default::default()
        }
    }

    pub fn native_long_edge(&self) -> u32 {
        self.native_width.max(self.native_height).max(1)
    }
}

/// Resolution tier a render targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderTier {
    /// Low-resolution UI buffer, or a zoom crop when zoomed
    Ui,
    /// Full-resolution buffer
    HighRes,
    /// Full-resolution export
    Export,
}

/// Latest published result per tier, with the request token that produced it.
#[derive(Debug, Clone, Default)]
pub struct RenderResults {
    pub ui: Option<(u64, ImageBuffer)>,
    pub high_res: Option<(u64, ImageBuffer)>,
    pub export: Option<(u64, ImageBuffer)>,
}

impl RenderResults {
    fn slot_mut(&mut self, tier: RenderTier) -> &mut Option<(u64, ImageBuffer)> {
        match tier {
            RenderTier::Ui => &mut self.ui,
            RenderTier::HighRes => &mut self.high_res,
            RenderTier::Export => &mut self.export,
        }
    }

    pub fn get(&self, tier: RenderTier) -> Option<&ImageBuffer> {
        let slot = match tier {
            RenderTier::Ui => &self.ui,
            RenderTier::HighRes => &self.high_res,
            RenderTier::Export => &self.export,
        };
        slot.as_ref().map(|(_, image)| image)
    }
}

#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: ImageId,
    pub source: SourceInfo,
    pub global: ParameterSet,
    pub regions: Vec<Region>,
    pub region_params: HashMap<RegionId, ParameterSet>,
    pub results: RenderResults,
    next_region_id: RegionId,
}

impl ImageRecord {
    pub fn new(id: impl Into<ImageId>, source: SourceInfo) -> Self {
        Self {
            id: id.into(),
            source,
            global: ParameterSet::default(),
            regions: Vec::new(),
            region_params: HashMap::new(),
            results: RenderResults::default(),
            next_region_id: 1,
        }
    }

    pub fn with_params(mut self, params: ParameterSet) -> Self {
        self.global = params;
        self
    }

    /// Append a region; its parameters start as a copy of the global set.
    pub fn add_region(&mut self, geometry: RegionGeometry) -> RegionId {
        let params = self.global.clone();
        self.add_region_with(geometry, params)
    }

    pub fn add_region_with(&mut self, geometry: RegionGeometry, params: ParameterSet) -> RegionId {
        let id = self.next_region_id;
        self.next_region_id += 1;
        self.regions.push(Region { id, geometry });
        self.region_params.insert(id, params);
        id
    }

    pub fn remove_region(&mut self, id: RegionId) {
        self.regions.retain(|r| r.id != id);
        self.region_params.remove(&id);
    }

    /// Read-only snapshot handed to an execution context.
    pub fn snapshot(&self, token: u64) -> RenderJob {
        RenderJob {
            id: self.id.clone(),
            token,
            source: self.source,
            global: self.global.clone(),
            regions: self.regions.clone(),
            region_params: self.region_params.clone(),
        }
    }
}

/// Parameter snapshot of one image, taken at schedule time.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub id: ImageId,
    pub token: u64,
    pub source: SourceInfo,
    pub global: ParameterSet,
    pub regions: Vec<Region>,
    pub region_params: HashMap<RegionId, ParameterSet>,
}

impl RenderJob {
    /// Standalone job without a backing record.
    pub fn new(id: impl Into<ImageId>, source: SourceInfo, global: ParameterSet) -> Self {
        Self {
            id: id.into(),
            token: 0,
            source,
            global,
            regions: Vec::new(),
            region_params: HashMap::new(),
        }
    }
}

// ============================================================================
// Settings files
// ============================================================================

/// One region as stored in a settings file. Without `params` the region
/// starts from the global set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSettings {
    pub geometry: RegionGeometry,
    #[serde(default)]
    pub params: Option<ParameterSet>,
}

/// Settings record: global parameters plus ordered regions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub global: ParameterSet,
    pub regions: Vec<RegionSettings>,
}

impl Settings {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn into_record(self, id: impl Into<ImageId>, source: SourceInfo) -> ImageRecord {
        let mut record = ImageRecord::new(id, source).with_params(self.global);
        for region in self.regions {
            match region.params {
                Some(params) => record.add_region_with(region.geometry, params),
                None => record.add_region(region.geometry),
            };
        }
        record
    }
}

// ============================================================================
// ParamStore
// ============================================================================

/// Caller-owned collection of image records, shared by handle.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    records: Arc<RwLock<HashMap<ImageId, ImageRecord>>>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ImageRecord) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(record.id.clone(), record);
    }

    pub fn remove(&self, id: &ImageId) -> Option<ImageRecord> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.remove(id)
    }

    pub fn contains(&self, id: &ImageId) -> bool {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Edit a record in place.
    pub fn update<F, T>(&self, id: &ImageId, f: F) -> Result<T>
    where
        F: FnOnce(&mut ImageRecord) -> T,
    {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = records
            .get_mut(id)
            .ok_or_else(|| ForgeError::ImageNotFound(id.to_string()))?;
        Ok(f(record))
    }

    pub fn snapshot(&self, id: &ImageId, token: u64) -> Result<RenderJob> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .get(id)
            .map(|r| r.snapshot(token))
            .ok_or_else(|| ForgeError::ImageNotFound(id.to_string()))
    }

    pub fn source_info(&self, id: &ImageId) -> Option<SourceInfo> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(id).map(|r| r.source)
    }

    /// Publish a result unless a newer request already published for this tier.
    /// Returns whether the result was stored.
    pub fn write_back(&self, id: &ImageId, tier: RenderTier, token: u64, image: ImageBuffer) -> bool {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let Some(record) = records.get_mut(id) else {
            return false;
        };
        let slot = record.results.slot_mut(tier);
        if matches!(slot, Some((published, _)) if *published > token) {
            return false;
        }
        *slot = Some((token, image));
        true
    }

    /// Latest published result for a tier.
    pub fn result(&self, id: &ImageId, tier: RenderTier) -> Option<ImageBuffer> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(id).and_then(|r| r.results.get(tier).cloned())
    }
}
