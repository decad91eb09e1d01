//! colorforge - analog print simulation for RAW-derived images
//!
//! Runs a linear image through a fixed chain of film, enlarger and scanner
//! operators, with per-region overrides, across a pool of execution
//! contexts. Output is display-encoded and can be exported with its
//! original metadata carried alongside untouched.

pub mod buffer;
pub mod color;
pub mod config;
pub mod error;
pub mod export;
pub mod grain;
pub mod lod;
pub mod lut;
pub mod mask;
pub mod metrics;
pub mod operators;
pub mod params;
pub mod pipeline;
pub mod scheduler;

pub use buffer::{ColorSpace, Extent, FrameSize, ImageBuffer};
pub use config::{CalibrationTable, PipelineConfig, SchedulerConfig};
pub use error::{ForgeError, Result};
pub use export::{ExportConfig, ExportFormat, Exporter};
pub use grain::GrainSynthesizer;
pub use lod::{FileSource, InMemorySource, LevelOfDetailCache, SourceProvider, ZoomRect};
pub use lut::{Lut3D, LutBank};
pub use mask::MaskCompositor;
pub use metrics::{ImageOutcomeKind, Metrics, MetricsSnapshot};
pub use operators::{Operator, RenderContext};
pub use params::{
    FilmStock, GateFormat, ImageId, ImageRecord, ParamStore, ParameterSet, Point, Region, RegionGeometry, RenderJob,
    RenderTier, Settings, SourceInfo,
};
pub use pipeline::{PipelineExecutor, RenderReport, STAGE_ORDER_VERSION};
pub use scheduler::{BatchReport, ConcurrencyScheduler, ImageOutcome, ImageState};
