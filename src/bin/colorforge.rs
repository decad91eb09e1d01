// colorforge - batch print simulation
// Renders decoded linear images through the film pipeline and exports them

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use colorforge::{
    CalibrationTable, ConcurrencyScheduler, ExportConfig, ExportFormat, Exporter, FileSource, FilmStock,
    ImageId, ImageOutcome, LevelOfDetailCache, Lut3D, LutBank, ParamStore, PipelineConfig, PipelineExecutor, RenderTier,
    SchedulerConfig, Settings, SourceInfo,
};

#[derive(Parser)]
#[command(name = "colorforge", version, about = "Analog print simulation for RAW-derived images")]
struct Args {
    /// Decoded input images (8/16-bit TIFF, PNG or JPEG); repeat for a batch
    #[arg(long, short, required = true)]
    input: Vec<PathBuf>,

    /// Output file for a single input, otherwise a directory
    #[arg(long, short, default_value = ".")]
    output: PathBuf,

    /// Settings JSON (global parameters plus regions) applied to every input
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Calibration table JSON; built-in constants when omitted
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Output format (jpeg, png, webp, tiff) when it cannot be taken from --output
    #[arg(long, default_value = "jpeg")]
    format: String,

    /// JPEG/WEBP quality
    #[arg(long, default_value_t = 92)]
    quality: u8,

    /// Also write a thumbnail with this long edge
    #[arg(long)]
    thumbnail: Option<u32>,

    /// Opaque metadata blob copied next to every export
    #[arg(long)]
    metadata: Option<PathBuf>,

    /// .cube LUT replacing the procedural curve of the selected stock
    #[arg(long)]
    stock_lut: Option<PathBuf>,

    /// Number of execution contexts; defaults to cores - 1
    #[arg(long)]
    contexts: Option<usize>,
}

fn image_id(path: &Path) -> ImageId {
    ImageId::new(path.file_stem().and_then(|s| s.to_str()).unwrap_or("image"))
}

/// `--output` names a file only for a single input with a known extension.
fn output_file(args: &Args) -> Option<PathBuf> {
    if args.input.len() != 1 {
        return None;
    }
    ExportFormat::from_path(&args.output).map(|_| args.output.clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args = Args::parse();

    info!("🎞️ Starting colorforge");
    info!("   Inputs: {}", args.input.len());

    let single_output = output_file(&args);
    let format = match &single_output {
        Some(path) => ExportFormat::from_path(path),
        None => ExportFormat::from_path(format!("out.{}", args.format)),
    }
    .with_context(|| format!("Unsupported output format '{}'", args.format))?;

    let calibration = match &args.calibration {
        Some(path) => CalibrationTable::from_json_file(path)
            .with_context(|| format!("Failed to load calibration table {}", path.display()))?,
        None => CalibrationTable::default(),
    };
    info!("   ✓ Calibration loaded");

    let settings = match &args.settings {
        Some(path) => Settings::from_json_file(path)
            .with_context(|| format!("Failed to read settings {}", path.display()))?,
        None => Settings::default(),
    };

    let metadata = match &args.metadata {
        Some(path) => Some(std::fs::read(path).context("Failed to read metadata blob")?),
        None => None,
    };

    let config = PipelineConfig::export();
    let mut luts = LutBank::procedural(config.lut_size);
    if let Some(path) = &args.stock_lut {
        let lut = Lut3D::from_cube_file(path).context("Failed to load stock LUT")?;
        let stock: FilmStock = settings.global.stock;
        luts = luts.with_stock_lut(stock, lut);
        info!("   ✓ {:?} curve replaced by {}", stock, path.display());
    }

    let source = Arc::new(FileSource::new());
    let store = ParamStore::new();
    let mut ids = Vec::with_capacity(args.input.len());
    for input in &args.input {
        let (width, height) = image::image_dimensions(input)
            .with_context(|| format!("Failed to read {}", input.display()))?;
        let id = image_id(input);
        if store.contains(&id) {
            bail!("Two inputs share the name '{}'", id);
        }
        source.insert(id.clone(), input.clone());
        store.insert(settings.clone().into_record(id.clone(), SourceInfo::with_native_size(width, height)));
        ids.push(id);
    }

    let executor = PipelineExecutor::new(Arc::new(calibration), config.clone()).with_luts(luts);
    let lod = Arc::new(LevelOfDetailCache::new(source, config.ui_long_edge));
    let scheduler_config = SchedulerConfig {
        contexts: args.contexts,
        ..Default::default()
    };
    let scheduler = ConcurrencyScheduler::new(executor, lod, scheduler_config)
        .context("Failed to start execution contexts")?;
    info!("   ✓ {} execution contexts", scheduler.context_count());

    let report = scheduler.process_tier(&ids, &store, RenderTier::Export).await?;

    let exporter = Exporter::new(ExportConfig {
        format,
        quality: args.quality,
        thumbnail_long_edge: args.thumbnail,
        ..Default::default()
    });

    let mut failed = 0;
    for result in &report.results {
        let Some(image) = result.image().filter(|_| result.is_done()) else {
            match &result.outcome {
                ImageOutcome::Failed(reason) => warn!("⚠️ {} failed: {}", result.id, reason),
                _ => warn!("⚠️ {} was not rendered ({:?})", result.id, result.state()),
            }
            failed += 1;
            continue;
        };
        let job = store.snapshot(&result.id, result.token)?;
        let output = match &single_output {
            Some(path) => path.clone(),
            None => args.output.join(format!("{}.{}", result.id, format.extension())),
        };
        exporter
            .write(image, &output, metadata.as_deref(), &job)
            .with_context(|| format!("Failed to export {}", result.id))?;
    }

    let snapshot = scheduler.metrics().snapshot();
    info!(
        "📊 {} done, {} failed in {} ms (avg {} ms/image)",
        snapshot.images_done, snapshot.images_failed, report.elapsed_ms, snapshot.avg_latency_ms
    );
    info!("   {}", serde_json::to_string(&snapshot)?);

    if failed > 0 {
        bail!("{} of {} images failed", failed, report.results.len());
    }
    Ok(())
}
