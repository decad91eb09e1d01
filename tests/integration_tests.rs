//! Integration tests for the colorforge render pipeline and scheduler

use colorforge::color;
use colorforge::operators::{
    run, BwEnlarger, Contrast, DecodeNegative, Enlarger, Exposure, FilmStockLut, Flash, Hdr, Hsd, Mtf, OutputCurve,
    Paper, PrintFilmLut, PrintGamut, PrintHalation, Saturation, ScanContrast, ScanOffset, TempTint,
};
use colorforge::grain::Grain;
use colorforge::scheduler::ImageResult;
use colorforge::{
    CalibrationTable, ColorSpace, ConcurrencyScheduler, ExportConfig, ExportFormat, Exporter, Extent, ForgeError, FrameSize,
    GateFormat, GrainSynthesizer, ImageBuffer, ImageId, ImageOutcome, ImageOutcomeKind, ImageRecord, ImageState,
    InMemorySource, LevelOfDetailCache, Operator, ParamStore, ParameterSet, PipelineConfig, PipelineExecutor, Point,
    RegionGeometry, RenderContext, RenderJob, RenderTier, SchedulerConfig, SourceInfo,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Helper to build an executor with default calibration
fn executor() -> PipelineExecutor {
    PipelineExecutor::new(Arc::new(CalibrationTable::default()), PipelineConfig::default())
}

fn gradient(width: u32, height: u32) -> ImageBuffer {
    ImageBuffer::from_fn(width, height, ColorSpace::Linear, |x, y| {
        let u = x as f32 / width as f32;
        let v = y as f32 / height as f32;
        [0.05 + 0.5 * u, 0.08 + 0.3 * v, 0.25 - 0.15 * u]
    })
}

fn render(input: &ImageBuffer, record: &ImageRecord) -> ImageBuffer {
    executor().render(input, &record.snapshot(0), 1.0).unwrap().image
}

fn chroma(rgb: [f32; 3]) -> f32 {
    rgb.iter().cloned().fold(f32::MIN, f32::max) - rgb.iter().cloned().fold(f32::MAX, f32::min)
}

/// Small deterministic generator for randomized trials.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }

    fn below(&mut self, n: u32) -> u32 {
        self.next() % n
    }

    fn range(&mut self, lo: f32, hi: f32) -> f32 {
        lo + (hi - lo) * (self.next() as f32 / (1u64 << 31) as f32)
    }
}

// ============================================================================
// Operators
// ============================================================================

#[test]
fn test_disabled_nodes_return_input_untouched() {
    let ctx = RenderContext::detached(SourceInfo::default());
    let nodes: [(&dyn Operator, ParameterSet); 20] = [
        (&TempTint, ParameterSet { apply_temp_tint: false, temperature: 3000.0, ..Default::default() }),
        (&Exposure, ParameterSet { apply_exposure: false, exposure: 2.0, ..Default::default() }),
        (&Contrast, ParameterSet { apply_contrast: false, contrast: 60.0, ..Default::default() }),
        (&Saturation, ParameterSet { apply_saturation: false, saturation: 60.0, ..Default::default() }),
        (&Hdr, ParameterSet { apply_hdr: false, hdr_white: 50.0, ..Default::default() }),
        (&Hsd, ParameterSet { apply_hsd: false, hsd_hue: [80.0; 6], ..Default::default() }),
        (&Mtf, ParameterSet::default()),
        (&Grain, ParameterSet { grain_amount: 100.0, ..Default::default() }),
        (&FilmStockLut, ParameterSet::default()),
        (&DecodeNegative, ParameterSet::scan_preset()),
        (&Paper, ParameterSet::scan_preset()),
        (&ScanOffset, ParameterSet { offset_red: 30.0, ..ParameterSet::print_preset() }),
        (&PrintFilmLut, ParameterSet::scan_preset()),
        (&ScanContrast, ParameterSet { scan_contrast: 40.0, ..ParameterSet::print_preset() }),
        (&Enlarger, ParameterSet { cyan: 30.0, bw_mode: true, ..ParameterSet::print_preset() }),
        (&PrintHalation, ParameterSet::print_preset()),
        (&Flash, ParameterSet::print_preset()),
        (&PrintGamut, ParameterSet::scan_preset()),
        (&BwEnlarger, ParameterSet::print_preset()),
        (&OutputCurve, ParameterSet { apply_output_curve: false, ..ParameterSet::print_preset() }),
    ];

    for (op, params) in nodes {
        assert!(!op.is_enabled(&params), "{} should be disabled", op.name());
        let input = ImageBuffer::filled(12, 8, op.input_space(), [0.3, 0.4, 0.5]);
        let out = run(op, &input, &params, &ctx);
        assert!(out.shares_pixels(&input), "{} touched its input", op.name());
        assert_eq!(out.extent(), input.extent());
        assert_eq!(out.space(), input.space());
    }
}

// ============================================================================
// Pipeline and masks
// ============================================================================

#[test]
fn test_plus_one_stop_doubles_mean_luminance() {
    let input = ImageBuffer::filled(32, 24, ColorSpace::Linear, [0.18; 3]);
    let source = SourceInfo::with_native_size(32, 24);
    let base = render(&input, &ImageRecord::new("gray", source));
    let brighter = render(
        &input,
        &ImageRecord::new("gray", source).with_params(ParameterSet {
            exposure: 1.0,
            ..Default::default()
        }),
    );

    let ratio = brighter.mean_luminance() / base.mean_luminance();
    assert!((ratio - 2.0).abs() < 0.1, "ratio {}", ratio);
}

#[test]
fn test_degenerate_region_matches_global_application() {
    let input = gradient(40, 30);
    let source = SourceInfo::with_native_size(40, 30);
    let region_params = ParameterSet {
        exposure: 0.7,
        contrast: 25.0,
        saturation: -30.0,
        ..Default::default()
    };

    let mut masked = ImageRecord::new("img", source);
    let p = Point::new(0.4, 0.4);
    masked.add_region_with(RegionGeometry::linear(p, p), region_params.clone());
    let global = ImageRecord::new("img", source).with_params(region_params);

    let diff = render(&input, &masked).max_abs_diff(&render(&input, &global));
    assert!(diff < 1e-5, "diff {}", diff);
}

#[test]
fn test_region_order_only_matters_in_overlap() {
    let (width, height) = (64u32, 32u32);
    let input = gradient(width, height);
    let source = SourceInfo::with_native_size(width, height);
    let left = (Point::new(0.35, 0.5), ParameterSet { exposure: 1.0, ..Default::default() });
    let right = (Point::new(0.65, 0.5), ParameterSet { exposure: -1.0, ..Default::default() });

    let record = |order: [&(Point, ParameterSet); 2]| {
        let mut record = ImageRecord::new("img", source);
        for (centre, params) in order {
            record.add_region_with(RegionGeometry::radial(*centre, 0.4, 0.4, 0.0), params.clone());
        }
        record
    };
    let ab = render(&input, &record([&left, &right]));
    let ba = render(&input, &record([&right, &left]));

    // Ellipse distance as the mask sees it, with a margin around the edge
    let inside = |centre: Point, x: u32, y: u32| {
        let u = (x as f32 + 0.5 - centre.x * width as f32) / (0.2 * width as f32);
        let v = (y as f32 + 0.5 - centre.y * height as f32) / (0.2 * height as f32);
        (u * u + v * v).sqrt() < 1.02
    };

    let mut overlap_differs = false;
    for y in 0..height {
        for x in 0..width {
            let (a, b) = (ab.pixel(x, y), ba.pixel(x, y));
            let diff = (0..3).map(|c| (a[c] - b[c]).abs()).fold(0.0, f32::max);
            if inside(left.0, x, y) && inside(right.0, x, y) {
                overlap_differs |= diff > 1e-3;
            } else {
                assert!(diff < 1e-4, "({}, {}) differs by {} outside the overlap", x, y, diff);
            }
        }
    }
    assert!(overlap_differs);
}

#[test]
fn test_left_half_saturation_region() {
    let (width, height) = (64u32, 16u32);
    let input = ImageBuffer::filled(width, height, ColorSpace::Linear, [0.30, 0.18, 0.08]);
    let source = SourceInfo::with_native_size(width, height);

    let global = ImageRecord::new("img", source);
    let mut masked = ImageRecord::new("img", source);
    masked.add_region_with(
        RegionGeometry::linear(Point::new(0.0, 0.5), Point::new(0.5, 0.5)),
        ParameterSet {
            saturation: 50.0,
            ..Default::default()
        },
    );

    let plain = render(&input, &global);
    let out = render(&input, &masked);

    let right_half = Extent::new(width / 2, 0, width / 2, height);
    assert!(out.crop(right_half).max_abs_diff(&plain.crop(right_half)) < 1e-6);

    for y in 0..height {
        assert!(chroma(out.pixel(0, y)) > chroma(plain.pixel(0, y)) + 1e-3);
        assert!(chroma(out.pixel(8, y)) > chroma(plain.pixel(8, y)));
        assert!(chroma(out.pixel(0, y)) > chroma(out.pixel(width - 1, y)));
    }
}

#[test]
fn test_log_and_spherical_round_trips() {
    for i in 0..200 {
        let x = 0.001 + i as f32 * 0.04;
        let rgb = [x, x * 0.6 + 0.01, 0.5 - (i as f32 * 0.002)];
        let log = color::logc_encode_rgb(rgb);
        let back = color::logc_decode_rgb(log);
        for c in 0..3 {
            assert!((back[c] - rgb[c]).abs() <= 1e-5 * rgb[c].abs().max(1.0), "{:?} -> {:?}", rgb, back);
        }
        let sph = color::spherical_to_rgb(color::rgb_to_spherical(log));
        for c in 0..3 {
            assert!((sph[c] - log[c]).abs() < 1e-5, "{:?} -> {:?}", log, sph);
        }
    }
}

#[test]
fn test_grain_tiles_without_visible_seams() {
    let grain = GrainSynthesizer::new(Arc::new(CalibrationTable::default()), &PipelineConfig::default());
    let frame = FrameSize {
        width: 1200,
        height: 800,
    };
    for format in [GateFormat::ThirtyFive, GateFormat::MediumFormat, GateFormat::Motion16] {
        let seam = grain.seam_discontinuity(format, 6000, frame, 0.25);
        assert!(seam < 0.02, "{:?} seam {}", format, seam);
    }
}

// ============================================================================
// Scheduler
// ============================================================================

struct Harness {
    scheduler: ConcurrencyScheduler,
    store: ParamStore,
    source: Arc<InMemorySource>,
}

/// Scheduler over in-memory sources; `a1` and `a2` share one source.
fn harness(contexts: usize, serve_placeholders: bool) -> Harness {
    let source = Arc::new(InMemorySource::new());
    let store = ParamStore::new();
    let shared = gradient(32, 24);
    let other = ImageBuffer::filled(32, 24, ColorSpace::Linear, [0.25, 0.12, 0.06]);
    for (id, image) in [("a1", shared.clone()), ("a2", shared), ("b", other)] {
        source.insert(id, image);
        store.insert(ImageRecord::new(id, SourceInfo::with_native_size(32, 24)));
    }
    let lod = Arc::new(LevelOfDetailCache::new(source.clone(), 64));
    let config = SchedulerConfig {
        contexts: Some(contexts),
        serve_placeholders,
        ..Default::default()
    };
    let scheduler = ConcurrencyScheduler::new(executor(), lod, config).unwrap();
    Harness { scheduler, store, source }
}

fn ids(names: &[&str]) -> Vec<ImageId> {
    names.iter().map(|s| ImageId::from(*s)).collect()
}

fn done_image(result: &ImageResult) -> &ImageBuffer {
    match &result.outcome {
        ImageOutcome::Done(image) => image,
        _ => panic!("{} not done: {:?}", result.id, result.state()),
    }
}

#[tokio::test]
async fn test_concurrent_contexts_match_sequential_renders() {
    let parallel = harness(2, false);
    let sequential = harness(1, false);
    let all = ids(&["a1", "a2", "b"]);
    let mut rng = Lcg(0x00c0_ffee);

    for trial in 0..100 {
        // Same random edits in both stores
        for id in &all {
            let base = match rng.below(3) {
                0 => ParameterSet::default(),
                1 => ParameterSet::print_preset(),
                _ => ParameterSet::scan_preset(),
            };
            let global = ParameterSet {
                exposure: rng.range(-1.5, 1.5),
                contrast: rng.range(-40.0, 40.0),
                saturation: rng.range(-50.0, 50.0),
                cyan: rng.range(-20.0, 20.0),
                apply_grain: rng.below(4) == 0,
                ..base
            };
            let region = (rng.below(2) == 0).then(|| {
                let geometry = RegionGeometry::radial(Point::new(rng.range(0.2, 0.8), rng.range(0.2, 0.8)), 0.5, 0.4, 30.0);
                let params = ParameterSet {
                    exposure: rng.range(-1.0, 1.0),
                    ..global.clone()
                };
                (geometry, params)
            });
            for store in [&parallel.store, &sequential.store] {
                store
                    .update(id, |r| {
                        r.global = global.clone();
                        r.regions.clear();
                        r.region_params.clear();
                        if let Some((geometry, params)) = region.clone() {
                            r.add_region_with(geometry, params);
                        }
                    })
                    .unwrap();
            }
        }

        let mut batch = all.clone();
        for i in (1..batch.len()).rev() {
            batch.swap(i, rng.below(i as u32 + 1) as usize);
        }
        batch.truncate(1 + rng.below(3) as usize);

        let a = parallel.scheduler.process(&batch, &parallel.store).await.unwrap();
        let b = sequential.scheduler.process(&batch, &sequential.store).await.unwrap();
        for (x, y) in a.results.iter().zip(&b.results) {
            assert_eq!(x.id, y.id);
            let diff = done_image(x).max_abs_diff(done_image(y));
            assert!(diff < 1e-5, "trial {}: {} differs by {}", trial, x.id, diff);
        }
        if batch.len() > 1 {
            assert_eq!(a.results[1].context, Some(1));
        }
    }
    assert_eq!(parallel.scheduler.metrics().snapshot().images_failed, 0);
}

#[tokio::test]
async fn test_superseded_request_is_stale() {
    let h = harness(2, false);
    let batch = ids(&["a1", "b", "a1"]);
    let report = h.scheduler.process(&batch, &h.store).await.unwrap();

    assert!(matches!(report.results[0].outcome, ImageOutcome::Stale { .. }));
    assert!(report.results[1].is_done());
    assert!(report.results[2].is_done());
    assert_eq!(report.count(ImageOutcomeKind::Stale), 1);
    assert_eq!(h.scheduler.state(&batch[0]), ImageState::Done);

    // Only the latest request's result is published
    let published = h.store.result(&batch[0], RenderTier::Ui).unwrap();
    assert!(published.shares_pixels(done_image(&report.results[2])));
}

#[tokio::test]
async fn test_placeholder_served_until_source_loads() {
    let h = harness(1, true);
    let id = ImageId::from("b");

    let first = h.scheduler.process(&[id.clone()], &h.store).await.unwrap();
    let ImageOutcome::Placeholder(placeholder) = &first.results[0].outcome else {
        panic!("expected a placeholder");
    };
    assert_eq!(placeholder.space(), ColorSpace::Display);
    assert_eq!(h.scheduler.state(&id), ImageState::Idle);
    assert!(h.store.result(&id, RenderTier::Ui).is_none());

    for _ in 0..200 {
        if h.scheduler.lod().is_ready(&id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.scheduler.lod().is_ready(&id));

    let second = h.scheduler.process(&[id.clone()], &h.store).await.unwrap();
    assert!(second.results[0].is_done());
    assert_eq!(h.scheduler.metrics().snapshot().pipeline.lod_placeholders, 1);
}

#[tokio::test]
async fn test_missing_source_fails_only_that_image() {
    let h = harness(2, false);
    let batch = ids(&["a1", "b"]);
    h.source.remove(&batch[1]);

    let report = h.scheduler.process(&batch, &h.store).await.unwrap();
    assert!(report.results[0].is_done());
    assert!(matches!(report.results[1].outcome, ImageOutcome::Failed(_)));
    assert_eq!(h.scheduler.state(&batch[1]), ImageState::Failed);
}

#[test]
fn test_zero_contexts_is_rejected() {
    let lod = Arc::new(LevelOfDetailCache::new(Arc::new(InMemorySource::new()), 64));
    let result = ConcurrencyScheduler::new(executor(), lod, SchedulerConfig::with_contexts(0));
    assert!(matches!(result, Err(ForgeError::ContextCreation(_))));
}

// ============================================================================
// Export
// ============================================================================

#[tokio::test]
async fn test_export_batch_writes_files_and_metadata() {
    let h = harness(2, false);
    h.store
        .update(&ImageId::from("a1"), |r| r.global = ParameterSet::print_preset())
        .unwrap();
    let batch = ids(&["a1", "b"]);
    let report = h.scheduler.process_tier(&batch, &h.store, RenderTier::Export).await.unwrap();

    let dir = TempDir::new().unwrap();
    let exporter = Exporter::new(ExportConfig {
        format: ExportFormat::Png,
        thumbnail_long_edge: Some(8),
        ..Default::default()
    });
    let blob = b"opaque-exif-blob\x00\x01\x02".to_vec();

    for result in &report.results {
        let image = done_image(result);
        assert_eq!((image.width(), image.height()), (32, 24));
        let job: RenderJob = h.store.snapshot(&result.id, result.token).unwrap();
        let output = dir.path().join(format!("{}.png", result.id));
        let summary = exporter.write(image, &output, Some(&blob[..]), &job).unwrap();

        assert_eq!(image::open(&summary.output).unwrap().width(), 32);
        assert_eq!(std::fs::read(summary.metadata.unwrap()).unwrap(), blob);
        assert!(summary.thumbnail.unwrap().exists());
    }
    assert!(h.store.result(&batch[0], RenderTier::Export).is_some());
    assert!(h.store.result(&batch[0], RenderTier::Ui).is_none());
}
