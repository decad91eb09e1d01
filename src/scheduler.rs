//! Concurrency scheduler
//!
//! A fixed pool of long-lived execution contexts, each a dedicated thread
//! with its own rayon pool and a bounded job queue. A batch is partitioned
//! round-robin at submit time, with repeats of an id kept on the context of
//! its first occurrence; each context renders its share strictly in order
//! and replies per image. [`ConcurrencyScheduler::process`] awaits
//! every reply before returning.
//!
//! Every request gets a monotonic token. A context that finishes an image
//! whose token is no longer the latest for that id reports it as stale and
//! does not publish it, and never touches the image's state.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use colorforge::scheduler::ConcurrencyScheduler;
//!
//! let scheduler = ConcurrencyScheduler::new(executor, lod, SchedulerConfig::default())?;
//! let report = scheduler.process(&ids, &store).await?;
//! for result in &report.results {
//!     println!("{}: {:?}", result.id, result.state());
//! }
//! ```

use crate::buffer::{ColorSpace, ImageBuffer};
use crate::color;
use crate::config::SchedulerConfig;
use crate::error::{ForgeError, Result};
use crate::lod::{LevelOfDetailCache, ZoomRect};
use crate::metrics::{ImageOutcomeKind, Metrics, Timer};
use crate::params::{GateFormat, ImageId, ParamStore, RenderJob, RenderTier};
use crate::pipeline::PipelineExecutor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

// ============================================================================
// State and results
// ============================================================================

/// Lifecycle of one image inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageState {
    Idle,
    Queued,
    Running { context: usize },
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub enum ImageOutcome {
    /// Rendered and published
    Done(ImageBuffer),
    /// Could not be rendered; the last published result is kept
    Failed(String),
    /// Rendered, but a newer request for the same id exists
    Stale { latest: u64 },
    /// Source still loading; a flat stand-in was served
    Placeholder(ImageBuffer),
}

impl ImageOutcome {
    fn kind(&self) -> ImageOutcomeKind {
        match self {
            ImageOutcome::Done(_) => ImageOutcomeKind::Done,
            ImageOutcome::Failed(_) => ImageOutcomeKind::Failed,
            ImageOutcome::Stale { .. } => ImageOutcomeKind::Stale,
            ImageOutcome::Placeholder(_) => ImageOutcomeKind::Placeholder,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageResult {
    pub id: ImageId,
    pub token: u64,
    /// Context the image ran on; `None` when it never left the scheduler
    pub context: Option<usize>,
    pub outcome: ImageOutcome,
    pub latency_ms: u64,
}

impl ImageResult {
    pub fn image(&self) -> Option<&ImageBuffer> {
        match &self.outcome {
            ImageOutcome::Done(image) | ImageOutcome::Placeholder(image) => Some(image),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.outcome, ImageOutcome::Done(_))
    }

    pub fn state(&self) -> ImageState {
        match self.outcome {
            ImageOutcome::Done(_) => ImageState::Done,
            ImageOutcome::Failed(_) => ImageState::Failed,
            ImageOutcome::Stale { .. } | ImageOutcome::Placeholder(_) => ImageState::Idle,
        }
    }
}

/// Per-image results of one batch, in request order.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub results: Vec<ImageResult>,
    pub elapsed_ms: u64,
}

impl BatchReport {
    /// Latest result for an id in this batch.
    pub fn get(&self, id: &ImageId) -> Option<&ImageResult> {
        self.results.iter().rev().find(|r| &r.id == id)
    }

    pub fn count(&self, kind: ImageOutcomeKind) -> usize {
        self.results.iter().filter(|r| r.outcome.kind() == kind).count()
    }
}

// ============================================================================
// Shared bookkeeping
// ============================================================================

/// Issues request tokens and remembers the latest one per id.
#[derive(Default)]
struct TokenLedger {
    next: AtomicU64,
    latest: Mutex<HashMap<ImageId, u64>>,
}

impl TokenLedger {
    fn issue(&self, id: &ImageId) -> u64 {
        let token = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        latest.insert(id.clone(), token);
        token
    }

    fn latest(&self, id: &ImageId) -> u64 {
        let latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        latest.get(id).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct StateTable {
    states: RwLock<HashMap<ImageId, ImageState>>,
}

impl StateTable {
    fn set(&self, id: &ImageId, state: ImageState) {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        states.insert(id.clone(), state);
    }

    /// Write `state` only while `token` is still the latest request for `id`.
    /// The check runs under the table lock, so a superseded job can never
    /// overwrite the state of the request that replaced it.
    fn set_if_latest(&self, ledger: &TokenLedger, id: &ImageId, token: u64, state: ImageState) -> bool {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        if ledger.latest(id) != token {
            return false;
        }
        states.insert(id.clone(), state);
        true
    }

    fn get(&self, id: &ImageId) -> ImageState {
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        states.get(id).copied().unwrap_or(ImageState::Idle)
    }
}

struct WorkItem {
    job: RenderJob,
    reply: oneshot::Sender<ImageResult>,
}

/// Everything one context receives for a batch.
struct ContextBatch {
    store: ParamStore,
    tier: RenderTier,
    items: Vec<WorkItem>,
}

// ============================================================================
// Execution contexts
// ============================================================================

/// State owned by one context thread.
struct ContextWorker {
    index: usize,
    executor: PipelineExecutor,
    pool: rayon::ThreadPool,
    lod: Arc<LevelOfDetailCache>,
    ledger: Arc<TokenLedger>,
    states: Arc<StateTable>,
    metrics: Arc<Metrics>,
    serve_placeholders: bool,
}

impl ContextWorker {
    fn run_loop(self, mut queue: mpsc::Receiver<ContextBatch>) {
        debug!("Context {} started", self.index);
        while let Some(batch) = queue.blocking_recv() {
            for item in batch.items {
                let result = self.execute(&batch.store, batch.tier, item.job);
                // The batch caller may have gone away; nothing to publish to
                let _ = item.reply.send(result);
            }
        }
        debug!("Context {} stopped", self.index);
    }

    fn execute(&self, store: &ParamStore, tier: RenderTier, job: RenderJob) -> ImageResult {
        let timer = Timer::new();
        let running = ImageState::Running { context: self.index };
        self.states.set_if_latest(&self.ledger, &job.id, job.token, running);

        let outcome = match catch_unwind(AssertUnwindSafe(|| self.pool.install(|| self.render(store, tier, &job)))) {
            Ok(outcome) => outcome,
            Err(_) => ImageOutcome::Failed("render panicked".to_string()),
        };

        if let ImageOutcome::Failed(reason) = &outcome {
            warn!("⚠️ {} failed on context {}: {}", job.id, self.index, reason);
        }
        let latency_ms = timer.elapsed_ms();
        self.metrics.record_image(outcome.kind(), latency_ms);

        let result = ImageResult {
            id: job.id,
            token: job.token,
            context: Some(self.index),
            outcome,
            latency_ms,
        };
        // A newer request owns the state once it has been queued
        self.states.set_if_latest(&self.ledger, &result.id, result.token, result.state());
        result
    }

    fn render(&self, store: &ParamStore, tier: RenderTier, job: &RenderJob) -> ImageOutcome {
        let resolved = if self.serve_placeholders && tier == RenderTier::Ui {
            self.lod.resolve(&job.id, &job.source, tier)
        } else {
            self.lod.resolve_blocking(&job.id, tier)
        };
        let input = match resolved {
            Ok(input) => input,
            Err(e) => return ImageOutcome::Failed(e.to_string()),
        };
        if input.is_placeholder() {
            let flat = input.buffer.map(ColorSpace::Display, color::gamma_encode_rgb);
            return ImageOutcome::Placeholder(flat);
        }

        let report = match tier {
            RenderTier::Export => self.executor.render_export(&input.buffer, job),
            // LOD buffers carry their own frame size, so grain and halation
            // already scale with resolution; no extra zoom on top.
            _ => self.executor.render(&input.buffer, job, 1.0),
        };
        let image = match report {
            Ok(report) => report.image,
            Err(e) => return ImageOutcome::Failed(e.to_string()),
        };

        let latest = self.ledger.latest(&job.id);
        if latest != job.token {
            debug!("Dropping {} token {} (latest {})", job.id, job.token, latest);
            return ImageOutcome::Stale { latest };
        }
        if !store.write_back(&job.id, tier, job.token, image.clone()) {
            return ImageOutcome::Stale { latest };
        }
        ImageOutcome::Done(image)
    }
}

struct ContextHandle {
    queue: Option<mpsc::Sender<ContextBatch>>,
    thread: Option<JoinHandle<()>>,
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct ConcurrencyScheduler {
    contexts: Vec<ContextHandle>,
    executor: PipelineExecutor,
    lod: Arc<LevelOfDetailCache>,
    ledger: Arc<TokenLedger>,
    states: Arc<StateTable>,
    metrics: Arc<Metrics>,
}

impl ConcurrencyScheduler {
    /// Start the execution contexts.
    ///
    /// Fails with [`ForgeError::ContextCreation`] when no context can be
    /// brought up; nothing can render without one.
    pub fn new(executor: PipelineExecutor, lod: Arc<LevelOfDetailCache>, config: SchedulerConfig) -> Result<Self> {
        let count = config.resolved_contexts();
        if count == 0 {
            return Err(ForgeError::ContextCreation("At least one execution context is required".to_string()));
        }

        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        let threads_per_context = (cores / count).max(1);
        let ledger = Arc::new(TokenLedger::default());
        let states = Arc::new(StateTable::default());
        let metrics = executor.metrics().clone();

        let mut contexts = Vec::with_capacity(count);
        for index in 0..count {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads_per_context)
                .thread_name(move |i| format!("colorforge-ctx{}-{}", index, i))
                .build()
                .map_err(|e| ForgeError::ContextCreation(format!("Context {} pool: {}", index, e)))?;

            let (queue, receiver) = mpsc::channel(config.queue_depth.max(1));
            let worker = ContextWorker {
                index,
                executor: executor.clone(),
                pool,
                lod: lod.clone(),
                ledger: ledger.clone(),
                states: states.clone(),
                metrics: metrics.clone(),
                serve_placeholders: config.serve_placeholders,
            };
            let thread = std::thread::Builder::new()
                .name(format!("colorforge-ctx{}", index))
                .spawn(move || worker.run_loop(receiver))
                .map_err(|e| ForgeError::ContextCreation(format!("Context {} thread: {}", index, e)))?;

            contexts.push(ContextHandle {
                queue: Some(queue),
                thread: Some(thread),
            });
        }

        info!(
            "🧵 Started {} execution contexts ({} threads each)",
            count, threads_per_context
        );

        Ok(Self {
            contexts,
            executor,
            lod,
            ledger,
            states,
            metrics,
        })
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn lod(&self) -> &Arc<LevelOfDetailCache> {
        &self.lod
    }

    pub fn state(&self, id: &ImageId) -> ImageState {
        self.states.get(id)
    }

    /// Latest request token issued for an id (0 if never requested).
    pub fn latest_token(&self, id: &ImageId) -> u64 {
        self.ledger.latest(id)
    }

    /// Zoom the viewport of one image; the next UI render crops to `rect`.
    pub fn set_zoom(&self, id: &ImageId, rect: Option<ZoomRect>) {
        self.lod.set_zoom(id, rect);
    }

    /// Drop cached grain plates and fields of a format class.
    pub fn invalidate_grain_cache(&self, format: GateFormat) {
        self.executor.grain().invalidate(format);
    }

    /// Render a batch at UI resolution.
    pub async fn process(&self, ids: &[ImageId], store: &ParamStore) -> Result<BatchReport> {
        self.process_tier(ids, store, RenderTier::Ui).await
    }

    /// Render a batch at the given tier.
    ///
    /// Image-level failures are reported per id; the call only fails when
    /// no context is left to run on.
    pub async fn process_tier(&self, ids: &[ImageId], store: &ParamStore, tier: RenderTier) -> Result<BatchReport> {
        let timer = Timer::new();
        self.metrics.record_batch();
        info!(
            "🎞️ Batch of {} images ({:?}) across {} contexts",
            ids.len(),
            tier,
            self.contexts.len()
        );

        enum Pending {
            Ready(ImageResult),
            Waiting(ImageId, u64, usize, oneshot::Receiver<ImageResult>),
        }

        let mut partitions: Vec<Vec<WorkItem>> = (0..self.contexts.len()).map(|_| Vec::new()).collect();
        let mut pending = Vec::with_capacity(ids.len());
        let mut next_context = 0;
        // Repeats of an id stay on the context of its first occurrence
        let mut assigned: HashMap<ImageId, usize> = HashMap::new();

        for id in ids {
            let token = self.ledger.issue(id);
            // Parameters are read here; later edits only affect the next request
            let job = match store.snapshot(id, token) {
                Ok(job) => job,
                Err(e) => {
                    warn!("⚠️ {} not scheduled: {}", id, e);
                    self.metrics.record_image(ImageOutcomeKind::Failed, 0);
                    self.states.set(id, ImageState::Failed);
                    pending.push(Pending::Ready(ImageResult {
                        id: id.clone(),
                        token,
                        context: None,
                        outcome: ImageOutcome::Failed(e.to_string()),
                        latency_ms: 0,
                    }));
                    continue;
                }
            };

            let context = match assigned.get(id) {
                Some(&context) => context,
                None => {
                    let context = next_context;
                    next_context = (next_context + 1) % self.contexts.len();
                    assigned.insert(id.clone(), context);
                    context
                }
            };
            let (reply, receiver) = oneshot::channel();
            self.states.set(id, ImageState::Queued);
            partitions[context].push(WorkItem { job, reply });
            pending.push(Pending::Waiting(id.clone(), token, context, receiver));
        }

        let mut live = 0;
        for (index, items) in partitions.into_iter().enumerate() {
            if items.is_empty() {
                continue;
            }
            let Some(queue) = self.contexts[index].queue.as_ref() else {
                continue;
            };
            let batch = ContextBatch {
                store: store.clone(),
                tier,
                items,
            };
            if queue.send(batch).await.is_err() {
                warn!("⚠️ Context {} is not accepting work", index);
                continue;
            }
            live += 1;
        }
        if live == 0 && pending.iter().any(|p| matches!(p, Pending::Waiting(..))) {
            return Err(ForgeError::ContextCreation("No execution context is running".to_string()));
        }

        let mut results = Vec::with_capacity(pending.len());
        for entry in pending {
            let result = match entry {
                Pending::Ready(result) => result,
                Pending::Waiting(id, token, context, receiver) => match receiver.await {
                    Ok(result) => result,
                    Err(_) => {
                        self.states.set_if_latest(&self.ledger, &id, token, ImageState::Failed);
                        ImageResult {
                            id,
                            token,
                            context: Some(context),
                            outcome: ImageOutcome::Failed(format!("Context {} stopped", context)),
                            latency_ms: 0,
                        }
                    }
                },
            };
            results.push(result);
        }

        let report = BatchReport {
            results,
            elapsed_ms: timer.elapsed_ms(),
        };
        info!(
            "✅ Batch finished: {} done, {} failed, {} stale, {} placeholders in {} ms",
            report.count(ImageOutcomeKind::Done),
            report.count(ImageOutcomeKind::Failed),
            report.count(ImageOutcomeKind::Stale),
            report.count(ImageOutcomeKind::Placeholder),
            report.elapsed_ms
        );
        Ok(report)
    }
}

impl Drop for ConcurrencyScheduler {
    fn drop(&mut self) {
        for context in &mut self.contexts {
            context.queue.take();
        }
        for context in &mut self.contexts {
            if let Some(thread) = context.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CalibrationTable, PipelineConfig};
    use crate::lod::InMemorySource;
    use crate::params::{ImageRecord, ParameterSet, SourceInfo};

    fn setup(contexts: usize, ids: &[&str]) -> (ConcurrencyScheduler, ParamStore, Arc<InMemorySource>) {
        let source = Arc::new(InMemorySource::new());
        let store = ParamStore::new();
        for id in ids {
            source.insert(*id, ImageBuffer::filled(24, 16, ColorSpace::Linear, [0.18; 3]));
            store.insert(ImageRecord::new(*id, SourceInfo::with_native_size(24, 16)));
        }
        let executor = PipelineExecutor::new(Arc::new(CalibrationTable::default()), PipelineConfig::default());
        let lod = Arc::new(LevelOfDetailCache::new(source.clone(), 64));
        let scheduler = ConcurrencyScheduler::new(executor, lod, SchedulerConfig::with_contexts(contexts)).unwrap();
        (scheduler, store, source)
    }

    /// A context detached from the scheduler's threads, sharing its bookkeeping.
    fn side_worker(scheduler: &ConcurrencyScheduler, index: usize) -> ContextWorker {
        ContextWorker {
            index,
            executor: scheduler.executor.clone(),
            pool: rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap(),
            lod: scheduler.lod.clone(),
            ledger: scheduler.ledger.clone(),
            states: scheduler.states.clone(),
            metrics: scheduler.metrics.clone(),
            serve_placeholders: false,
        }
    }

    #[tokio::test]
    async fn test_round_robin_assignment() {
        let ids = ["a", "b", "c", "d", "e"];
        let (scheduler, store, _source) = setup(2, &ids);
        let ids: Vec<ImageId> = ids.iter().map(|s| ImageId::from(*s)).collect();

        let report = scheduler.process(&ids, &store).await.unwrap();
        let contexts: Vec<_> = report.results.iter().map(|r| r.context).collect();
        assert_eq!(contexts, vec![Some(0), Some(1), Some(0), Some(1), Some(0)]);
        assert!(report.results.iter().all(|r| r.is_done()));
        assert!(ids.iter().all(|id| scheduler.state(id) == ImageState::Done));
        assert!(store.result(&ids[0], RenderTier::Ui).is_some());
    }

    #[tokio::test]
    async fn test_missing_record_fails_only_that_image() {
        let (scheduler, store, _source) = setup(2, &["a"]);
        let ids = vec![ImageId::from("a"), ImageId::from("ghost")];
        let report = scheduler.process(&ids, &store).await.unwrap();
        assert!(report.get(&ids[0]).unwrap().is_done());
        let ghost = report.get(&ids[1]).unwrap();
        assert!(matches!(ghost.outcome, ImageOutcome::Failed(_)));
        assert_eq!(ghost.context, None);
        assert_eq!(scheduler.state(&ids[1]), ImageState::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_request_marks_older_stale() {
        let (scheduler, store, _source) = setup(1, &["a"]);
        let id = ImageId::from("a");
        let report = scheduler.process(&[id.clone(), id.clone()], &store).await.unwrap();
        assert!(matches!(report.results[0].outcome, ImageOutcome::Stale { .. }));
        assert!(report.results[1].is_done());
        assert!(report.results[1].token > report.results[0].token);
        assert_eq!(scheduler.latest_token(&id), report.results[1].token);
        assert_eq!(scheduler.metrics().snapshot().images_stale, 1);
    }

    #[tokio::test]
    async fn test_repeated_id_stays_on_one_context() {
        let (scheduler, store, _source) = setup(2, &["a", "b"]);
        let batch = vec![ImageId::from("a"), ImageId::from("a"), ImageId::from("b")];
        let report = scheduler.process(&batch, &store).await.unwrap();

        let contexts: Vec<_> = report.results.iter().map(|r| r.context).collect();
        assert_eq!(contexts, vec![Some(0), Some(0), Some(1)]);
        assert!(matches!(report.results[0].outcome, ImageOutcome::Stale { .. }));
        assert!(report.results[1].is_done());
        assert!(report.results[2].is_done());
        assert_eq!(scheduler.state(&batch[0]), ImageState::Done);
    }

    #[tokio::test]
    async fn test_late_superseded_job_keeps_newer_state() {
        let (scheduler, store, _source) = setup(1, &["a"]);
        let id = ImageId::from("a");

        // Issued first, but only runs after the newer request has finished
        let old_token = scheduler.ledger.issue(&id);
        let old_job = store.snapshot(&id, old_token).unwrap();
        let report = scheduler.process(&[id.clone()], &store).await.unwrap();
        assert!(report.results[0].is_done());
        assert_eq!(scheduler.state(&id), ImageState::Done);

        let late = side_worker(&scheduler, 1).execute(&store, RenderTier::Ui, old_job);
        assert!(matches!(late.outcome, ImageOutcome::Stale { .. }));
        assert_eq!(scheduler.state(&id), ImageState::Done);
        let published = store.result(&id, RenderTier::Ui).unwrap();
        assert!(published.shares_pixels(report.results[0].image().unwrap()));
    }

    #[test]
    fn test_state_writes_follow_latest_token() {
        let ledger = TokenLedger::default();
        let states = StateTable::default();
        let id = ImageId::from("a");
        let older = ledger.issue(&id);
        let newer = ledger.issue(&id);

        assert!(states.set_if_latest(&ledger, &id, newer, ImageState::Done));
        assert!(!states.set_if_latest(&ledger, &id, older, ImageState::Running { context: 0 }));
        assert_eq!(states.get(&id), ImageState::Done);
    }

    #[tokio::test]
    async fn test_failed_image_keeps_last_good_result() {
        let (scheduler, store, source) = setup(1, &["a"]);
        let id = ImageId::from("a");
        scheduler.process(&[id.clone()], &store).await.unwrap();
        let good = store.result(&id, RenderTier::Ui).unwrap();

        // Source disappears: the next render fails, the published result stays
        source.remove(&id);
        scheduler.lod().invalidate(&id);
        store
            .update(&id, |r| r.global = ParameterSet { exposure: 1.0, ..Default::default() })
            .unwrap();
        let report = scheduler.process(&[id.clone()], &store).await.unwrap();
        assert!(matches!(report.results[0].outcome, ImageOutcome::Failed(_)));
        assert_eq!(scheduler.state(&id), ImageState::Failed);
        assert!(store.result(&id, RenderTier::Ui).unwrap().shares_pixels(&good));
    }

    #[test]
    fn test_zero_contexts_is_a_configuration_error() {
        let executor = PipelineExecutor::new(Arc::new(CalibrationTable::default()), PipelineConfig::default());
        let lod = Arc::new(LevelOfDetailCache::new(Arc::new(InMemorySource::new()), 64));
        let result = ConcurrencyScheduler::new(executor, lod, SchedulerConfig::with_contexts(0));
        assert!(matches!(result, Err(ForgeError::ContextCreation(_))));
    }
}
