//! Metrics and observability for colorforge

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared metrics collector
#[derive(Default)]
pub struct Metrics {
    pub batches: AtomicU64,
    pub images_done: AtomicU64,
    pub images_failed: AtomicU64,
    pub images_stale: AtomicU64,
    pub total_latency_ms: AtomicU64,

    // Pipeline internals
    pub stage_fallbacks: AtomicU64,
    pub cache_barriers: AtomicU64,
    pub grain_cache_hits: AtomicU64,
    pub grain_cache_misses: AtomicU64,
    pub lod_placeholders: AtomicU64,
}

/// Final state of one image in a batch, as counted by [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutcomeKind {
    Done,
    Failed,
    Stale,
    Placeholder,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_image(&self, outcome: ImageOutcomeKind, latency_ms: u64) {
        let counter = match outcome {
            ImageOutcomeKind::Done => &self.images_done,
            ImageOutcomeKind::Failed => &self.images_failed,
            ImageOutcomeKind::Stale => &self.images_stale,
            ImageOutcomeKind::Placeholder => &self.lod_placeholders,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_stage_fallback(&self) {
        self.stage_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_barrier(&self) {
        self.cache_barriers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_grain_hit(&self) {
        self.grain_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_grain_miss(&self) {
        self.grain_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let done = self.images_done.load(Ordering::Relaxed);
        let failed = self.images_failed.load(Ordering::Relaxed);
        let stale = self.images_stale.load(Ordering::Relaxed);
        let placeholders = self.lod_placeholders.load(Ordering::Relaxed);
        let total = done + failed + stale + placeholders;
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            images_done: done,
            images_failed: failed,
            images_stale: stale,
            error_rate: if total > 0 { failed as f64 / total as f64 } else { 0.0 },
            avg_latency_ms: if total > 0 { total_latency / total } else { 0 },
            pipeline: PipelineMetrics {
                stage_fallbacks: self.stage_fallbacks.load(Ordering::Relaxed),
                cache_barriers: self.cache_barriers.load(Ordering::Relaxed),
                grain_cache_hits: self.grain_cache_hits.load(Ordering::Relaxed),
                grain_cache_misses: self.grain_cache_misses.load(Ordering::Relaxed),
                lod_placeholders: placeholders,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub batches: u64,
    pub images_done: u64,
    pub images_failed: u64,
    pub images_stale: u64,
    pub error_rate: f64,
    pub avg_latency_ms: u64,
    pub pipeline: PipelineMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub stage_fallbacks: u64,
    pub cache_barriers: u64,
    pub grain_cache_hits: u64,
    pub grain_cache_misses: u64,
    pub lod_placeholders: u64,
}

/// Timer for tracking render latency
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts_outcomes() {
        let metrics = Metrics::new();
        metrics.record_batch();
        metrics.record_image(ImageOutcomeKind::Done, 10);
        metrics.record_image(ImageOutcomeKind::Done, 30);
        metrics.record_image(ImageOutcomeKind::Failed, 20);
        metrics.record_image(ImageOutcomeKind::Stale, 0);
        metrics.record_stage_fallback();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches, 1);
        assert_eq!(snapshot.images_done, 2);
        assert_eq!(snapshot.images_failed, 1);
        assert_eq!(snapshot.images_stale, 1);
        assert_eq!(snapshot.avg_latency_ms, 15);
        assert!((snapshot.error_rate - 0.25).abs() < 1e-9);
        assert_eq!(snapshot.pipeline.stage_fallbacks, 1);
    }
}
