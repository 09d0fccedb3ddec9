use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::SnapshotId;

/// Counters for the partition write path.
///
/// Implementations must be cheap: every hook is called from the consume
/// loop or the commit executor.
pub trait IngestMetrics: Send + Sync {
    /// A batch reached the storage engine.
    fn batch_applied(&self, operations: usize);

    /// A batch at or below the recovered offset was skipped.
    fn batch_replayed(&self);

    /// The storage engine rejected a batch and it will be retried.
    fn apply_retry(&self);

    /// The partition published a new watermark.
    fn watermark_advanced(&self, snapshot_id: SnapshotId);

    /// A commit report was handed to the transport.
    fn commit_sent(&self);

    /// A commit report failed in transport and was dropped.
    fn commit_failed(&self);
}

/// Discards every sample.
#[derive(Default)]
pub struct NoopMetrics;

impl IngestMetrics for NoopMetrics {
    fn batch_applied(&self, _operations: usize) {}
    fn batch_replayed(&self) {}
    fn apply_retry(&self) {}
    fn watermark_advanced(&self, _snapshot_id: SnapshotId) {}
    fn commit_sent(&self) {}
    fn commit_failed(&self) {}
}

/// Atomic counters, safe to read from any thread.
#[derive(Default)]
pub struct CounterMetrics {
    /// Batches handed to the storage engine.
    pub batches_applied: AtomicU64,

    /// Operations inside applied batches.
    pub operations_applied: AtomicU64,

    /// Batches skipped because they were applied before a restart.
    pub batches_replayed: AtomicU64,

    /// Storage apply retries.
    pub apply_retries: AtomicU64,

    /// Watermark publications.
    pub watermark_advances: AtomicU64,

    /// Highest watermark published.
    pub last_watermark: AtomicU64,

    /// Commit reports sent.
    pub commits_sent: AtomicU64,

    /// Commit reports dropped after a transport failure.
    pub commits_failed: AtomicU64,
}

impl IngestMetrics for CounterMetrics {
    fn batch_applied(&self, operations: usize) {
        self.batches_applied.fetch_add(1, Ordering::Relaxed);
        self.operations_applied
            .fetch_add(operations as u64, Ordering::Relaxed);
    }

    fn batch_replayed(&self) {
        self.batches_replayed.fetch_add(1, Ordering::Relaxed);
    }

    fn apply_retry(&self) {
        self.apply_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn watermark_advanced(&self, snapshot_id: SnapshotId) {
        self.watermark_advances.fetch_add(1, Ordering::Relaxed);
        self.last_watermark.fetch_max(snapshot_id, Ordering::Relaxed);
    }

    fn commit_sent(&self) {
        self.commits_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn commit_failed(&self) {
        self.commits_failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Default metrics sink: [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn IngestMetrics> {
    Arc::new(NoopMetrics)
}
