use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ApplierConfig;
use crate::ingest::{default_metrics, BatchMergeQueue, IngestMetrics, WriteBatch};
use crate::types::{Offset, PartitionId, QueueId, QueueOffsets, Result, ShardError, SnapshotId};
use crate::util::Worker;

use super::checkpoint::{PartitionCheckpoint, RecoveryState};
use super::engine::GraphStore;

/// Progress a partition publishes: every batch with a snapshot id at or
/// below `snapshot_id` has been applied, and the last applied DDL belongs
/// to `ddl_snapshot_id`. Always `ddl_snapshot_id <= snapshot_id`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WatermarkInfo {
    /// Snapshot watermark.
    pub snapshot_id: SnapshotId,
    /// DDL watermark.
    pub ddl_snapshot_id: SnapshotId,
}

/// Completion callback of a commit report.
pub type CommitCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Destination of a partition's commit reports.
pub trait SnapshotCommitter: Send + Sync {
    /// Reports that `partition` reached `snapshot_id`. Must not block on the
    /// remote side; `done` runs once the report was accepted or failed.
    fn commit_snapshot_id(
        &self,
        partition: PartitionId,
        snapshot_id: SnapshotId,
        ddl_snapshot_id: SnapshotId,
        queue_offsets: QueueOffsets,
        done: CommitCallback,
    );
}

/// Lifecycle state of a [`WriteApplier`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplierState {
    /// Not consuming.
    Stopped,
    /// Consume loop and commit executor are running.
    Running,
}

/// Last consumed offset per queue, stored as `offset + 1` so that zero can
/// mean "nothing consumed". Written by the consume loop only.
struct OffsetTable {
    slots: Box<[AtomicU64]>,
}

impl OffsetTable {
    fn new(queue_count: usize) -> Self {
        Self {
            slots: (0..queue_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn get(&self, queue: QueueId) -> Option<Offset> {
        self.slots
            .get(queue.index())
            .and_then(|slot| slot.load(Ordering::Acquire).checked_sub(1))
    }

    fn record(&self, queue: QueueId, offset: Offset) {
        if let Some(slot) = self.slots.get(queue.index()) {
            slot.fetch_max(offset + 1, Ordering::AcqRel);
        }
    }

    fn restore(&self, offsets: &[Option<Offset>]) {
        for (slot, offset) in self.slots.iter().zip(offsets) {
            slot.store(offset.map_or(0, |o| o + 1), Ordering::Release);
        }
    }

    fn snapshot(&self) -> QueueOffsets {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Acquire).checked_sub(1))
            .collect()
    }
}

/// Watermark pair together with the offsets consumed when it was reached.
/// The offsets cover exactly the batches at or below the watermark.
struct Boundary {
    watermark: WatermarkInfo,
    queue_offsets: QueueOffsets,
}

struct Shared {
    boundary: ArcSwap<Boundary>,
    offsets: OffsetTable,
    last_committed: AtomicU64,
    stop: AtomicBool,
}

struct Lifecycle {
    state: ApplierState,
    initialized: bool,
    store: Option<Box<dyn GraphStore>>,
    consume: Option<Worker>,
    commit: Option<Worker>,
}

/// Consumes one partition's merge queue into its storage engine and
/// reports progress to the coordinator.
///
/// A single consume thread polls batches in merged order and applies them,
/// retrying forever on storage errors. Whenever a batch starts a new
/// snapshot, the previous snapshot is complete: the watermark is
/// published and a commit is handed to a separate single-thread executor,
/// so slow reports never stall consumption. The executor persists the
/// partition checkpoint before each report.
///
/// [`WriteApplier::init`] must run exactly once before [`WriteApplier::start`].
/// A stopped applier cannot be started again; the storage engine moved
/// into the consume thread is released when the thread exits.
pub struct WriteApplier {
    partition: PartitionId,
    poll_timeout: Duration,
    stop_timeout: Duration,
    retry_backoff: Duration,
    merge_queue: Arc<BatchMergeQueue>,
    committer: Arc<dyn SnapshotCommitter>,
    metrics: Arc<dyn IngestMetrics>,
    checkpoint: Option<Arc<PartitionCheckpoint>>,
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl WriteApplier {
    /// Creates a stopped applier for `partition`.
    pub fn new(
        partition: PartitionId,
        cfg: &ApplierConfig,
        merge_queue: Arc<BatchMergeQueue>,
        store: Box<dyn GraphStore>,
        committer: Arc<dyn SnapshotCommitter>,
    ) -> Self {
        let queue_count = merge_queue.queue_count();
        Self {
            partition,
            poll_timeout: cfg.poll_timeout(),
            stop_timeout: cfg.stop_timeout(),
            retry_backoff: cfg.retry_backoff(),
            merge_queue,
            committer,
            metrics: default_metrics(),
            checkpoint: None,
            shared: Arc::new(Shared {
                boundary: ArcSwap::from_pointee(Boundary {
                    watermark: WatermarkInfo::default(),
                    queue_offsets: vec![None; queue_count],
                }),
                offsets: OffsetTable::new(queue_count),
                last_committed: AtomicU64::new(0),
                stop: AtomicBool::new(false),
            }),
            lifecycle: Mutex::new(Lifecycle {
                state: ApplierState::Stopped,
                initialized: false,
                store: Some(store),
                consume: None,
                commit: None,
            }),
        }
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn IngestMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Persists progress to `checkpoint` before every commit report.
    pub fn with_checkpoint(mut self, checkpoint: Arc<PartitionCheckpoint>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Partition this applier serves.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Seeds watermarks and consumed offsets from recovered state.
    pub fn init(&self, recovery: RecoveryState) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.initialized {
            return Err(ShardError::Invalid("applier already initialized"));
        }
        if recovery.queue_offsets.len() != self.shared.offsets.len() {
            return Err(ShardError::Invalid("recovered offsets do not match queue count"));
        }
        if recovery.ddl_watermark > recovery.watermark {
            return Err(ShardError::Invalid("ddl watermark above snapshot watermark"));
        }
        self.shared.offsets.restore(&recovery.queue_offsets);
        self.shared.boundary.store(Arc::new(Boundary {
            watermark: WatermarkInfo {
                snapshot_id: recovery.watermark,
                ddl_snapshot_id: recovery.ddl_watermark,
            },
            queue_offsets: recovery.queue_offsets.clone(),
        }));
        self.shared
            .last_committed
            .store(recovery.watermark, Ordering::Release);
        lifecycle.initialized = true;
        info!(
            partition = %self.partition,
            watermark = recovery.watermark,
            ddl_watermark = recovery.ddl_watermark,
            "applier.init"
        );
        Ok(())
    }

    /// Starts the consume loop and the commit executor.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if !lifecycle.initialized {
            return Err(ShardError::Invalid("applier started before init"));
        }
        if lifecycle.state == ApplierState::Running {
            return Ok(());
        }
        let store = lifecycle
            .store
            .take()
            .ok_or(ShardError::Invalid("applier cannot be restarted after stop"))?;
        self.shared.stop.store(false, Ordering::Release);

        let (commit_tx, commit_rx) = mpsc::channel();
        let executor = CommitExecutor {
            partition: self.partition,
            shared: Arc::clone(&self.shared),
            committer: Arc::clone(&self.committer),
            metrics: Arc::clone(&self.metrics),
            checkpoint: self.checkpoint.clone(),
            poll_timeout: self.poll_timeout,
        };
        let commit = Worker::spawn(format!("commit-p{}", self.partition), move || {
            executor.run(commit_rx)
        })?;

        let resume = self.shared.boundary.load().watermark;
        let consume_loop = ConsumeLoop {
            partition: self.partition,
            merge_queue: Arc::clone(&self.merge_queue),
            store,
            shared: Arc::clone(&self.shared),
            metrics: Arc::clone(&self.metrics),
            commit_tx,
            poll_timeout: self.poll_timeout,
            retry_backoff: self.retry_backoff,
            consume_snapshot: resume.snapshot_id,
            last_ddl_snapshot: resume.ddl_snapshot_id,
        };
        let consume = match Worker::spawn(format!("apply-p{}", self.partition), move || {
            consume_loop.run()
        }) {
            Ok(worker) => worker,
            Err(err) => {
                self.shared.stop.store(true, Ordering::Release);
                commit.join_timeout(self.stop_timeout);
                return Err(err);
            }
        };
        lifecycle.consume = Some(consume);
        lifecycle.commit = Some(commit);
        lifecycle.state = ApplierState::Running;
        info!(partition = %self.partition, watermark = resume.snapshot_id, "applier.start");
        Ok(())
    }

    /// Stops consuming; waits up to the configured stop timeout per thread.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == ApplierState::Stopped {
            return;
        }
        self.shared.stop.store(true, Ordering::Release);
        self.merge_queue.interrupt();
        if let Some(consume) = lifecycle.consume.take() {
            consume.join_timeout(self.stop_timeout);
        }
        if let Some(commit) = lifecycle.commit.take() {
            commit.join_timeout(self.stop_timeout);
        }
        lifecycle.state = ApplierState::Stopped;
        info!(partition = %self.partition, "applier.stop");
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ApplierState {
        self.lifecycle.lock().state
    }

    /// Last published watermark pair.
    pub fn watermark(&self) -> WatermarkInfo {
        self.shared.boundary.load().watermark
    }

    /// Last consumed offset per queue.
    pub fn consumed_offsets(&self) -> QueueOffsets {
        self.shared.offsets.snapshot()
    }

    /// Highest watermark the coordinator acknowledged.
    pub fn last_committed(&self) -> SnapshotId {
        self.shared.last_committed.load(Ordering::Acquire)
    }
}

impl Drop for WriteApplier {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ConsumeLoop {
    partition: PartitionId,
    merge_queue: Arc<BatchMergeQueue>,
    store: Box<dyn GraphStore>,
    shared: Arc<Shared>,
    metrics: Arc<dyn IngestMetrics>,
    commit_tx: Sender<()>,
    poll_timeout: Duration,
    retry_backoff: Duration,
    consume_snapshot: SnapshotId,
    last_ddl_snapshot: SnapshotId,
}

impl ConsumeLoop {
    fn run(mut self) {
        debug!(partition = %self.partition, consume_snapshot = self.consume_snapshot, "applier.consume.start");
        while !self.shared.stop.load(Ordering::Acquire) {
            let batch = match self.merge_queue.poll(self.poll_timeout) {
                Ok(Some(batch)) => batch,
                Ok(None) => continue,
                Err(ShardError::Shutdown) => break,
                Err(err) => {
                    warn!(partition = %self.partition, error = %err, "applier.poll.failed");
                    continue;
                }
            };
            if !self.process(batch) {
                break;
            }
        }
        debug!(partition = %self.partition, consume_snapshot = self.consume_snapshot, "applier.consume.stop");
    }

    /// Returns `false` when the loop must exit without recording the batch.
    fn process(&mut self, batch: WriteBatch) -> bool {
        let replayed = self
            .shared
            .offsets
            .get(batch.queue_id)
            .is_some_and(|done| batch.offset <= done);
        if replayed {
            self.metrics.batch_replayed();
            debug!(
                partition = %self.partition,
                queue = %batch.queue_id,
                offset = batch.offset,
                "applier.batch.replayed"
            );
        } else if !self.apply_with_retry(&batch) {
            return false;
        }

        if batch.snapshot_id > self.consume_snapshot {
            self.publish_watermark(batch.snapshot_id - 1);
            let _ = self.commit_tx.send(());
            self.consume_snapshot = batch.snapshot_id;
        }
        // Raised after publishing so the ddl watermark never passes the snapshot watermark.
        if batch.is_ddl {
            self.last_ddl_snapshot = self.last_ddl_snapshot.max(batch.snapshot_id);
        }
        self.shared.offsets.record(batch.queue_id, batch.offset);
        true
    }

    fn apply_with_retry(&mut self, batch: &WriteBatch) -> bool {
        if batch.is_marker() {
            return true;
        }
        let mut attempt: u64 = 0;
        loop {
            match self.store.apply(batch) {
                Ok(()) => {
                    self.metrics.batch_applied(batch.operations.len());
                    return true;
                }
                Err(err) => {
                    attempt += 1;
                    self.metrics.apply_retry();
                    warn!(
                        partition = %self.partition,
                        queue = %batch.queue_id,
                        snapshot_id = batch.snapshot_id,
                        offset = batch.offset,
                        attempt,
                        error = %err,
                        "applier.apply.retry"
                    );
                    if self.shared.stop.load(Ordering::Acquire) {
                        warn!(
                            partition = %self.partition,
                            offset = batch.offset,
                            "applier.apply.abandoned"
                        );
                        return false;
                    }
                    thread::sleep(self.retry_backoff);
                }
            }
        }
    }

    /// Runs before the batch that crossed the boundary is recorded, so the
    /// captured offsets stop at `completed`.
    fn publish_watermark(&self, completed: SnapshotId) {
        let current = self.shared.boundary.load().watermark;
        let next = WatermarkInfo {
            snapshot_id: current.snapshot_id.max(completed),
            ddl_snapshot_id: current.ddl_snapshot_id.max(self.last_ddl_snapshot),
        };
        if next == current {
            return;
        }
        self.shared.boundary.store(Arc::new(Boundary {
            watermark: next,
            queue_offsets: self.shared.offsets.snapshot(),
        }));
        self.metrics.watermark_advanced(next.snapshot_id);
        debug!(
            partition = %self.partition,
            watermark = next.snapshot_id,
            ddl_watermark = next.ddl_snapshot_id,
            "applier.watermark.advance"
        );
    }
}

struct CommitExecutor {
    partition: PartitionId,
    shared: Arc<Shared>,
    committer: Arc<dyn SnapshotCommitter>,
    metrics: Arc<dyn IngestMetrics>,
    checkpoint: Option<Arc<PartitionCheckpoint>>,
    poll_timeout: Duration,
}

impl CommitExecutor {
    fn run(self, requests: Receiver<()>) {
        loop {
            match requests.recv_timeout(self.poll_timeout) {
                Ok(()) => {
                    while requests.try_recv().is_ok() {}
                    self.commit_once();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.shared.stop.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(partition = %self.partition, "applier.commit.stop");
    }

    fn commit_once(&self) {
        let boundary = self.shared.boundary.load_full();
        let info = boundary.watermark;
        if info.snapshot_id <= self.shared.last_committed.load(Ordering::Acquire) {
            return;
        }
        let queue_offsets = boundary.queue_offsets.clone();
        if let Some(checkpoint) = &self.checkpoint {
            let state = RecoveryState {
                watermark: info.snapshot_id,
                ddl_watermark: info.ddl_snapshot_id,
                queue_offsets: queue_offsets.clone(),
            };
            if let Err(err) = checkpoint.persist(&state) {
                warn!(
                    partition = %self.partition,
                    watermark = info.snapshot_id,
                    error = %err,
                    "applier.checkpoint.failed"
                );
                return;
            }
        }
        self.metrics.commit_sent();
        let partition = self.partition;
        let shared = Arc::clone(&self.shared);
        let metrics = Arc::clone(&self.metrics);
        let snapshot_id = info.snapshot_id;
        self.committer.commit_snapshot_id(
            partition,
            snapshot_id,
            info.ddl_snapshot_id,
            queue_offsets,
            Box::new(move |result| match result {
                Ok(()) => {
                    shared
                        .last_committed
                        .fetch_max(snapshot_id, Ordering::AcqRel);
                    debug!(partition = %partition, snapshot_id, "applier.commit.done");
                }
                Err(err) => {
                    metrics.commit_failed();
                    warn!(partition = %partition, snapshot_id, error = %err, "applier.commit.failed");
                }
            }),
        );
    }
}
