use std::sync::Arc;

use tracing::info;

use crate::config::ApplierConfig;
use crate::ingest::{BatchMergeQueue, IngestMetrics, QueueDelivery, QueueLog};
use crate::types::{Offset, PartitionId, Result, ShardError};

use super::applier::{SnapshotCommitter, WatermarkInfo, WriteApplier};
use super::checkpoint::{PartitionCheckpoint, RecoveryState};
use super::engine::GraphStore;

/// One storage partition: a delivery thread per queue feeding a merge
/// queue, drained by a [`WriteApplier`].
pub struct StorePartition {
    id: PartitionId,
    cfg: ApplierConfig,
    logs: Vec<Arc<dyn QueueLog>>,
    merge_queue: Arc<BatchMergeQueue>,
    applier: WriteApplier,
    recovery: Option<RecoveryState>,
    deliveries: Vec<QueueDelivery>,
}

impl StorePartition {
    /// Builds a stopped partition. When `cfg.checkpoint_dir` is set the last
    /// checkpoint is loaded and later commits persist to it.
    pub fn open(
        id: PartitionId,
        cfg: &ApplierConfig,
        logs: Vec<Arc<dyn QueueLog>>,
        store: Box<dyn GraphStore>,
        committer: Arc<dyn SnapshotCommitter>,
        metrics: Arc<dyn IngestMetrics>,
    ) -> Result<Self> {
        for (index, log) in logs.iter().enumerate() {
            if log.queue_id().index() != index {
                return Err(ShardError::Invalid("queue logs must be ordered by queue id"));
            }
        }
        let merge_queue = Arc::new(BatchMergeQueue::new(logs.len(), cfg.queue_capacity)?);
        let mut applier = WriteApplier::new(id, cfg, Arc::clone(&merge_queue), store, committer)
            .with_metrics(metrics);
        let mut recovery = RecoveryState::fresh(logs.len());
        if let Some(dir) = &cfg.checkpoint_dir {
            let checkpoint = Arc::new(PartitionCheckpoint::new(dir, id));
            if let Some(state) = checkpoint.load()? {
                recovery = state;
            }
            applier = applier.with_checkpoint(checkpoint);
        }
        Ok(Self {
            id,
            cfg: cfg.clone(),
            logs,
            merge_queue,
            applier,
            recovery: Some(recovery),
            deliveries: Vec::new(),
        })
    }

    /// Partition id.
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// State the partition will resume from; `None` once started.
    pub fn recovery(&self) -> Option<&RecoveryState> {
        self.recovery.as_ref()
    }

    /// Seeds the applier and starts delivery right after the recovered offsets.
    pub fn start(&mut self) -> Result<()> {
        let recovery = self
            .recovery
            .take()
            .ok_or(ShardError::Invalid("partition already started"))?;
        let starts: Vec<Offset> = recovery
            .queue_offsets
            .iter()
            .map(|offset| offset.map_or(0, |o| o + 1))
            .collect();
        let watermark = recovery.watermark;
        self.applier.init(recovery)?;
        self.applier.start()?;
        for (log, start) in self.logs.iter().zip(starts) {
            let delivery = QueueDelivery::spawn(
                self.id,
                Arc::clone(log),
                Arc::clone(&self.merge_queue),
                start,
                &self.cfg,
            )?;
            self.deliveries.push(delivery);
        }
        info!(partition = %self.id, watermark, queues = self.logs.len(), "partition.start");
        Ok(())
    }

    /// Stops the applier, then unblocks and joins the delivery threads.
    pub fn stop(&mut self) {
        self.applier.stop();
        self.merge_queue.close();
        for delivery in &mut self.deliveries {
            delivery.stop(self.cfg.stop_timeout());
        }
        self.deliveries.clear();
    }

    /// Last published watermark pair.
    pub fn watermark(&self) -> WatermarkInfo {
        self.applier.watermark()
    }

    /// Applier of this partition.
    pub fn applier(&self) -> &WriteApplier {
        &self.applier
    }
}

impl Drop for StorePartition {
    fn drop(&mut self) {
        self.stop();
    }
}
