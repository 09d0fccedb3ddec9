use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::store::{CommitCallback, SnapshotCommitter};
use crate::types::{PartitionId, QueueId, QueueOffsets, Result, ShardError, SnapshotId};

use super::meta_store::{CoordinatorMeta, MetaStore};

/// Last report received from one partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitRecord {
    /// Reporting partition.
    pub partition: PartitionId,
    /// Snapshot watermark.
    pub watermark: SnapshotId,
    /// DDL watermark.
    pub ddl_watermark: SnapshotId,
    /// Last consumed offset per queue.
    pub queue_offsets: QueueOffsets,
}

/// Snapshot pair published to readers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuerySnapshot {
    /// Highest snapshot every partition has applied.
    pub snapshot_id: SnapshotId,
    /// Lowest ddl watermark across partitions.
    pub ddl_snapshot_id: SnapshotId,
}

/// One-shot callback run once the query snapshot reaches a target.
pub type SnapshotListener = Box<dyn FnOnce(QuerySnapshot) + Send + 'static>;

/// Observer of every query snapshot advance.
pub trait QuerySnapshotListener: Send + Sync {
    /// Called after `snapshot` became the query snapshot.
    fn on_query_snapshot(&self, snapshot: QuerySnapshot);
}

struct ManagerState {
    records: BTreeMap<PartitionId, CommitRecord>,
    query: QuerySnapshot,
    write_snapshot: SnapshotId,
    pending: BTreeMap<SnapshotId, Vec<SnapshotListener>>,
}

/// Coordinator-side bookkeeping of partition progress.
///
/// Keeps the last commit per partition and derives the query snapshot as
/// the minimum watermark across partitions. The published query snapshot
/// only moves forward, and only once every configured partition has
/// reported. The manager also allocates write snapshot ids.
pub struct SnapshotManager {
    partition_count: usize,
    queue_count: usize,
    meta: Arc<dyn MetaStore>,
    state: Mutex<ManagerState>,
    advanced: Condvar,
    listeners: Mutex<Vec<Arc<dyn QuerySnapshotListener>>>,
    notify: Mutex<()>,
    persisted: Mutex<SnapshotId>,
}

impl SnapshotManager {
    /// Manager for `partition_count` partitions fed by `queue_count` queues.
    pub fn new(partition_count: usize, queue_count: usize, meta: Arc<dyn MetaStore>) -> Self {
        Self {
            partition_count,
            queue_count,
            meta,
            state: Mutex::new(ManagerState {
                records: BTreeMap::new(),
                query: QuerySnapshot::default(),
                write_snapshot: 0,
                pending: BTreeMap::new(),
            }),
            advanced: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
            notify: Mutex::new(()),
            persisted: Mutex::new(0),
        }
    }

    /// Restores persisted progress. The write snapshot resumes above the
    /// last published query snapshot.
    pub fn start(&self) -> Result<()> {
        let Some(meta) = self.meta.load_meta()? else {
            info!("snapshot.start.fresh");
            return Ok(());
        };
        *self.persisted.lock() = meta.query_snapshot_id;
        let mut state = self.state.lock();
        state.query = QuerySnapshot {
            snapshot_id: meta.query_snapshot_id,
            ddl_snapshot_id: meta.ddl_snapshot_id,
        };
        state.write_snapshot = meta.write_snapshot_id.max(meta.query_snapshot_id + 1);
        info!(
            query_snapshot = meta.query_snapshot_id,
            write_snapshot = state.write_snapshot,
            "snapshot.start.recovered"
        );
        Ok(())
    }

    /// Records a partition report and republishes the query snapshot.
    ///
    /// Reports from unknown partitions and reports older than the recorded
    /// one are dropped.
    pub fn commit(
        &self,
        partition: PartitionId,
        watermark: SnapshotId,
        ddl_watermark: SnapshotId,
        queue_offsets: QueueOffsets,
    ) {
        if partition.index() >= self.partition_count {
            warn!(partition = %partition, watermark, "snapshot.commit.unknown_partition");
            return;
        }
        let (advanced, due, meta) = {
            let mut state = self.state.lock();
            if let Some(existing) = state.records.get(&partition) {
                if watermark < existing.watermark {
                    debug!(
                        partition = %partition,
                        watermark,
                        recorded = existing.watermark,
                        "snapshot.commit.stale"
                    );
                    return;
                }
            }
            state.records.insert(
                partition,
                CommitRecord {
                    partition,
                    watermark,
                    ddl_watermark,
                    queue_offsets,
                },
            );
            debug!(partition = %partition, watermark, ddl_watermark, "snapshot.commit");
            let Some(candidate) = self.candidate(&state) else {
                return;
            };
            if candidate.snapshot_id <= state.query.snapshot_id {
                return;
            }
            state.query = candidate;
            let later = state.pending.split_off(&(candidate.snapshot_id + 1));
            let due: Vec<SnapshotListener> = std::mem::replace(&mut state.pending, later)
                .into_values()
                .flatten()
                .collect();
            let meta = CoordinatorMeta {
                query_snapshot_id: candidate.snapshot_id,
                ddl_snapshot_id: candidate.ddl_snapshot_id,
                write_snapshot_id: state.write_snapshot,
                queue_offsets: Self::tail_offsets(&state, self.queue_count),
            };
            (candidate, due, meta)
        };
        self.persist(&meta);
        info!(
            query_snapshot = advanced.snapshot_id,
            ddl_snapshot = advanced.ddl_snapshot_id,
            "snapshot.query.advance"
        );
        self.notify_advance(due);
    }

    /// Saves `meta` unless a later query snapshot is already on disk.
    fn persist(&self, meta: &CoordinatorMeta) {
        let mut persisted = self.persisted.lock();
        if meta.query_snapshot_id <= *persisted {
            debug!(
                query_snapshot = meta.query_snapshot_id,
                persisted = *persisted,
                "snapshot.meta.superseded"
            );
            return;
        }
        match self.meta.save_meta(meta) {
            Ok(()) => *persisted = meta.query_snapshot_id,
            Err(err) => {
                warn!(query_snapshot = meta.query_snapshot_id, error = %err, "snapshot.meta.save_failed")
            }
        }
    }

    fn candidate(&self, state: &ManagerState) -> Option<QuerySnapshot> {
        if state.records.len() < self.partition_count {
            return None;
        }
        let snapshot_id = state.records.values().map(|r| r.watermark).min()?;
        let ddl_snapshot_id = state.records.values().map(|r| r.ddl_watermark).min()?;
        Some(QuerySnapshot {
            snapshot_id,
            ddl_snapshot_id: ddl_snapshot_id.min(snapshot_id),
        })
    }

    fn notify_advance(&self, due: Vec<SnapshotListener>) {
        let _serial = self.notify.lock();
        let current = self.query_snapshot();
        for listener in due {
            listener(current);
        }
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_query_snapshot(current);
        }
        self.advanced.notify_all();
    }

    /// Minimum watermark over partitions that have reported, `None` before any report.
    pub fn global_snapshot(&self) -> Option<SnapshotId> {
        self.state.lock().records.values().map(|r| r.watermark).min()
    }

    /// Last published query snapshot.
    pub fn query_snapshot(&self) -> QuerySnapshot {
        self.state.lock().query
    }

    /// Last allocated write snapshot id.
    pub fn write_snapshot_id(&self) -> SnapshotId {
        self.state.lock().write_snapshot
    }

    /// Allocates and returns the next write snapshot id.
    pub fn increase_write_snapshot_id(&self) -> SnapshotId {
        let mut state = self.state.lock();
        state.write_snapshot = state.write_snapshot.max(state.query.snapshot_id) + 1;
        state.write_snapshot
    }

    /// Recorded report of `partition`.
    pub fn commit_record(&self, partition: PartitionId) -> Option<CommitRecord> {
        self.state.lock().records.get(&partition).cloned()
    }

    /// Runs `listener` once the query snapshot reaches `snapshot_id`, on
    /// the calling thread when it already has.
    pub fn add_snapshot_listener(&self, snapshot_id: SnapshotId, listener: SnapshotListener) {
        let current = {
            let mut state = self.state.lock();
            if state.query.snapshot_id < snapshot_id {
                state.pending.entry(snapshot_id).or_default().push(listener);
                return;
            }
            state.query
        };
        listener(current);
    }

    /// Registers an observer of every advance.
    pub fn add_query_listener(&self, listener: Arc<dyn QuerySnapshotListener>) {
        self.listeners.lock().push(listener);
    }

    /// Blocks until the query snapshot reaches `snapshot_id`.
    pub fn wait_for_query_snapshot(
        &self,
        snapshot_id: SnapshotId,
        timeout: Duration,
    ) -> Result<QuerySnapshot> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.query.snapshot_id < snapshot_id {
            if self.advanced.wait_until(&mut state, deadline).timed_out() {
                if state.query.snapshot_id >= snapshot_id {
                    break;
                }
                return Err(ShardError::Timeout("query snapshot wait"));
            }
        }
        Ok(state.query)
    }

    /// Tail offset of each queue: the lowest offset any partition consumed.
    pub fn get_tail_offsets(&self, queues: &[QueueId]) -> QueueOffsets {
        let state = self.state.lock();
        let tails = Self::tail_offsets(&state, self.queue_count);
        queues
            .iter()
            .map(|queue| tails.get(queue.index()).copied().flatten())
            .collect()
    }

    fn tail_offsets(state: &ManagerState, queue_count: usize) -> QueueOffsets {
        (0..queue_count)
            .map(|index| {
                state
                    .records
                    .values()
                    .map(|r| r.queue_offsets.get(index).copied().flatten())
                    .min()
                    .flatten()
            })
            .collect()
    }
}

impl SnapshotCommitter for SnapshotManager {
    fn commit_snapshot_id(
        &self,
        partition: PartitionId,
        snapshot_id: SnapshotId,
        ddl_snapshot_id: SnapshotId,
        queue_offsets: QueueOffsets,
        done: CommitCallback,
    ) {
        self.commit(partition, snapshot_id, ddl_snapshot_id, queue_offsets);
        done(Ok(()));
    }
}
