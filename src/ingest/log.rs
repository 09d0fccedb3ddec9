use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::types::{Offset, QueueId, Result, ShardError, SnapshotId};

use super::batch::{Operation, WriteBatch};

/// Durable, ordered, append-only log behind one ingest queue.
///
/// Offsets start at zero and increase by one per appended batch. Snapshot
/// ids of appended batches never decrease.
pub trait QueueLog: Send + Sync {
    /// Queue this log backs.
    fn queue_id(&self) -> QueueId;

    /// Appends a batch stamped with `snapshot_id` and returns its offset.
    fn append(
        &self,
        snapshot_id: SnapshotId,
        operations: Vec<Operation>,
        is_ddl: bool,
    ) -> Result<Offset>;

    /// Returns up to `max` batches starting at `from`, waiting up to
    /// `timeout` for the first one. An empty result means the wait elapsed.
    fn read(&self, from: Offset, max: usize, timeout: Duration) -> Result<Vec<WriteBatch>>;

    /// Offset of the last appended batch.
    fn tail(&self) -> Option<Offset>;
}

/// In-process [`QueueLog`].
pub struct MemoryQueueLog {
    queue_id: QueueId,
    entries: Mutex<Vec<WriteBatch>>,
    appended: Condvar,
}

impl MemoryQueueLog {
    /// Creates an empty log for `queue_id`.
    pub fn new(queue_id: QueueId) -> Self {
        Self {
            queue_id,
            entries: Mutex::new(Vec::new()),
            appended: Condvar::new(),
        }
    }

    /// Number of appended batches.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` when nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QueueLog for MemoryQueueLog {
    fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    fn append(
        &self,
        snapshot_id: SnapshotId,
        operations: Vec<Operation>,
        is_ddl: bool,
    ) -> Result<Offset> {
        let mut entries = self.entries.lock();
        if entries
            .last()
            .is_some_and(|last| snapshot_id < last.snapshot_id)
        {
            return Err(ShardError::Invalid("append would regress queue snapshot"));
        }
        let offset = entries.len() as Offset;
        entries.push(WriteBatch {
            queue_id: self.queue_id,
            snapshot_id,
            offset,
            operations,
            is_ddl,
        });
        self.appended.notify_all();
        Ok(offset)
    }

    fn read(&self, from: Offset, max: usize, timeout: Duration) -> Result<Vec<WriteBatch>> {
        let deadline = Instant::now() + timeout;
        let start = usize::try_from(from).map_err(|_| ShardError::Invalid("offset overflow"))?;
        let mut entries = self.entries.lock();
        while entries.len() <= start {
            if self.appended.wait_until(&mut entries, deadline).timed_out() {
                break;
            }
        }
        if entries.len() <= start {
            return Ok(Vec::new());
        }
        let end = entries.len().min(start.saturating_add(max.max(1)));
        Ok(entries[start..end].to_vec())
    }

    fn tail(&self) -> Option<Offset> {
        let len = self.entries.lock().len();
        len.checked_sub(1).map(|last| last as Offset)
    }
}
