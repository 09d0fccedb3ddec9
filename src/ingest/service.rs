use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::ApplierConfig;
use crate::coordinator::DdlWriter;
use crate::rpc::{RpcRequest, RpcResponse, RpcService};
use crate::schema::DdlOperation;
use crate::types::{Offset, PartitionId, QueueId, QueueOffsets, Result, ShardError, SnapshotId};
use crate::util::Worker;

use super::batch::Operation;
use super::log::QueueLog;
use super::merge_queue::BatchMergeQueue;

/// Ingest role: stamps writes with the current ingest snapshot id and
/// appends them to the durable queues every partition consumes.
///
/// The stamp only moves forward, through
/// [`IngestService::advance_ingest_snapshot_id`], which also drops a marker
/// batch into every queue so partitions see a boundary crossing even when
/// no user writes arrive.
///
/// DDL writes are remembered by `(session_id, request_id)`; writing the
/// same request again returns the snapshot of the first write.
pub struct IngestService {
    ingest_snapshot: RwLock<SnapshotId>,
    queues: Vec<Arc<dyn QueueLog>>,
    ddl_written: Mutex<LruCache<(String, String), SnapshotId>>,
}

const DDL_WRITTEN_CAPACITY: usize = 4096;

impl IngestService {
    /// Creates a service over `queues`, indexed by queue id.
    pub fn new(queues: Vec<Arc<dyn QueueLog>>) -> Result<Self> {
        if queues.is_empty() {
            return Err(ShardError::Invalid("ingest service needs at least one queue"));
        }
        for (index, queue) in queues.iter().enumerate() {
            if queue.queue_id().index() != index {
                return Err(ShardError::Invalid("queues must be ordered by queue id"));
            }
        }
        let capacity = NonZeroUsize::new(DDL_WRITTEN_CAPACITY)
            .ok_or(ShardError::Invalid("ddl dedup capacity must be positive"))?;
        Ok(Self {
            ingest_snapshot: RwLock::new(0),
            queues,
            ddl_written: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Snapshot id new writes are stamped with; zero until the coordinator assigns one.
    pub fn ingest_snapshot_id(&self) -> SnapshotId {
        *self.ingest_snapshot.read()
    }

    /// Number of queues.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Offset of the last batch appended to each queue, indexed by queue id.
    pub fn queue_tails(&self) -> QueueOffsets {
        self.queues.iter().map(|queue| queue.tail()).collect()
    }

    /// Appends `operations` to `queue_id` and returns `(snapshot_id, offset)`.
    pub fn append(
        &self,
        queue_id: QueueId,
        operations: Vec<Operation>,
        is_ddl: bool,
    ) -> Result<(SnapshotId, Offset)> {
        let queue = self
            .queues
            .get(queue_id.index())
            .ok_or(ShardError::Invalid("queue id out of range"))?;
        let stamp = self.ingest_snapshot.read();
        let snapshot_id = *stamp;
        if snapshot_id == 0 {
            return Err(ShardError::Invalid("ingest snapshot not yet assigned"));
        }
        let offset = queue.append(snapshot_id, operations, is_ddl)?;
        drop(stamp);
        debug!(
            queue = %queue_id,
            snapshot_id,
            offset,
            is_ddl,
            "ingest.append"
        );
        Ok((snapshot_id, offset))
    }

    /// Appends data operations to the queue chosen by the first operation's routing key.
    pub fn write(&self, operations: Vec<Operation>) -> Result<(SnapshotId, Offset)> {
        let key = operations
            .iter()
            .find_map(Operation::routing_key)
            .map(|vertex| vertex.0)
            .unwrap_or(0);
        let queue = QueueId((key % self.queues.len() as u64) as u32);
        self.append(queue, operations, false)
    }

    /// Raises the ingest stamp to `snapshot_id` and returns the previous stamp.
    ///
    /// Lower or equal values are ignored. The marker batches are appended
    /// while the stamp is write-locked, so no batch stamped with the old
    /// value can land behind a marker in any queue.
    pub fn advance_ingest_snapshot_id(&self, snapshot_id: SnapshotId) -> Result<SnapshotId> {
        let mut stamp = self.ingest_snapshot.write();
        let previous = *stamp;
        if snapshot_id <= previous {
            return Ok(previous);
        }
        *stamp = snapshot_id;
        for queue in &self.queues {
            queue.append(snapshot_id, Vec::new(), false)?;
        }
        debug!(previous, snapshot_id, "ingest.snapshot.advance");
        Ok(previous)
    }
}

impl DdlWriter for IngestService {
    fn write_ddl(
        &self,
        request_id: &str,
        session_id: &str,
        operations: &[DdlOperation],
    ) -> Result<SnapshotId> {
        let key = (session_id.to_string(), request_id.to_string());
        let mut written = self.ddl_written.lock();
        if let Some(&snapshot_id) = written.get(&key) {
            info!(request_id, session_id, snapshot_id, "ingest.ddl.duplicate");
            return Ok(snapshot_id);
        }
        let ops = operations.iter().cloned().map(Operation::Ddl).collect();
        let (snapshot_id, offset) = self.append(QueueId(0), ops, true)?;
        written.put(key, snapshot_id);
        drop(written);
        info!(
            request_id,
            session_id,
            snapshot_id,
            offset,
            "ingest.ddl.appended"
        );
        Ok(snapshot_id)
    }
}

impl RpcService for IngestService {
    fn handle(&self, request: RpcRequest) -> Result<RpcResponse> {
        match request {
            RpcRequest::AdvanceIngestSnapshotId { snapshot_id } => self
                .advance_ingest_snapshot_id(snapshot_id)
                .map(RpcResponse::PreviousSnapshotId),
            RpcRequest::WriteDdl {
                request_id,
                session_id,
                operations,
            } => self
                .write_ddl(&request_id, &session_id, &operations)
                .map(RpcResponse::Written),
            other => Err(ShardError::Unsupported(other.name())),
        }
    }
}

/// Thread that tails one queue log into a partition's merge queue.
///
/// `offer` blocks while the partition's buffer for this queue is full, which
/// is where ingest backpressure comes from.
pub struct QueueDelivery {
    stop: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl QueueDelivery {
    /// Starts delivering `log` from offset `start` into `merge_queue`.
    pub fn spawn(
        partition: PartitionId,
        log: Arc<dyn QueueLog>,
        merge_queue: Arc<BatchMergeQueue>,
        start: Offset,
        cfg: &ApplierConfig,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let queue_id = log.queue_id();
        let read_batch = cfg.delivery_read_batch;
        let poll_timeout = cfg.poll_timeout();
        let flag = Arc::clone(&stop);
        let worker = Worker::spawn(format!("delivery-p{partition}-q{queue_id}"), move || {
            Self::run(
                partition,
                log,
                merge_queue,
                start,
                read_batch,
                poll_timeout,
                flag,
            )
        })?;
        Ok(Self {
            stop,
            worker: Some(worker),
        })
    }

    fn run(
        partition: PartitionId,
        log: Arc<dyn QueueLog>,
        merge_queue: Arc<BatchMergeQueue>,
        start: Offset,
        read_batch: usize,
        poll_timeout: Duration,
        stop: Arc<AtomicBool>,
    ) {
        let queue_id = log.queue_id();
        let mut next = start;
        debug!(partition = %partition, queue = %queue_id, start, "delivery.start");
        while !stop.load(Ordering::Acquire) {
            let batches = match log.read(next, read_batch, poll_timeout) {
                Ok(batches) => batches,
                Err(err) => {
                    warn!(partition = %partition, queue = %queue_id, error = %err, "delivery.read.failed");
                    std::thread::sleep(poll_timeout);
                    continue;
                }
            };
            for batch in batches {
                let offset = batch.offset;
                match merge_queue.offer(queue_id, batch) {
                    Ok(()) => next = offset + 1,
                    Err(ShardError::Shutdown) => {
                        debug!(partition = %partition, queue = %queue_id, "delivery.merge_queue.closed");
                        return;
                    }
                    Err(err) => {
                        warn!(partition = %partition, queue = %queue_id, offset, error = %err, "delivery.offer.failed");
                        return;
                    }
                }
            }
        }
        debug!(partition = %partition, queue = %queue_id, next, "delivery.stop");
    }

    /// Signals the thread to exit and waits up to `timeout`.
    ///
    /// A thread blocked in `offer` only exits once the merge queue is closed.
    pub fn stop(&mut self, timeout: Duration) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker.join_timeout(timeout);
        }
    }
}

impl Drop for QueueDelivery {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
