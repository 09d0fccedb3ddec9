use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::{DdlOutcome, DdlWriter};
use crate::schema::{DdlOperation, GraphSchema};
use crate::store::{CommitCallback, SnapshotCommitter};
use crate::types::{PartitionId, QueueId, QueueOffsets, Result, ShardError, SnapshotId};

use super::{call_blocking, RoleChannel, RoleChannelRegistry, RoleType, RpcRequest, RpcResponse};

/// Typed calls to coordinator 0.
#[derive(Clone)]
pub struct CoordinatorClient {
    registry: Arc<RoleChannelRegistry>,
    call_timeout: Duration,
}

impl CoordinatorClient {
    /// Client whose blocking calls give up after `call_timeout`.
    pub fn new(registry: Arc<RoleChannelRegistry>, call_timeout: Duration) -> Self {
        Self {
            registry,
            call_timeout,
        }
    }

    fn channel(&self) -> Result<Arc<dyn RoleChannel>> {
        self.registry.get_channel(RoleType::Coordinator, 0)
    }

    /// Submits a DDL batch and waits for its outcome.
    pub fn submit_batch_ddl(
        &self,
        request_id: &str,
        session_id: &str,
        operations: Vec<DdlOperation>,
    ) -> Result<DdlOutcome> {
        let request = RpcRequest::SubmitBatchDdl {
            request_id: request_id.to_string(),
            session_id: session_id.to_string(),
            operations,
        };
        match call_blocking(self.channel()?.as_ref(), request, self.call_timeout)? {
            RpcResponse::Ddl(outcome) => Ok(outcome),
            _ => Err(ShardError::UnexpectedResponse("SubmitBatchDdl")),
        }
    }

    /// Current coordinator schema.
    pub fn fetch_schema(&self) -> Result<GraphSchema> {
        match call_blocking(
            self.channel()?.as_ref(),
            RpcRequest::FetchSchema,
            self.call_timeout,
        )? {
            RpcResponse::Schema(schema) => Ok(schema),
            _ => Err(ShardError::UnexpectedResponse("FetchSchema")),
        }
    }

    /// Tail offsets of `queue_ids`, in order.
    pub fn get_tail_offsets(&self, queue_ids: Vec<QueueId>) -> Result<QueueOffsets> {
        match call_blocking(
            self.channel()?.as_ref(),
            RpcRequest::GetTailOffsets { queue_ids },
            self.call_timeout,
        )? {
            RpcResponse::TailOffsets(offsets) => Ok(offsets),
            _ => Err(ShardError::UnexpectedResponse("GetTailOffsets")),
        }
    }
}

impl SnapshotCommitter for CoordinatorClient {
    fn commit_snapshot_id(
        &self,
        partition: PartitionId,
        snapshot_id: SnapshotId,
        ddl_snapshot_id: SnapshotId,
        queue_offsets: QueueOffsets,
        done: CommitCallback,
    ) {
        let channel = match self.channel() {
            Ok(channel) => channel,
            Err(err) => return done(Err(err)),
        };
        channel.call(
            RpcRequest::CommitSnapshotId {
                partition,
                snapshot_id,
                ddl_snapshot_id,
                queue_offsets,
            },
            Box::new(move |result| {
                done(result.and_then(|response| match response {
                    RpcResponse::Ack => Ok(()),
                    _ => Err(ShardError::UnexpectedResponse("CommitSnapshotId")),
                }))
            }),
        );
    }
}

/// Typed calls to one ingestor.
pub struct IngestorClient {
    registry: Arc<RoleChannelRegistry>,
    index: u32,
    call_timeout: Duration,
}

impl IngestorClient {
    /// Client for ingestor `index`.
    pub fn new(registry: Arc<RoleChannelRegistry>, index: u32, call_timeout: Duration) -> Self {
        Self {
            registry,
            index,
            call_timeout,
        }
    }

    /// Pushes a new ingest stamp and returns the ingestor's previous one.
    pub fn advance_ingest_snapshot_id(&self, snapshot_id: SnapshotId) -> Result<SnapshotId> {
        let channel = self.registry.get_channel(RoleType::Ingestor, self.index)?;
        match call_blocking(
            channel.as_ref(),
            RpcRequest::AdvanceIngestSnapshotId { snapshot_id },
            self.call_timeout,
        )? {
            RpcResponse::PreviousSnapshotId(previous) => Ok(previous),
            _ => Err(ShardError::UnexpectedResponse("AdvanceIngestSnapshotId")),
        }
    }
}

impl DdlWriter for IngestorClient {
    fn write_ddl(
        &self,
        request_id: &str,
        session_id: &str,
        operations: &[DdlOperation],
    ) -> Result<SnapshotId> {
        let channel = self.registry.get_channel(RoleType::Ingestor, self.index)?;
        let request = RpcRequest::WriteDdl {
            request_id: request_id.to_string(),
            session_id: session_id.to_string(),
            operations: operations.to_vec(),
        };
        match call_blocking(channel.as_ref(), request, self.call_timeout)? {
            RpcResponse::Written(snapshot_id) => Ok(snapshot_id),
            _ => Err(ShardError::UnexpectedResponse("WriteDdl")),
        }
    }
}
