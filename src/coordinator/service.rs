use std::sync::Arc;

use tracing::warn;

use crate::rpc::{RpcRequest, RpcResponse, RpcService};
use crate::types::{Result, ShardError};

use super::ddl::DdlSequencer;
use super::schema_manager::SchemaManager;
use super::snapshot_manager::SnapshotManager;

/// RPC front of the coordinator role.
pub struct CoordinatorService {
    snapshots: Arc<SnapshotManager>,
    schema: Arc<SchemaManager>,
    ddl: Arc<DdlSequencer>,
}

impl CoordinatorService {
    /// Wraps the coordinator components.
    pub fn new(
        snapshots: Arc<SnapshotManager>,
        schema: Arc<SchemaManager>,
        ddl: Arc<DdlSequencer>,
    ) -> Self {
        Self {
            snapshots,
            schema,
            ddl,
        }
    }
}

impl RpcService for CoordinatorService {
    fn handle(&self, request: RpcRequest) -> Result<RpcResponse> {
        match request {
            RpcRequest::CommitSnapshotId {
                partition,
                snapshot_id,
                ddl_snapshot_id,
                queue_offsets,
            } => {
                self.snapshots
                    .commit(partition, snapshot_id, ddl_snapshot_id, queue_offsets);
                Ok(RpcResponse::Ack)
            }
            RpcRequest::SubmitBatchDdl {
                request_id,
                session_id,
                operations,
            } => self
                .ddl
                .submit_batch_ddl(&request_id, &session_id, &operations)
                .map(RpcResponse::Ddl),
            RpcRequest::FetchSchema => Ok(RpcResponse::Schema(self.schema.fetch_schema())),
            RpcRequest::GetTailOffsets { queue_ids } => Ok(RpcResponse::TailOffsets(
                self.snapshots.get_tail_offsets(&queue_ids),
            )),
            other => {
                warn!(request = other.name(), "coordinator.request.unsupported");
                Err(ShardError::Unsupported(other.name()))
            }
        }
    }
}
