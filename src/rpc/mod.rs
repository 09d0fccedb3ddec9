//! Role-addressed request/response messaging between cluster processes.
//!
//! The protocol only needs a handful of calls; [`Transport`] hides how
//! they travel. [`LocalTransport`] keeps everything in one process.

use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::coordinator::DdlOutcome;
use crate::schema::{DdlOperation, GraphSchema};
use crate::types::{PartitionId, QueueId, QueueOffsets, Result, ShardError, SnapshotId};

mod client;
mod local;
mod registry;

pub use client::{CoordinatorClient, IngestorClient};
pub use local::LocalTransport;
pub use registry::RoleChannelRegistry;

/// Process roles of a cluster.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum RoleType {
    /// Snapshot and schema coordinator.
    Coordinator,
    /// Storage partition host.
    Store,
    /// Query frontend.
    Frontend,
    /// Ingest queue writer.
    Ingestor,
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoleType::Coordinator => "coordinator",
            RoleType::Store => "store",
            RoleType::Frontend => "frontend",
            RoleType::Ingestor => "ingestor",
        };
        f.write_str(name)
    }
}

/// Calls exchanged between roles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Store to coordinator: partition progress.
    CommitSnapshotId {
        /// Reporting partition.
        partition: PartitionId,
        /// Snapshot watermark.
        snapshot_id: SnapshotId,
        /// DDL watermark.
        ddl_snapshot_id: SnapshotId,
        /// Last consumed offset per queue.
        queue_offsets: QueueOffsets,
    },
    /// Client to coordinator: schema change.
    SubmitBatchDdl {
        /// Caller-chosen request id.
        request_id: String,
        /// Caller session.
        session_id: String,
        /// Operations, applied all or nothing.
        operations: Vec<DdlOperation>,
    },
    /// Coordinator to ingestor: append a DDL batch.
    WriteDdl {
        /// Request id of the originating submission.
        request_id: String,
        /// Session of the originating submission.
        session_id: String,
        /// Operations.
        operations: Vec<DdlOperation>,
    },
    /// Coordinator to ingestor: new stamp for incoming writes.
    AdvanceIngestSnapshotId {
        /// New stamp.
        snapshot_id: SnapshotId,
    },
    /// Coordinator to frontend: new readable snapshot.
    AdvanceQuerySnapshot {
        /// New query snapshot.
        snapshot_id: SnapshotId,
        /// Schema, when it changed since the frontend last acknowledged one.
        schema: Option<GraphSchema>,
    },
    /// Current coordinator schema.
    FetchSchema,
    /// Tail offset of each listed queue.
    GetTailOffsets {
        /// Queues of interest.
        queue_ids: Vec<QueueId>,
    },
}

impl RpcRequest {
    /// Operation name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            RpcRequest::CommitSnapshotId { .. } => "CommitSnapshotId",
            RpcRequest::SubmitBatchDdl { .. } => "SubmitBatchDdl",
            RpcRequest::WriteDdl { .. } => "WriteDdl",
            RpcRequest::AdvanceIngestSnapshotId { .. } => "AdvanceIngestSnapshotId",
            RpcRequest::AdvanceQuerySnapshot { .. } => "AdvanceQuerySnapshot",
            RpcRequest::FetchSchema => "FetchSchema",
            RpcRequest::GetTailOffsets { .. } => "GetTailOffsets",
        }
    }
}

/// Replies to [`RpcRequest`]s.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RpcResponse {
    /// Empty acknowledgement.
    Ack,
    /// Result of `SubmitBatchDdl`.
    Ddl(DdlOutcome),
    /// Snapshot a DDL batch was written at.
    Written(SnapshotId),
    /// Value the receiver held before the advance.
    PreviousSnapshotId(SnapshotId),
    /// Schema definition.
    Schema(GraphSchema),
    /// Offsets in request order.
    TailOffsets(QueueOffsets),
}

/// Completion callback of [`RoleChannel::call`].
pub type RpcCallback = Box<dyn FnOnce(Result<RpcResponse>) + Send + 'static>;

/// Request handler bound to a role instance.
pub trait RpcService: Send + Sync {
    /// Handles one request. May block; transports run it off their event loop.
    fn handle(&self, request: RpcRequest) -> Result<RpcResponse>;
}

/// Connection to one `(role, index)` endpoint.
pub trait RoleChannel: Send + Sync {
    /// Role at the far end.
    fn role(&self) -> RoleType;

    /// Instance index at the far end.
    fn index(&self) -> u32;

    /// Issues `request`; `done` runs on the transport's executor.
    fn call(&self, request: RpcRequest, done: RpcCallback);

    /// Fire-and-forget variant of [`RoleChannel::call`]; failures are logged.
    fn send(&self, request: RpcRequest) {
        let role = self.role();
        let index = self.index();
        let name = request.name();
        self.call(
            request,
            Box::new(move |result| {
                if let Err(err) = result {
                    warn!(role = %role, index, request = name, error = %err, "rpc.send.failed");
                }
            }),
        );
    }

    /// Stops admitting calls and waits up to `timeout` for in-flight ones.
    /// Returns `false` if calls were still running when the wait ended.
    fn shutdown(&self, timeout: Duration) -> bool;
}

/// Factory of [`RoleChannel`]s.
pub trait Transport: Send + Sync {
    /// Opens a channel to `(role, index)`.
    fn connect(&self, role: RoleType, index: u32) -> Result<Arc<dyn RoleChannel>>;
}

/// Issues `request` and blocks the caller until the reply or `timeout`.
pub fn call_blocking(
    channel: &dyn RoleChannel,
    request: RpcRequest,
    timeout: Duration,
) -> Result<RpcResponse> {
    let (tx, rx) = mpsc::channel();
    channel.call(
        request,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(ShardError::Timeout("rpc call")),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(ShardError::ChannelClosed),
    }
}
