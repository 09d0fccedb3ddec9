//! Frontend role: holds the snapshot queries may read at.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::rpc::{RpcRequest, RpcResponse, RpcService};
use crate::schema::GraphSchema;
use crate::types::{Result, ShardError, SnapshotId};

struct Visible {
    snapshot_id: SnapshotId,
    schema: Arc<GraphSchema>,
}

/// Query snapshot and schema as last pushed by the coordinator.
///
/// Both only move forward; a push carrying an older snapshot or schema
/// version leaves the cache unchanged.
pub struct FrontendSnapshotCache {
    visible: RwLock<Visible>,
}

impl Default for FrontendSnapshotCache {
    fn default() -> Self {
        Self {
            visible: RwLock::new(Visible {
                snapshot_id: 0,
                schema: Arc::new(GraphSchema::default()),
            }),
        }
    }
}

impl FrontendSnapshotCache {
    /// Empty cache at snapshot zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a push and returns the snapshot held before it.
    pub fn advance(&self, snapshot_id: SnapshotId, schema: Option<GraphSchema>) -> SnapshotId {
        let mut visible = self.visible.write();
        let previous = visible.snapshot_id;
        if snapshot_id > previous {
            visible.snapshot_id = snapshot_id;
        }
        if let Some(schema) = schema {
            if schema.version > visible.schema.version {
                visible.schema = Arc::new(schema);
            }
        }
        debug!(previous, snapshot_id = visible.snapshot_id, schema_version = visible.schema.version, "frontend.advance");
        previous
    }

    /// Snapshot new queries read at.
    pub fn query_snapshot_id(&self) -> SnapshotId {
        self.visible.read().snapshot_id
    }

    /// Schema new queries plan against.
    pub fn schema(&self) -> Arc<GraphSchema> {
        Arc::clone(&self.visible.read().schema)
    }
}

impl RpcService for FrontendSnapshotCache {
    fn handle(&self, request: RpcRequest) -> Result<RpcResponse> {
        match request {
            RpcRequest::AdvanceQuerySnapshot {
                snapshot_id,
                schema,
            } => Ok(RpcResponse::PreviousSnapshotId(
                self.advance(snapshot_id, schema),
            )),
            other => Err(ShardError::Unsupported(other.name())),
        }
    }
}
