use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::schema::DdlOperation;
use crate::types::{EdgeId, Offset, QueueId, SnapshotId, VertexId};

/// Property value carried by a data operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropValue {
    /// Signed integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// String.
    Str(String),
    /// Boolean.
    Bool(bool),
}

/// Property map keyed by property name.
pub type Properties = BTreeMap<String, PropValue>;

/// Single mutation inside a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Inserts or replaces a vertex.
    OverwriteVertex {
        /// Vertex label.
        label: String,
        /// Vertex id.
        id: VertexId,
        /// Full property set.
        props: Properties,
    },
    /// Merges properties into an existing vertex.
    UpdateVertex {
        /// Vertex label.
        label: String,
        /// Vertex id.
        id: VertexId,
        /// Properties to set.
        props: Properties,
    },
    /// Removes a vertex.
    DeleteVertex {
        /// Vertex label.
        label: String,
        /// Vertex id.
        id: VertexId,
    },
    /// Inserts or replaces an edge.
    OverwriteEdge {
        /// Edge label.
        label: String,
        /// Edge id.
        id: EdgeId,
        /// Source vertex.
        src: VertexId,
        /// Destination vertex.
        dst: VertexId,
        /// Full property set.
        props: Properties,
    },
    /// Removes an edge.
    DeleteEdge {
        /// Edge label.
        label: String,
        /// Edge id.
        id: EdgeId,
        /// Source vertex, used for routing.
        src: VertexId,
    },
    /// Schema mutation; broadcast to every partition.
    Ddl(DdlOperation),
}

impl Operation {
    /// Vertex whose partition owns this operation, or `None` for broadcast operations.
    pub fn routing_key(&self) -> Option<VertexId> {
        match self {
            Operation::OverwriteVertex { id, .. }
            | Operation::UpdateVertex { id, .. }
            | Operation::DeleteVertex { id, .. } => Some(*id),
            Operation::OverwriteEdge { src, .. } | Operation::DeleteEdge { src, .. } => Some(*src),
            Operation::Ddl(_) => None,
        }
    }
}

/// Unit handed from an ingest queue to a partition's merge queue.
///
/// Within one queue batches arrive with non-decreasing `snapshot_id` and
/// strictly increasing `offset`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    /// Queue this batch was read from.
    pub queue_id: QueueId,
    /// Snapshot the batch belongs to.
    pub snapshot_id: SnapshotId,
    /// Position inside the queue.
    pub offset: Offset,
    /// Mutations, applied in order.
    pub operations: Vec<Operation>,
    /// Whether the batch changes the schema.
    pub is_ddl: bool,
}

impl WriteBatch {
    /// Builds a data batch.
    pub fn new(
        queue_id: QueueId,
        snapshot_id: SnapshotId,
        offset: Offset,
        operations: Vec<Operation>,
    ) -> Self {
        Self {
            queue_id,
            snapshot_id,
            offset,
            operations,
            is_ddl: false,
        }
    }

    /// Builds an empty batch whose only job is to move a queue to `snapshot_id`.
    pub fn marker(queue_id: QueueId, snapshot_id: SnapshotId, offset: Offset) -> Self {
        Self::new(queue_id, snapshot_id, offset, Vec::new())
    }

    /// Marks the batch as schema-changing.
    pub fn ddl(mut self) -> Self {
        self.is_ddl = true;
        self
    }

    /// Returns `true` for batches with nothing to hand to storage.
    pub fn is_marker(&self) -> bool {
        self.operations.is_empty() && !self.is_ddl
    }
}
