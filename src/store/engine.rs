use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::ingest::{Operation, Properties, WriteBatch};
use crate::schema::GraphSchema;
use crate::types::{EdgeId, PartitionId, Result, ShardError, SnapshotId, VertexId};

/// Local storage engine of one partition.
///
/// Owned by the partition's consume loop; nothing else writes to it. An
/// `Err` makes the caller retry the same batch, so implementations must
/// leave no partial effects behind when they fail.
pub trait GraphStore: Send {
    /// Applies every operation of `batch` at `batch.snapshot_id`.
    fn apply(&mut self, batch: &WriteBatch) -> Result<()>;
}

/// Edge payload kept by [`MemoryGraphStore`].
#[derive(Clone, Debug, PartialEq)]
pub struct EdgeRecord {
    /// Source vertex.
    pub src: VertexId,
    /// Destination vertex.
    pub dst: VertexId,
    /// Properties.
    pub props: Properties,
}

#[derive(Clone, Debug)]
struct Version<T> {
    snapshot: SnapshotId,
    value: Option<T>,
}

/// Versions ordered by snapshot; `None` values are tombstones.
#[derive(Clone, Debug)]
struct VersionChain<T> {
    versions: Vec<Version<T>>,
}

impl<T: Clone> VersionChain<T> {
    fn new() -> Self {
        Self {
            versions: Vec::new(),
        }
    }

    fn latest(&self) -> Option<&T> {
        self.versions.last().and_then(|v| v.value.as_ref())
    }

    fn visible_at(&self, snapshot: SnapshotId) -> Option<&T> {
        self.versions
            .iter()
            .rev()
            .find(|v| v.snapshot <= snapshot)
            .and_then(|v| v.value.as_ref())
    }

    fn put(&mut self, snapshot: SnapshotId, value: Option<T>) {
        match self.versions.last_mut() {
            Some(last) if last.snapshot == snapshot => last.value = value,
            _ => self.versions.push(Version { snapshot, value }),
        }
    }
}

#[derive(Default)]
struct GraphData {
    vertices: BTreeMap<(String, VertexId), VersionChain<Properties>>,
    edges: BTreeMap<(String, EdgeId), VersionChain<EdgeRecord>>,
    schema: GraphSchema,
    applied_batches: u64,
}

/// In-memory multi-version graph partition.
///
/// Data operations are kept only when their routing key hashes to this
/// partition; DDL is applied everywhere. Reads go through [`GraphReader`]
/// and see the state as of a given snapshot id.
pub struct MemoryGraphStore {
    partition: PartitionId,
    partition_count: u32,
    data: Arc<RwLock<GraphData>>,
}

impl MemoryGraphStore {
    /// Creates an empty partition `partition` of `partition_count`.
    pub fn new(partition: PartitionId, partition_count: u32) -> Result<Self> {
        if partition_count == 0 || partition.0 >= partition_count {
            return Err(ShardError::Invalid("partition outside partition count"));
        }
        Ok(Self {
            partition,
            partition_count,
            data: Arc::new(RwLock::new(GraphData::default())),
        })
    }

    /// Read handle that stays valid after the store moves into its consume loop.
    pub fn reader(&self) -> GraphReader {
        GraphReader {
            data: Arc::clone(&self.data),
        }
    }

    fn owns(&self, op: &Operation) -> bool {
        match op.routing_key() {
            Some(vertex) => vertex.0 % u64::from(self.partition_count) == u64::from(self.partition.0),
            None => true,
        }
    }
}

impl GraphStore for MemoryGraphStore {
    fn apply(&mut self, batch: &WriteBatch) -> Result<()> {
        let snapshot = batch.snapshot_id;
        let mut data = self.data.write();
        for op in batch.operations.iter().filter(|op| self.owns(op)) {
            match op {
                Operation::OverwriteVertex { label, id, props } => {
                    data.vertices
                        .entry((label.clone(), *id))
                        .or_insert_with(VersionChain::new)
                        .put(snapshot, Some(props.clone()));
                }
                Operation::UpdateVertex { label, id, props } => {
                    let chain = data
                        .vertices
                        .entry((label.clone(), *id))
                        .or_insert_with(VersionChain::new);
                    let mut merged = chain.latest().cloned().unwrap_or_default();
                    merged.extend(props.iter().map(|(k, v)| (k.clone(), v.clone())));
                    chain.put(snapshot, Some(merged));
                }
                Operation::DeleteVertex { label, id } => {
                    if let Some(chain) = data.vertices.get_mut(&(label.clone(), *id)) {
                        chain.put(snapshot, None);
                    }
                }
                Operation::OverwriteEdge {
                    label,
                    id,
                    src,
                    dst,
                    props,
                } => {
                    data.edges
                        .entry((label.clone(), *id))
                        .or_insert_with(VersionChain::new)
                        .put(
                            snapshot,
                            Some(EdgeRecord {
                                src: *src,
                                dst: *dst,
                                props: props.clone(),
                            }),
                        );
                }
                Operation::DeleteEdge { label, id, .. } => {
                    if let Some(chain) = data.edges.get_mut(&(label.clone(), *id)) {
                        chain.put(snapshot, None);
                    }
                }
                Operation::Ddl(ddl) => match data.schema.apply_ddl(std::slice::from_ref(ddl)) {
                    Ok(next) => data.schema = next.with_version(snapshot),
                    Err(conflict) => {
                        // Replays after a restart hit DDL that is already in place.
                        warn!(
                            partition = %self.partition,
                            snapshot_id = snapshot,
                            reason = %conflict,
                            "store.ddl.skipped"
                        );
                    }
                },
            }
        }
        data.applied_batches += 1;
        debug!(
            partition = %self.partition,
            snapshot_id = snapshot,
            operations = batch.operations.len(),
            "store.batch.applied"
        );
        Ok(())
    }
}

/// Shared read view over a [`MemoryGraphStore`].
#[derive(Clone)]
pub struct GraphReader {
    data: Arc<RwLock<GraphData>>,
}

impl GraphReader {
    /// Vertex properties as of `snapshot`.
    pub fn vertex(&self, label: &str, id: VertexId, snapshot: SnapshotId) -> Option<Properties> {
        let data = self.data.read();
        data.vertices
            .get(&(label.to_string(), id))
            .and_then(|chain| chain.visible_at(snapshot).cloned())
    }

    /// Edge as of `snapshot`.
    pub fn edge(&self, label: &str, id: EdgeId, snapshot: SnapshotId) -> Option<EdgeRecord> {
        let data = self.data.read();
        data.edges
            .get(&(label.to_string(), id))
            .and_then(|chain| chain.visible_at(snapshot).cloned())
    }

    /// Number of vertices visible at `snapshot`.
    pub fn vertex_count(&self, snapshot: SnapshotId) -> usize {
        let data = self.data.read();
        data.vertices
            .values()
            .filter(|chain| chain.visible_at(snapshot).is_some())
            .count()
    }

    /// Schema as last applied by DDL batches.
    pub fn schema(&self) -> GraphSchema {
        self.data.read().schema.clone()
    }

    /// Number of batches the engine has applied.
    pub fn applied_batches(&self) -> u64 {
        self.data.read().applied_batches
    }
}
