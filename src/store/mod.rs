//! Storage role: applies merged batches to a partition and reports the
//! snapshot watermark it has reached.

mod applier;
mod checkpoint;
mod engine;
mod partition;

pub use applier::{ApplierState, CommitCallback, SnapshotCommitter, WatermarkInfo, WriteApplier};
pub use checkpoint::{PartitionCheckpoint, RecoveryState};
pub use engine::{EdgeRecord, GraphReader, GraphStore, MemoryGraphStore};
pub use partition::StorePartition;
