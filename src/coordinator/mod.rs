//! Coordinator role: aggregates partition progress into the query
//! snapshot, allocates write snapshots and sequences schema changes.

mod ddl;
mod meta_store;
mod notifier;
mod schema_manager;
mod service;
mod snapshot_manager;

pub use ddl::{DdlOutcome, DdlSequencer, DdlWriter, IngestSnapshotAdvancer};
pub use meta_store::{CoordinatorMeta, FileMetaStore, MemoryMetaStore, MetaStore};
pub use notifier::{FrontendAck, FrontendNotifier, WriteSnapshotTicker};
pub use schema_manager::{DdlRecord, SchemaManager};
pub use service::CoordinatorService;
pub use snapshot_manager::{
    CommitRecord, QuerySnapshot, QuerySnapshotListener, SnapshotListener, SnapshotManager,
};
