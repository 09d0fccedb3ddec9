//! Snapshot-ordered ingestion for a partitioned graph store.
//!
//! Writes and schema changes are stamped with a global snapshot id by the
//! ingest role and appended to ordered queues. Every storage partition
//! merges its queues back into one snapshot-ordered stream, applies it and
//! reports the highest fully applied snapshot. The coordinator publishes
//! the minimum across partitions as the snapshot queries may read.

#![warn(missing_docs)]

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod frontend;
pub mod ingest;
pub mod rpc;
pub mod schema;
pub mod store;
pub mod types;

mod util;

pub use cluster::LocalCluster;
pub use config::{ConfigError, ShardConfig};
pub use types::{Result, ShardError};
