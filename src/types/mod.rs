#![forbid(unsafe_code)]

//! Identifiers and the crate-wide error type shared by every component.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Checksum helpers used by on-disk checkpoint records.
pub mod checksum;

pub use checksum::crc32_of;

/// Global write-order sequence number assigned to every accepted batch.
///
/// Non-decreasing across the whole cluster; zero means "nothing applied yet".
pub type SnapshotId = u64;

/// Position of a batch inside one ingest queue.
pub type Offset = u64;

/// Last consumed offset per queue, indexed by [`QueueId::index`]. `None`
/// means nothing from that queue has been consumed.
pub type QueueOffsets = Vec<Option<Offset>>;

/// Storage partition identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

/// Ingest queue identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct QueueId(pub u32);

/// Vertex identifier inside the graph store.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct VertexId(pub u64);

/// Edge identifier inside the graph store.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct EdgeId(pub u64);

impl PartitionId {
    /// Returns the identifier as a vector index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl QueueId {
    /// Returns the identifier as a vector index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        PartitionId(value)
    }
}

impl From<u32> for QueueId {
    fn from(value: u32) -> Self {
        QueueId(value)
    }
}

/// Errors raised by the ingestion and snapshot protocol.
#[derive(thiserror::Error, Debug)]
pub enum ShardError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted state failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument that violates a protocol invariant.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Role or endpoint is not part of the configured topology.
    #[error("network configuration: {0}")]
    NetworkConfig(String),
    /// Channel was shut down before or while the call was in flight.
    #[error("channel closed")]
    ChannelClosed,
    /// Remote call failed in transport.
    #[error("transport: {0}")]
    Transport(String),
    /// Component is shutting down and no longer accepts work.
    #[error("shutdown in progress")]
    Shutdown,
    /// Bounded wait elapsed.
    #[error("timed out: {0}")]
    Timeout(&'static str),
    /// Persisted metadata could not be encoded or decoded.
    #[error("codec: {0}")]
    Codec(String),
    /// Unexpected response variant for the issued request.
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
    /// Request sent to a role that does not serve it.
    #[error("{0} is not served by this role")]
    Unsupported(&'static str),
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, ShardError>;
