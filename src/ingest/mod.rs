//! Ingest side of the write path: batches, queue logs, the ingest role and
//! the per-partition merge buffer that linearizes many queues into one.

mod batch;
mod log;
mod merge_queue;
mod metrics;
mod service;

pub use batch::{Operation, PropValue, Properties, WriteBatch};
pub use log::{MemoryQueueLog, QueueLog};
pub use merge_queue::BatchMergeQueue;
pub use metrics::{default_metrics, CounterMetrics, IngestMetrics, NoopMetrics};
pub use service::{IngestService, QueueDelivery};
