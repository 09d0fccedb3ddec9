use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::schema::{DdlOperation, GraphSchema};
use crate::types::{Result, ShardError, SnapshotId};

use super::schema_manager::{DdlRecord, SchemaManager};
use super::snapshot_manager::SnapshotManager;

/// Appends a DDL batch to the ordered ingest stream.
pub trait DdlWriter: Send + Sync {
    /// Writes `operations` as one DDL batch and returns its snapshot id.
    fn write_ddl(
        &self,
        request_id: &str,
        session_id: &str,
        operations: &[DdlOperation],
    ) -> Result<SnapshotId>;
}

/// Moves the ingest snapshot forward on demand.
pub trait IngestSnapshotAdvancer: Send + Sync {
    /// Allocates a new write snapshot and pushes it to the ingestors.
    fn advance(&self) -> Result<SnapshotId>;
}

/// Answer to a DDL submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DdlOutcome {
    /// The schema change is visible from `snapshot_id` on.
    Applied {
        /// Snapshot id and schema version of the change.
        snapshot_id: SnapshotId,
    },
    /// The change conflicts with the current schema.
    Rejected {
        /// Reason.
        message: String,
    },
}

/// DDL whose write failed without a reply; it may or may not be queued.
struct InDoubt {
    request_id: String,
    session_id: String,
    operations: Vec<DdlOperation>,
    next: GraphSchema,
}

#[derive(Default)]
struct Serial {
    /// Snapshot of the last DDL written.
    last_written: SnapshotId,
    in_doubt: Option<InDoubt>,
}

/// Runs DDL through the data write path.
///
/// A DDL batch is validated against the current schema, written to the
/// ingest queues like any other batch, and acknowledged once the query
/// snapshot covers it. Only one DDL is in flight at a time.
pub struct DdlSequencer {
    schema: Arc<SchemaManager>,
    snapshots: Arc<SnapshotManager>,
    writer: Arc<dyn DdlWriter>,
    advancer: Option<Arc<dyn IngestSnapshotAdvancer>>,
    wait_timeout: Duration,
    serial: Mutex<Serial>,
}

impl DdlSequencer {
    /// Creates a sequencer writing through `writer`.
    pub fn new(
        schema: Arc<SchemaManager>,
        snapshots: Arc<SnapshotManager>,
        writer: Arc<dyn DdlWriter>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            schema,
            snapshots,
            writer,
            advancer: None,
            wait_timeout,
            serial: Mutex::new(Serial::default()),
        }
    }

    /// Pushes the ingest snapshot forward right after each DDL write so the
    /// partitions cross its boundary without waiting for the next tick.
    pub fn with_advancer(mut self, advancer: Arc<dyn IngestSnapshotAdvancer>) -> Self {
        self.advancer = Some(advancer);
        self
    }

    /// Validates, writes and waits for a DDL batch.
    ///
    /// Conflicts come back as [`DdlOutcome::Rejected`]. Writer failures and
    /// wait timeouts are returned as errors; resubmitting the same
    /// `(request_id, session_id)` then waits for the earlier write instead
    /// of writing again. A write that failed without a reply is rewritten
    /// before any other DDL is accepted, and the writer returns the
    /// original snapshot if the first attempt did land.
    pub fn submit_batch_ddl(
        &self,
        request_id: &str,
        session_id: &str,
        operations: &[DdlOperation],
    ) -> Result<DdlOutcome> {
        let mut serial = self.serial.lock();
        match self.schema.lookup(session_id, request_id) {
            Some(DdlRecord::Done(outcome)) => {
                info!(request_id, session_id, "ddl.dedup.done");
                return Ok(outcome);
            }
            Some(DdlRecord::Pending(snapshot_id)) => {
                info!(request_id, session_id, snapshot_id, "ddl.dedup.pending");
                return self.await_visible(request_id, session_id, snapshot_id);
            }
            None => {}
        }
        if let Some(doubt) = serial.in_doubt.take() {
            let snapshot_id = match self.writer.write_ddl(
                &doubt.request_id,
                &doubt.session_id,
                &doubt.operations,
            ) {
                Ok(snapshot_id) => snapshot_id,
                Err(err) => {
                    warn!(
                        request_id = %doubt.request_id,
                        session_id = %doubt.session_id,
                        error = %err,
                        "ddl.in_doubt.unresolved"
                    );
                    serial.in_doubt = Some(doubt);
                    return Err(err);
                }
            };
            info!(
                request_id = %doubt.request_id,
                session_id = %doubt.session_id,
                snapshot_id,
                "ddl.in_doubt.resolved"
            );
            self.track(
                &mut serial,
                &doubt.request_id,
                &doubt.session_id,
                doubt.next,
                snapshot_id,
            );
            if doubt.request_id == request_id && doubt.session_id == session_id {
                return self.await_visible(request_id, session_id, snapshot_id);
            }
        }
        if !self.schema.wait_for_version(serial.last_written, self.wait_timeout) {
            return Err(ShardError::Timeout("previous ddl not yet visible"));
        }

        let next = match self.schema.current().apply_ddl(operations) {
            Ok(next) => next,
            Err(conflict) => {
                let outcome = DdlOutcome::Rejected {
                    message: conflict.to_string(),
                };
                info!(request_id, session_id, reason = %conflict, "ddl.rejected");
                self.schema
                    .remember(session_id, request_id, DdlRecord::Done(outcome.clone()));
                return Ok(outcome);
            }
        };

        let snapshot_id = match self.writer.write_ddl(request_id, session_id, operations) {
            Ok(snapshot_id) => snapshot_id,
            Err(err) => {
                warn!(request_id, session_id, error = %err, "ddl.write.failed");
                serial.in_doubt = Some(InDoubt {
                    request_id: request_id.to_string(),
                    session_id: session_id.to_string(),
                    operations: operations.to_vec(),
                    next,
                });
                return Err(err);
            }
        };
        self.track(&mut serial, request_id, session_id, next, snapshot_id);
        self.await_visible(request_id, session_id, snapshot_id)
    }

    /// Records a written DDL and arranges for its schema to be published
    /// once the query snapshot reaches it.
    fn track(
        &self,
        serial: &mut Serial,
        request_id: &str,
        session_id: &str,
        next: GraphSchema,
        snapshot_id: SnapshotId,
    ) {
        serial.last_written = snapshot_id;
        self.schema
            .remember(session_id, request_id, DdlRecord::Pending(snapshot_id));
        let schema = Arc::clone(&self.schema);
        self.snapshots.add_snapshot_listener(
            snapshot_id,
            Box::new(move |_| schema.publish(next.with_version(snapshot_id))),
        );
        if let Some(advancer) = &self.advancer {
            if let Err(err) = advancer.advance() {
                warn!(snapshot_id, error = %err, "ddl.advance.failed");
            }
        }
    }

    fn await_visible(
        &self,
        request_id: &str,
        session_id: &str,
        snapshot_id: SnapshotId,
    ) -> Result<DdlOutcome> {
        if !self.schema.wait_for_version(snapshot_id, self.wait_timeout) {
            warn!(request_id, session_id, snapshot_id, "ddl.wait.timeout");
            return Err(ShardError::Timeout("ddl apply wait"));
        }
        let outcome = DdlOutcome::Applied { snapshot_id };
        self.schema
            .remember(session_id, request_id, DdlRecord::Done(outcome.clone()));
        info!(request_id, session_id, snapshot_id, "ddl.applied");
        Ok(outcome)
    }
}
