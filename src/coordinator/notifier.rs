use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::rpc::{RoleChannelRegistry, RoleType, RpcRequest, RpcResponse};
use crate::types::{Result, SnapshotId};
use crate::util::Worker;

use super::ddl::IngestSnapshotAdvancer;
use super::schema_manager::SchemaManager;
use super::snapshot_manager::{QuerySnapshot, QuerySnapshotListener, SnapshotManager};

/// What a frontend last acknowledged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrontendAck {
    /// Highest query snapshot the frontend accepted.
    pub snapshot_id: SnapshotId,
    /// Snapshot the frontend reported holding before that push.
    pub previous_snapshot_id: SnapshotId,
    /// Schema version the frontend holds, if one was ever pushed.
    pub schema_version: Option<SnapshotId>,
}

/// Pushes every query snapshot advance to the frontends.
pub struct FrontendNotifier {
    registry: Arc<RoleChannelRegistry>,
    schema: Arc<SchemaManager>,
    acks: Arc<Mutex<Vec<FrontendAck>>>,
}

impl FrontendNotifier {
    /// Notifier for frontends `0..frontend_count`.
    pub fn new(
        registry: Arc<RoleChannelRegistry>,
        schema: Arc<SchemaManager>,
        frontend_count: u32,
    ) -> Self {
        Self {
            registry,
            schema,
            acks: Arc::new(Mutex::new(vec![
                FrontendAck::default();
                frontend_count as usize
            ])),
        }
    }

    /// Last acknowledgement per frontend.
    pub fn acks(&self) -> Vec<FrontendAck> {
        self.acks.lock().clone()
    }
}

impl QuerySnapshotListener for FrontendNotifier {
    fn on_query_snapshot(&self, snapshot: QuerySnapshot) {
        let schema = self.schema.current();
        let held: Vec<Option<SnapshotId>> =
            self.acks.lock().iter().map(|ack| ack.schema_version).collect();
        for (index, held_version) in held.into_iter().enumerate() {
            let channel = match self.registry.get_channel(RoleType::Frontend, index as u32) {
                Ok(channel) => channel,
                Err(err) => {
                    warn!(frontend = index, error = %err, "notifier.channel.failed");
                    continue;
                }
            };
            let push_schema = held_version != Some(schema.version);
            let request = RpcRequest::AdvanceQuerySnapshot {
                snapshot_id: snapshot.snapshot_id,
                schema: push_schema.then(|| schema.as_ref().clone()),
            };
            let acks = Arc::clone(&self.acks);
            let version = schema.version;
            let snapshot_id = snapshot.snapshot_id;
            channel.call(
                request,
                Box::new(move |result| match result {
                    Ok(RpcResponse::PreviousSnapshotId(previous)) => {
                        let mut acks = acks.lock();
                        if let Some(ack) = acks.get_mut(index) {
                            if snapshot_id > ack.snapshot_id {
                                ack.snapshot_id = snapshot_id;
                                ack.previous_snapshot_id = previous;
                            }
                            if push_schema {
                                ack.schema_version = ack.schema_version.max(Some(version));
                            }
                        }
                        debug!(frontend = index, snapshot_id, previous, "notifier.frontend.ack");
                    }
                    Ok(other) => {
                        warn!(frontend = index, response = ?other, "notifier.frontend.unexpected");
                    }
                    Err(err) => {
                        warn!(frontend = index, snapshot_id, error = %err, "notifier.frontend.failed");
                    }
                }),
            );
        }
    }
}

/// Allocates write snapshots on a fixed interval and pushes each one to
/// every ingestor.
pub struct WriteSnapshotTicker {
    snapshots: Arc<SnapshotManager>,
    registry: Arc<RoleChannelRegistry>,
    ingestor_count: u32,
    interval: Duration,
    running: Mutex<Option<(Sender<()>, Worker)>>,
}

impl WriteSnapshotTicker {
    /// Ticker for ingestors `0..ingestor_count`.
    pub fn new(
        snapshots: Arc<SnapshotManager>,
        registry: Arc<RoleChannelRegistry>,
        ingestor_count: u32,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            snapshots,
            registry,
            ingestor_count,
            interval,
            running: Mutex::new(None),
        })
    }

    /// Starts ticking; no-op when already running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let ticker = Arc::clone(self);
        let worker = Worker::spawn("write-snapshot-ticker", move || loop {
            match stop_rx.recv_timeout(ticker.interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(err) = ticker.advance() {
                        warn!(error = %err, "ticker.advance.failed");
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;
        *running = Some((stop_tx, worker));
        info!(interval_ms = self.interval.as_millis() as u64, "ticker.start");
        Ok(())
    }

    /// Stops ticking and joins the thread.
    pub fn stop(&self) {
        let Some((stop_tx, worker)) = self.running.lock().take() else {
            return;
        };
        let _ = stop_tx.send(());
        worker.join_timeout(self.interval * 4 + Duration::from_secs(1));
        info!("ticker.stop");
    }
}

impl IngestSnapshotAdvancer for WriteSnapshotTicker {
    fn advance(&self) -> Result<SnapshotId> {
        let snapshot_id = self.snapshots.increase_write_snapshot_id();
        for index in 0..self.ingestor_count {
            let channel = self.registry.get_channel(RoleType::Ingestor, index)?;
            channel.call(
                RpcRequest::AdvanceIngestSnapshotId { snapshot_id },
                Box::new(move |result| match result {
                    Ok(RpcResponse::PreviousSnapshotId(previous)) => {
                        debug!(ingestor = index, snapshot_id, previous, "ticker.ingestor.ack");
                    }
                    Ok(other) => {
                        warn!(ingestor = index, response = ?other, "ticker.ingestor.unexpected");
                    }
                    Err(err) => {
                        warn!(ingestor = index, snapshot_id, error = %err, "ticker.ingestor.failed");
                    }
                }),
            );
        }
        Ok(snapshot_id)
    }
}
