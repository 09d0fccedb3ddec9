//! Every role of a deployment wired together in one process.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::ShardConfig;
use crate::coordinator::{
    CoordinatorService, DdlSequencer, FrontendNotifier, MemoryMetaStore, MetaStore,
    QuerySnapshot, SchemaManager, SnapshotManager, WriteSnapshotTicker,
};
use crate::frontend::FrontendSnapshotCache;
use crate::ingest::{CounterMetrics, IngestService, MemoryQueueLog, QueueLog};
use crate::rpc::{
    CoordinatorClient, IngestorClient, LocalTransport, RoleChannelRegistry, RoleType,
};
use crate::store::{GraphReader, MemoryGraphStore, StorePartition};
use crate::types::{PartitionId, QueueId, Result, ShardError, SnapshotId};

/// Coordinator, ingestor, partitions and frontends over a [`LocalTransport`].
///
/// Queue logs live in memory, so the cluster never reads or writes
/// checkpoints or coordinator metadata.
pub struct LocalCluster {
    transport: Arc<LocalTransport>,
    registry: Arc<RoleChannelRegistry>,
    snapshots: Arc<SnapshotManager>,
    schema: Arc<SchemaManager>,
    ticker: Arc<WriteSnapshotTicker>,
    notifier: Arc<FrontendNotifier>,
    ingest: Arc<IngestService>,
    partitions: Vec<StorePartition>,
    readers: Vec<GraphReader>,
    frontends: Vec<Arc<FrontendSnapshotCache>>,
    client: CoordinatorClient,
    metrics: Arc<CounterMetrics>,
    shutdown_timeout: Duration,
    stopped: bool,
}

impl LocalCluster {
    /// Boots every role and starts the write snapshot ticker.
    pub fn start(cfg: &ShardConfig) -> Result<Self> {
        let topology = &cfg.cluster;
        if topology.coordinator_count != 1 || topology.ingestor_count != 1 {
            return Err(ShardError::Invalid(
                "local cluster runs exactly one coordinator and one ingestor",
            ));
        }
        if topology.store_count == 0 || topology.queue_count == 0 {
            return Err(ShardError::Invalid(
                "local cluster needs at least one partition and one queue",
            ));
        }
        if cfg.applier.checkpoint_dir.is_some() || cfg.coordinator.meta_dir.is_some() {
            warn!("cluster.persistence.ignored");
        }
        let mut applier_cfg = cfg.applier.clone();
        applier_cfg.checkpoint_dir = None;

        let transport = Arc::new(LocalTransport::new(cfg.rpc.worker_threads)?);
        let registry = Arc::new(RoleChannelRegistry::new(
            transport.clone(),
            topology.discovery,
            cfg.rpc.shutdown_timeout(),
        ));
        registry.register_role(RoleType::Coordinator, 1);
        registry.register_role(RoleType::Store, topology.store_count);
        registry.register_role(RoleType::Frontend, topology.frontend_count);
        registry.register_role(RoleType::Ingestor, 1);

        let meta: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::default());
        let snapshots = Arc::new(SnapshotManager::new(
            topology.store_count as usize,
            topology.queue_count as usize,
            Arc::clone(&meta),
        ));
        snapshots.start()?;
        let schema = Arc::new(SchemaManager::open(meta, cfg.coordinator.ddl_dedup_capacity)?);
        let call_timeout = cfg.coordinator.ddl_wait_timeout() + cfg.rpc.shutdown_timeout();
        let ticker = WriteSnapshotTicker::new(
            Arc::clone(&snapshots),
            Arc::clone(&registry),
            1,
            cfg.coordinator.write_snapshot_interval(),
        );
        let ddl = DdlSequencer::new(
            Arc::clone(&schema),
            Arc::clone(&snapshots),
            Arc::new(IngestorClient::new(Arc::clone(&registry), 0, call_timeout)),
            cfg.coordinator.ddl_wait_timeout(),
        )
        .with_advancer(ticker.clone());
        transport.register_service(
            RoleType::Coordinator,
            0,
            Arc::new(CoordinatorService::new(
                Arc::clone(&snapshots),
                Arc::clone(&schema),
                Arc::new(ddl),
            )),
        );
        let notifier = Arc::new(FrontendNotifier::new(
            Arc::clone(&registry),
            Arc::clone(&schema),
            topology.frontend_count,
        ));
        snapshots.add_query_listener(notifier.clone());

        let frontends: Vec<Arc<FrontendSnapshotCache>> = (0..topology.frontend_count)
            .map(|index| {
                let frontend = Arc::new(FrontendSnapshotCache::new());
                transport.register_service(RoleType::Frontend, index, frontend.clone());
                frontend
            })
            .collect();

        let logs: Vec<Arc<dyn QueueLog>> = (0..topology.queue_count)
            .map(|queue| Arc::new(MemoryQueueLog::new(QueueId(queue))) as Arc<dyn QueueLog>)
            .collect();
        let ingest = Arc::new(IngestService::new(logs.clone())?);
        transport.register_service(RoleType::Ingestor, 0, ingest.clone());

        registry.start()?;
        IngestorClient::new(Arc::clone(&registry), 0, call_timeout)
            .advance_ingest_snapshot_id(snapshots.increase_write_snapshot_id())?;

        let client = CoordinatorClient::new(Arc::clone(&registry), call_timeout);
        let metrics = Arc::new(CounterMetrics::default());
        let mut partitions = Vec::with_capacity(topology.store_count as usize);
        let mut readers = Vec::with_capacity(topology.store_count as usize);
        for index in 0..topology.store_count {
            let id = PartitionId(index);
            let store = MemoryGraphStore::new(id, topology.store_count)?;
            readers.push(store.reader());
            let mut partition = StorePartition::open(
                id,
                &applier_cfg,
                logs.clone(),
                Box::new(store),
                Arc::new(client.clone()),
                metrics.clone(),
            )?;
            partition.start()?;
            partitions.push(partition);
        }
        ticker.start()?;
        info!(
            partitions = topology.store_count,
            queues = topology.queue_count,
            frontends = topology.frontend_count,
            "cluster.start"
        );
        Ok(Self {
            transport,
            registry,
            snapshots,
            schema,
            ticker,
            notifier,
            ingest,
            partitions,
            readers,
            frontends,
            client,
            metrics,
            shutdown_timeout: cfg.rpc.shutdown_timeout(),
            stopped: false,
        })
    }

    /// Ingest role.
    pub fn ingest(&self) -> &Arc<IngestService> {
        &self.ingest
    }

    /// Client of the coordinator role.
    pub fn client(&self) -> &CoordinatorClient {
        &self.client
    }

    /// Coordinator's snapshot manager.
    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Coordinator's schema manager.
    pub fn schema(&self) -> &Arc<SchemaManager> {
        &self.schema
    }

    /// Frontend notifier registered with the snapshot manager.
    pub fn notifier(&self) -> &Arc<FrontendNotifier> {
        &self.notifier
    }

    /// Frontend `index`.
    pub fn frontend(&self, index: usize) -> Option<&Arc<FrontendSnapshotCache>> {
        self.frontends.get(index)
    }

    /// Partition `index`.
    pub fn partition(&self, index: usize) -> Option<&StorePartition> {
        self.partitions.get(index)
    }

    /// Read view of partition `index`.
    pub fn reader(&self, index: usize) -> Option<&GraphReader> {
        self.readers.get(index)
    }

    /// Write-path counters shared by all partitions.
    pub fn metrics(&self) -> &Arc<CounterMetrics> {
        &self.metrics
    }

    /// Blocks until the query snapshot reaches `snapshot_id`.
    pub fn wait_for_query_snapshot(
        &self,
        snapshot_id: SnapshotId,
        timeout: Duration,
    ) -> Result<QuerySnapshot> {
        self.snapshots.wait_for_query_snapshot(snapshot_id, timeout)
    }

    /// Stops every role, bounded by the configured shutdown timeout.
    pub fn shutdown(mut self) {
        self.stop_roles();
    }

    fn stop_roles(&mut self) {
        if std::mem::replace(&mut self.stopped, true) {
            return;
        }
        self.ticker.stop();
        for partition in &mut self.partitions {
            partition.stop();
        }
        self.registry.stop();
        self.transport.shutdown(self.shutdown_timeout);
        info!("cluster.stop");
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.stop_roles();
    }
}
