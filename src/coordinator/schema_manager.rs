use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::schema::GraphSchema;
use crate::types::{Result, ShardError, SnapshotId};

use super::ddl::DdlOutcome;
use super::meta_store::MetaStore;

/// Progress of a DDL request, keyed by `(session_id, request_id)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DdlRecord {
    /// Written to the ingest queue at this snapshot; not yet visible.
    Pending(SnapshotId),
    /// Final answer returned to the caller.
    Done(DdlOutcome),
}

/// Coordinator's copy of the graph schema.
///
/// Readers get the current version lock-free. A schema is published once
/// the DDL that produced it is applied on every partition, and its version
/// is the snapshot id of that DDL.
pub struct SchemaManager {
    current: ArcSwap<GraphSchema>,
    meta: Arc<dyn MetaStore>,
    dedup: Mutex<LruCache<(String, String), DdlRecord>>,
    publish_lock: Mutex<()>,
    published: Condvar,
}

impl SchemaManager {
    /// Loads the persisted schema, or starts empty.
    pub fn open(meta: Arc<dyn MetaStore>, dedup_capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(dedup_capacity)
            .ok_or(ShardError::Invalid("ddl dedup capacity must be positive"))?;
        let schema = meta.load_schema()?.unwrap_or_default();
        info!(version = schema.version, "schema.open");
        Ok(Self {
            current: ArcSwap::from_pointee(schema),
            meta,
            dedup: Mutex::new(LruCache::new(capacity)),
            publish_lock: Mutex::new(()),
            published: Condvar::new(),
        })
    }

    /// Current schema.
    pub fn current(&self) -> Arc<GraphSchema> {
        self.current.load_full()
    }

    /// Owned copy of the current schema, as served by `FetchSchema`.
    pub fn fetch_schema(&self) -> GraphSchema {
        self.current.load().as_ref().clone()
    }

    /// Makes `schema` current unless a newer version is already published.
    pub fn publish(&self, schema: GraphSchema) {
        let _guard = self.publish_lock.lock();
        if schema.version <= self.current.load().version {
            return;
        }
        if let Err(err) = self.meta.save_schema(&schema) {
            warn!(version = schema.version, error = %err, "schema.save_failed");
        }
        info!(version = schema.version, "schema.publish");
        self.current.store(Arc::new(schema));
        self.published.notify_all();
    }

    /// Waits until the published version reaches `version`; `false` on timeout.
    pub fn wait_for_version(&self, version: SnapshotId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.publish_lock.lock();
        while self.current.load().version < version {
            if self.published.wait_until(&mut guard, deadline).timed_out() {
                return self.current.load().version >= version;
            }
        }
        true
    }

    /// Recorded progress of a request.
    pub fn lookup(&self, session_id: &str, request_id: &str) -> Option<DdlRecord> {
        self.dedup
            .lock()
            .get(&(session_id.to_string(), request_id.to_string()))
            .cloned()
    }

    /// Records progress of a request, evicting the least recently used entry when full.
    pub fn remember(&self, session_id: &str, request_id: &str, record: DdlRecord) {
        self.dedup
            .lock()
            .put((session_id.to_string(), request_id.to_string()), record);
    }
}
