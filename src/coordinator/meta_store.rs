use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::schema::GraphSchema;
use crate::types::{QueueOffsets, Result, ShardError, SnapshotId};

const SNAPSHOT_FILE: &str = "snapshot.json";
const SCHEMA_FILE: &str = "schema.json";

/// Coordinator progress that must survive a restart.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorMeta {
    /// Last published query snapshot.
    pub query_snapshot_id: SnapshotId,
    /// Global ddl snapshot published with it.
    pub ddl_snapshot_id: SnapshotId,
    /// Last allocated write snapshot.
    pub write_snapshot_id: SnapshotId,
    /// Tail offset per queue at the time of publication.
    pub queue_offsets: QueueOffsets,
}

/// Durable home of coordinator metadata.
pub trait MetaStore: Send + Sync {
    /// Last saved snapshot metadata, if any.
    fn load_meta(&self) -> Result<Option<CoordinatorMeta>>;

    /// Replaces the snapshot metadata.
    fn save_meta(&self, meta: &CoordinatorMeta) -> Result<()>;

    /// Last saved schema, if any.
    fn load_schema(&self) -> Result<Option<GraphSchema>>;

    /// Replaces the saved schema.
    fn save_schema(&self, schema: &GraphSchema) -> Result<()>;
}

/// JSON files in one directory, replaced atomically through a temp file.
///
/// Writers are serialized so two saves never share the temp file.
#[derive(Debug)]
pub struct FileMetaStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileMetaStore {
    /// Opens (and creates) `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.dir.join(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| ShardError::Codec(format!("{}: {err}", path.display())))
    }

    fn write<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|err| ShardError::Codec(format!("{name}: {err}")))?;
        let path = self.dir.join(name);
        let tmp = path.with_extension("json.tmp");
        let _guard = self.write_lock.lock();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl MetaStore for FileMetaStore {
    fn load_meta(&self) -> Result<Option<CoordinatorMeta>> {
        self.read(SNAPSHOT_FILE)
    }

    fn save_meta(&self, meta: &CoordinatorMeta) -> Result<()> {
        self.write(SNAPSHOT_FILE, meta)
    }

    fn load_schema(&self) -> Result<Option<GraphSchema>> {
        self.read(SCHEMA_FILE)
    }

    fn save_schema(&self, schema: &GraphSchema) -> Result<()> {
        self.write(SCHEMA_FILE, schema)
    }
}

/// Volatile [`MetaStore`] for tests and single-process clusters.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    meta: Mutex<Option<CoordinatorMeta>>,
    schema: Mutex<Option<GraphSchema>>,
}

impl MetaStore for MemoryMetaStore {
    fn load_meta(&self) -> Result<Option<CoordinatorMeta>> {
        Ok(self.meta.lock().clone())
    }

    fn save_meta(&self, meta: &CoordinatorMeta) -> Result<()> {
        *self.meta.lock() = Some(meta.clone());
        Ok(())
    }

    fn load_schema(&self) -> Result<Option<GraphSchema>> {
        Ok(self.schema.lock().clone())
    }

    fn save_schema(&self, schema: &GraphSchema) -> Result<()> {
        *self.schema.lock() = Some(schema.clone());
        Ok(())
    }
}
