use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::types::{crc32_of, Offset, PartitionId, QueueOffsets, Result, ShardError, SnapshotId};

const CHECKPOINT_MAGIC: [u8; 4] = *b"SGCP";
const CHECKPOINT_FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 32;
const CRC_LEN: usize = 4;

/// Progress a partition resumes from after a restart.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryState {
    /// Last committed snapshot watermark.
    pub watermark: SnapshotId,
    /// Last committed ddl watermark.
    pub ddl_watermark: SnapshotId,
    /// Last consumed offset per queue.
    pub queue_offsets: QueueOffsets,
}

impl RecoveryState {
    /// Empty state for a partition that has consumed nothing.
    pub fn fresh(queue_count: usize) -> Self {
        Self {
            watermark: 0,
            ddl_watermark: 0,
            queue_offsets: vec![None; queue_count],
        }
    }

    fn encode(&self, partition: PartitionId) -> Result<Vec<u8>> {
        let queue_count = u32::try_from(self.queue_offsets.len())
            .map_err(|_| ShardError::Invalid("too many queues for checkpoint"))?;
        let mut buf = Vec::with_capacity(HEADER_LEN + self.queue_offsets.len() * 8 + CRC_LEN);
        buf.extend_from_slice(&CHECKPOINT_MAGIC);
        buf.extend_from_slice(&CHECKPOINT_FORMAT_VERSION.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&partition.0.to_be_bytes());
        buf.extend_from_slice(&queue_count.to_be_bytes());
        buf.extend_from_slice(&self.watermark.to_be_bytes());
        buf.extend_from_slice(&self.ddl_watermark.to_be_bytes());
        for offset in &self.queue_offsets {
            // Zero is "nothing consumed"; real offsets are stored plus one.
            let stored = offset.map_or(0, |o| o + 1);
            buf.extend_from_slice(&stored.to_be_bytes());
        }
        let crc = crc32_of(&[&buf]);
        buf.extend_from_slice(&crc.to_be_bytes());
        Ok(buf)
    }

    fn decode(src: &[u8], partition: PartitionId) -> Result<Self> {
        if src.len() < HEADER_LEN + CRC_LEN {
            return Err(ShardError::Corruption("checkpoint truncated"));
        }
        if src[0..4] != CHECKPOINT_MAGIC {
            return Err(ShardError::Corruption("checkpoint magic mismatch"));
        }
        if read_u16(src, 4)? != CHECKPOINT_FORMAT_VERSION {
            return Err(ShardError::Corruption("checkpoint format version mismatch"));
        }
        if src[6..8] != [0, 0] {
            return Err(ShardError::Corruption("checkpoint reserved bytes non-zero"));
        }
        let body_len = src.len() - CRC_LEN;
        let stored_crc = read_u32(src, body_len)?;
        if crc32_of(&[&src[..body_len]]) != stored_crc {
            return Err(ShardError::Corruption("checkpoint crc mismatch"));
        }
        if read_u32(src, 8)? != partition.0 {
            return Err(ShardError::Corruption("checkpoint belongs to another partition"));
        }
        let queue_count = read_u32(src, 12)? as usize;
        if body_len != HEADER_LEN + queue_count * 8 {
            return Err(ShardError::Corruption("checkpoint length mismatch"));
        }
        let watermark = read_u64(src, 16)?;
        let ddl_watermark = read_u64(src, 24)?;
        let mut queue_offsets = Vec::with_capacity(queue_count);
        for index in 0..queue_count {
            let stored = read_u64(src, HEADER_LEN + index * 8)?;
            queue_offsets.push(stored.checked_sub(1));
        }
        Ok(Self {
            watermark,
            ddl_watermark,
            queue_offsets,
        })
    }
}

fn read_u16(src: &[u8], at: usize) -> Result<u16> {
    src.get(at..at + 2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_be_bytes)
        .ok_or(ShardError::Corruption("checkpoint field out of bounds"))
}

fn read_u32(src: &[u8], at: usize) -> Result<u32> {
    src.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or(ShardError::Corruption("checkpoint field out of bounds"))
}

fn read_u64(src: &[u8], at: usize) -> Result<Offset> {
    src.get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_be_bytes)
        .ok_or(ShardError::Corruption("checkpoint field out of bounds"))
}

/// Checkpoint file of one partition.
///
/// Writes go to a sibling temp file that is synced and renamed over the
/// previous checkpoint, so a crash leaves either the old or the new record.
#[derive(Debug)]
pub struct PartitionCheckpoint {
    partition: PartitionId,
    path: PathBuf,
}

impl PartitionCheckpoint {
    /// Checkpoint for `partition` inside `dir`.
    pub fn new(dir: &Path, partition: PartitionId) -> Self {
        Self {
            partition,
            path: dir.join(format!("partition-{partition}.ckpt")),
        }
    }

    /// Path of the checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the last persisted state, `None` if nothing was ever persisted.
    pub fn load(&self) -> Result<Option<RecoveryState>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let state = RecoveryState::decode(&bytes, self.partition)?;
        debug!(
            partition = %self.partition,
            watermark = state.watermark,
            ddl_watermark = state.ddl_watermark,
            "checkpoint.loaded"
        );
        Ok(Some(state))
    }

    /// Durably replaces the checkpoint with `state`.
    pub fn persist(&self, state: &RecoveryState) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let bytes = state.encode(self.partition)?;
        let tmp = self.path.with_extension("ckpt.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
