use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use shardgraph::config::ApplierConfig;
use shardgraph::coordinator::{MemoryMetaStore, SnapshotManager};
use shardgraph::ingest::{
    default_metrics, IngestService, MemoryQueueLog, Operation, PropValue, QueueLog, WriteBatch,
};
use shardgraph::schema::DdlOperation;
use shardgraph::store::{GraphStore, PartitionCheckpoint, RecoveryState, StorePartition};
use shardgraph::types::{Offset, PartitionId, QueueId, SnapshotId, VertexId};
use shardgraph::ShardError;

type Applied = Arc<Mutex<Vec<(QueueId, Offset)>>>;

/// Storage that only remembers which batches it was handed.
struct RecordingStore {
    applied: Applied,
}

impl GraphStore for RecordingStore {
    fn apply(&mut self, batch: &WriteBatch) -> shardgraph::Result<()> {
        self.applied.lock().push((batch.queue_id, batch.offset));
        Ok(())
    }
}

fn cfg(dir: &std::path::Path) -> ApplierConfig {
    ApplierConfig {
        poll_timeout_ms: 5,
        retry_backoff_ms: 1,
        stop_timeout_ms: 1_000,
        checkpoint_dir: Some(dir.to_path_buf()),
        ..ApplierConfig::default()
    }
}

fn logs(count: u32) -> (Vec<Arc<MemoryQueueLog>>, Vec<Arc<dyn QueueLog>>) {
    let logs: Vec<Arc<MemoryQueueLog>> = (0..count)
        .map(|q| Arc::new(MemoryQueueLog::new(QueueId(q))))
        .collect();
    let dyn_logs = logs
        .iter()
        .map(|log| Arc::clone(log) as Arc<dyn QueueLog>)
        .collect();
    (logs, dyn_logs)
}

fn put(id: u64) -> Vec<Operation> {
    vec![Operation::OverwriteVertex {
        label: "person".into(),
        id: VertexId(id),
        props: BTreeMap::from([("n".to_string(), PropValue::Int(id as i64))]),
    }]
}

fn manager(queues: usize) -> Arc<SnapshotManager> {
    Arc::new(SnapshotManager::new(
        1,
        queues,
        Arc::new(MemoryMetaStore::default()),
    ))
}

fn open(
    dir: &std::path::Path,
    logs: &[Arc<dyn QueueLog>],
    applied: &Applied,
    committer: &Arc<SnapshotManager>,
) -> StorePartition {
    StorePartition::open(
        PartitionId(0),
        &cfg(dir),
        logs.to_vec(),
        Box::new(RecordingStore {
            applied: Arc::clone(applied),
        }),
        committer.clone(),
        default_metrics(),
    )
    .unwrap()
}

fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn restart_resumes_after_checkpointed_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let (raw, logs) = logs(2);
    for (offset, snapshot) in [10, 20, 30, 40, 50].into_iter().enumerate() {
        raw[0].append(snapshot, put(offset as u64), false).unwrap();
    }
    for (offset, snapshot) in [25, 45, 50].into_iter().enumerate() {
        raw[1].append(snapshot, put(100 + offset as u64), false).unwrap();
    }
    PartitionCheckpoint::new(dir.path(), PartitionId(0))
        .persist(&RecoveryState {
            watermark: 50,
            ddl_watermark: 0,
            queue_offsets: vec![Some(4), Some(2)],
        })
        .unwrap();
    raw[0].append(51, put(6), false).unwrap();
    raw[1].append(51, put(106), false).unwrap();
    for log in &raw {
        log.append(52, Vec::new(), false).unwrap();
    }

    let applied = Applied::default();
    let committer = manager(2);
    let mut partition = open(dir.path(), &logs, &applied, &committer);
    assert_eq!(partition.recovery().map(|r| r.watermark), Some(50));
    partition.start().unwrap();
    assert!(partition.watermark().snapshot_id >= 50);

    wait_until(|| partition.watermark().snapshot_id == 51);
    let query = committer
        .wait_for_query_snapshot(51, Duration::from_secs(5))
        .unwrap();
    assert_eq!(query.snapshot_id, 51);
    partition.stop();

    let mut seen = applied.lock().clone();
    seen.sort();
    assert_eq!(seen, vec![(QueueId(0), 5), (QueueId(1), 3)]);

    let saved = PartitionCheckpoint::new(dir.path(), PartitionId(0))
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(saved.watermark, 51);
    assert!(saved.queue_offsets[0] >= Some(5));
    assert!(saved.queue_offsets[1] >= Some(3));
}

#[test]
fn ingest_restart_never_applies_a_batch_twice() {
    let dir = tempfile::tempdir().unwrap();
    let (_raw, logs) = logs(2);
    let ingest = IngestService::new(logs.clone()).unwrap();
    let applied = Applied::default();
    let mut stamp: SnapshotId = 1;
    ingest.advance_ingest_snapshot_id(stamp).unwrap();

    let mut written = 0usize;
    let mut write_round = |ingest: &IngestService, stamp: &mut SnapshotId, base: u64| {
        for round in 0..5u64 {
            for id in 0..4u64 {
                ingest.write(put(base + round * 10 + id)).unwrap();
                written += 1;
            }
            *stamp += 1;
            ingest.advance_ingest_snapshot_id(*stamp).unwrap();
        }
        *stamp - 1
    };

    let first_committer = manager(2);
    let mut partition = open(dir.path(), &logs, &applied, &first_committer);
    partition.start().unwrap();
    let target = write_round(&ingest, &mut stamp, 0);
    wait_until(|| partition.applier().last_committed() >= target);
    partition.stop();
    drop(partition);

    let second_committer = manager(2);
    let mut partition = open(dir.path(), &logs, &applied, &second_committer);
    let recovered = partition.recovery().cloned().unwrap();
    assert!(recovered.watermark >= target);
    partition.start().unwrap();
    let target = write_round(&ingest, &mut stamp, 1_000);
    wait_until(|| partition.applier().last_committed() >= target);
    partition.stop();

    let applied = applied.lock();
    let unique: HashSet<_> = applied.iter().copied().collect();
    assert_eq!(unique.len(), applied.len(), "a batch was applied twice");
    assert_eq!(applied.len(), written);
}

#[test]
fn ddl_past_the_checkpoint_is_redelivered_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (raw, logs) = logs(1);
    raw[0].append(1, put(1), false).unwrap();
    let drop_ghost = vec![Operation::Ddl(DdlOperation::DropVertexType {
        label: "ghost".into(),
    })];
    raw[0].append(2, drop_ghost, true).unwrap();

    let applied = Applied::default();
    let mut partition = open(dir.path(), &logs, &applied, &manager(1));
    partition.start().unwrap();
    wait_until(|| {
        partition.applier().last_committed() >= 1
            && partition.applier().consumed_offsets() == vec![Some(1)]
    });
    partition.stop();
    drop(partition);

    let saved = PartitionCheckpoint::new(dir.path(), PartitionId(0))
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(saved.watermark, 1);
    assert_eq!(saved.ddl_watermark, 0);
    assert_eq!(saved.queue_offsets, vec![Some(0)]);

    raw[0].append(3, Vec::new(), false).unwrap();
    let mut partition = open(dir.path(), &logs, &applied, &manager(1));
    partition.start().unwrap();
    wait_until(|| partition.watermark().snapshot_id == 2);
    assert_eq!(partition.watermark().ddl_snapshot_id, 2);
    partition.stop();
    assert_eq!(
        applied.lock().as_slice(),
        &[(QueueId(0), 0), (QueueId(0), 1), (QueueId(0), 1)]
    );
}

#[test]
fn corrupt_checkpoint_refuses_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let (_raw, logs) = logs(1);
    let checkpoint = PartitionCheckpoint::new(dir.path(), PartitionId(0));
    checkpoint
        .persist(&RecoveryState {
            watermark: 9,
            ddl_watermark: 3,
            queue_offsets: vec![Some(12)],
        })
        .unwrap();
    let mut bytes = std::fs::read(checkpoint.path()).unwrap();
    bytes[18] ^= 0xff;
    std::fs::write(checkpoint.path(), bytes).unwrap();

    let result = StorePartition::open(
        PartitionId(0),
        &cfg(dir.path()),
        logs,
        Box::new(RecordingStore {
            applied: Applied::default(),
        }),
        manager(1),
        default_metrics(),
    );
    assert!(matches!(result, Err(ShardError::Corruption(_))));
}
