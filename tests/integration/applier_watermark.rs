use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use shardgraph::config::ApplierConfig;
use shardgraph::coordinator::{MemoryMetaStore, SnapshotManager};
use shardgraph::ingest::{BatchMergeQueue, Operation, PropValue, Properties, WriteBatch};
use shardgraph::schema::{DdlOperation, VertexTypeDef};
use shardgraph::store::{GraphReader, MemoryGraphStore, RecoveryState, WatermarkInfo, WriteApplier};
use shardgraph::types::{Offset, PartitionId, QueueId, SnapshotId, VertexId};

struct Harness {
    queue: Arc<BatchMergeQueue>,
    applier: WriteApplier,
    manager: Arc<SnapshotManager>,
    reader: GraphReader,
}

fn harness(queues: usize) -> Harness {
    let cfg = ApplierConfig {
        poll_timeout_ms: 5,
        retry_backoff_ms: 1,
        stop_timeout_ms: 1_000,
        ..ApplierConfig::default()
    };
    let queue = Arc::new(BatchMergeQueue::new(queues, 16).unwrap());
    let manager = Arc::new(SnapshotManager::new(
        1,
        queues,
        Arc::new(MemoryMetaStore::default()),
    ));
    let store = MemoryGraphStore::new(PartitionId(0), 1).unwrap();
    let reader = store.reader();
    let applier = WriteApplier::new(
        PartitionId(0),
        &cfg,
        Arc::clone(&queue),
        Box::new(store),
        manager.clone(),
    );
    applier.init(RecoveryState::fresh(queues)).unwrap();
    applier.start().unwrap();
    Harness {
        queue,
        applier,
        manager,
        reader,
    }
}

fn vertex(queue: u32, snapshot: SnapshotId, offset: Offset, id: u64) -> WriteBatch {
    let props = Properties::from([("n".to_string(), PropValue::Int(id as i64))]);
    WriteBatch::new(
        QueueId(queue),
        snapshot,
        offset,
        vec![Operation::OverwriteVertex {
            label: "person".into(),
            id: VertexId(id),
            props,
        }],
    )
}

fn marker(queue: u32, snapshot: SnapshotId, offset: Offset) -> WriteBatch {
    WriteBatch::marker(QueueId(queue), snapshot, offset)
}

fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn watermark_moves_only_when_a_later_snapshot_is_consumed() {
    let h = harness(3);
    h.queue.offer(QueueId(0), vertex(0, 1, 0, 1)).unwrap();
    h.queue.offer(QueueId(1), vertex(1, 1, 0, 2)).unwrap();
    h.queue.offer(QueueId(2), marker(2, 1, 0)).unwrap();
    h.queue.offer(QueueId(0), vertex(0, 2, 1, 3)).unwrap();
    h.queue.offer(QueueId(1), marker(1, 2, 1)).unwrap();

    // Snapshot 1 is fully consumed, but queue 2 has no head, so nothing
    // from snapshot 2 has left the merge queue.
    wait_until(|| h.applier.consumed_offsets() == vec![Some(0), Some(0), Some(0)]);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(h.applier.watermark(), WatermarkInfo::default());
    assert_eq!(h.reader.vertex_count(1), 2);

    h.queue.offer(QueueId(2), marker(2, 2, 1)).unwrap();
    wait_until(|| h.applier.watermark().snapshot_id == 1);
    assert_eq!(h.applier.watermark().ddl_snapshot_id, 0);

    let visible = h
        .manager
        .wait_for_query_snapshot(1, Duration::from_secs(5))
        .unwrap();
    assert_eq!(visible.snapshot_id, 1);
    wait_until(|| h.applier.last_committed() == 1);
    h.applier.stop();
}

#[test]
fn ddl_watermark_follows_snapshot_watermark() {
    let h = harness(1);
    let ddl = WriteBatch::new(
        QueueId(0),
        2,
        1,
        vec![Operation::Ddl(DdlOperation::CreateVertexType(VertexTypeDef {
            label: "person".into(),
            properties: Vec::new(),
        }))],
    )
    .ddl();
    h.queue.offer(QueueId(0), marker(0, 1, 0)).unwrap();
    h.queue.offer(QueueId(0), ddl).unwrap();

    wait_until(|| h.applier.watermark().snapshot_id == 1);
    assert_eq!(h.applier.watermark().ddl_snapshot_id, 0);

    h.queue.offer(QueueId(0), marker(0, 3, 2)).unwrap();
    wait_until(|| h.applier.watermark().snapshot_id == 2);
    let watermark = h.applier.watermark();
    assert_eq!(watermark.ddl_snapshot_id, 2);
    assert!(watermark.ddl_snapshot_id <= watermark.snapshot_id);
    assert_eq!(h.reader.schema().version, 2);

    let visible = h
        .manager
        .wait_for_query_snapshot(2, Duration::from_secs(5))
        .unwrap();
    assert_eq!(visible.ddl_snapshot_id, 2);
    h.applier.stop();
}

#[test]
fn watermark_never_decreases_across_many_snapshots() {
    let h = harness(2);
    let mut offsets = [0u64; 2];
    for snapshot in 1..=20u64 {
        for q in 0..2u32 {
            let offset = offsets[q as usize];
            offsets[q as usize] += 1;
            let batch = if snapshot % 3 == 0 {
                marker(q, snapshot, offset)
            } else {
                vertex(q, snapshot, offset, snapshot * 10 + u64::from(q))
            };
            h.queue.offer(QueueId(q), batch).unwrap();
        }
    }
    let mut last = 0;
    wait_until(|| {
        let current = h.applier.watermark().snapshot_id;
        assert!(current >= last, "watermark went from {last} to {current}");
        last = current;
        current == 19
    });
    h.applier.stop();
}
