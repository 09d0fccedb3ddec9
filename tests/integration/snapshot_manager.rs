use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use shardgraph::coordinator::{
    CoordinatorMeta, FileMetaStore, MemoryMetaStore, MetaStore, QuerySnapshot,
    QuerySnapshotListener, SnapshotManager,
};
use shardgraph::schema::GraphSchema;
use shardgraph::types::{PartitionId, QueueId, Result, SnapshotId};

#[derive(Default)]
struct Trace {
    events: Mutex<Vec<(&'static str, SnapshotId)>>,
}

impl QuerySnapshotListener for Trace {
    fn on_query_snapshot(&self, snapshot: QuerySnapshot) {
        self.events.lock().push(("query", snapshot.snapshot_id));
    }
}

/// Memory store whose save of one query snapshot stalls.
struct StallingMetaStore {
    inner: MemoryMetaStore,
    stall_at: SnapshotId,
}

impl MetaStore for StallingMetaStore {
    fn load_meta(&self) -> Result<Option<CoordinatorMeta>> {
        self.inner.load_meta()
    }

    fn save_meta(&self, meta: &CoordinatorMeta) -> Result<()> {
        if meta.query_snapshot_id == self.stall_at {
            thread::sleep(Duration::from_millis(200));
        }
        self.inner.save_meta(meta)
    }

    fn load_schema(&self) -> Result<Option<GraphSchema>> {
        self.inner.load_schema()
    }

    fn save_schema(&self, schema: &GraphSchema) -> Result<()> {
        self.inner.save_schema(schema)
    }
}

fn manager(partitions: usize) -> SnapshotManager {
    SnapshotManager::new(partitions, 2, Arc::new(MemoryMetaStore::default()))
}

#[test]
fn query_snapshot_is_minimum_across_partitions() {
    let manager = manager(2);
    manager.commit(PartitionId(0), 10, 4, vec![Some(20), Some(21)]);
    manager.commit(PartitionId(1), 7, 6, vec![Some(15), Some(30)]);
    let query = manager.query_snapshot();
    assert_eq!(query.snapshot_id, 7);
    assert_eq!(query.ddl_snapshot_id, 4);

    manager.commit(PartitionId(1), 12, 6, vec![Some(16), Some(31)]);
    assert_eq!(manager.query_snapshot().snapshot_id, 10);
    assert_eq!(manager.global_snapshot(), Some(10));
    assert_eq!(
        manager.get_tail_offsets(&[QueueId(0), QueueId(1)]),
        vec![Some(16), Some(21)]
    );
}

#[test]
fn stale_and_duplicate_reports_never_lower_progress() {
    let manager = manager(2);
    manager.commit(PartitionId(0), 10, 0, vec![Some(5), None]);
    manager.commit(PartitionId(1), 9, 0, vec![Some(4), None]);
    assert_eq!(manager.query_snapshot().snapshot_id, 9);

    manager.commit(PartitionId(1), 3, 0, vec![Some(1), None]);
    manager.commit(PartitionId(0), 10, 0, vec![Some(5), None]);
    assert_eq!(manager.query_snapshot().snapshot_id, 9);
    let record = manager.commit_record(PartitionId(1)).unwrap();
    assert_eq!(record.watermark, 9);
    assert_eq!(record.queue_offsets, vec![Some(4), None]);
}

#[test]
fn one_shot_listeners_run_before_query_listeners() {
    let manager = manager(1);
    let trace = Arc::new(Trace::default());
    manager.add_query_listener(trace.clone());
    let pending = Arc::clone(&trace);
    manager.add_snapshot_listener(
        4,
        Box::new(move |q| pending.events.lock().push(("pending", q.snapshot_id))),
    );
    manager.commit(PartitionId(0), 2, 0, vec![None, None]);
    manager.commit(PartitionId(0), 5, 0, vec![None, None]);
    assert_eq!(
        trace.events.lock().as_slice(),
        &[("query", 2), ("pending", 5), ("query", 5)]
    );
}

#[test]
fn concurrent_reports_publish_a_monotone_sequence() {
    let manager = Arc::new(manager(4));
    let trace = Arc::new(Trace::default());
    manager.add_query_listener(trace.clone());

    let reporters: Vec<_> = (0..4u32)
        .map(|partition| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                for watermark in 1..=200u64 {
                    manager.commit(
                        PartitionId(partition),
                        watermark,
                        0,
                        vec![Some(watermark), Some(watermark)],
                    );
                }
            })
        })
        .collect();
    for reporter in reporters {
        reporter.join().unwrap();
    }

    assert_eq!(manager.query_snapshot().snapshot_id, 200);
    let published: Vec<SnapshotId> = trace.events.lock().iter().map(|(_, s)| *s).collect();
    assert!(published.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(published.last(), Some(&200));
}

#[test]
fn waiters_wake_when_target_is_reached() {
    let manager = Arc::new(manager(1));
    let waiter = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.wait_for_query_snapshot(6, Duration::from_secs(5)))
    };
    thread::sleep(Duration::from_millis(20));
    manager.commit(PartitionId(0), 3, 0, vec![None, None]);
    manager.commit(PartitionId(0), 8, 0, vec![None, None]);
    let reached = waiter.join().unwrap().unwrap();
    assert_eq!(reached.snapshot_id, 8);
}

#[test]
fn restart_from_files_resumes_above_query_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    {
        let meta: Arc<dyn MetaStore> = Arc::new(FileMetaStore::open(dir.path()).unwrap());
        let manager = SnapshotManager::new(1, 2, meta);
        manager.start().unwrap();
        for _ in 0..3 {
            manager.increase_write_snapshot_id();
        }
        manager.commit(PartitionId(0), 2, 1, vec![Some(7), Some(9)]);
    }

    let meta: Arc<dyn MetaStore> = Arc::new(FileMetaStore::open(dir.path()).unwrap());
    let saved = meta.load_meta().unwrap().unwrap();
    assert_eq!(saved.queue_offsets, vec![Some(7), Some(9)]);

    let manager = SnapshotManager::new(1, 2, meta);
    manager.start().unwrap();
    assert_eq!(manager.query_snapshot().snapshot_id, 2);
    assert_eq!(manager.write_snapshot_id(), 3);
    assert_eq!(manager.increase_write_snapshot_id(), 4);
}

#[test]
fn slow_save_never_overwrites_a_later_snapshot() {
    let meta = Arc::new(StallingMetaStore {
        inner: MemoryMetaStore::default(),
        stall_at: 5,
    });
    let manager = Arc::new(SnapshotManager::new(2, 2, meta.clone()));
    manager.commit(PartitionId(1), 10, 0, vec![None, None]);

    let slow = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.commit(PartitionId(0), 5, 0, vec![None, None]))
    };
    while manager.query_snapshot().snapshot_id < 5 {
        thread::sleep(Duration::from_millis(1));
    }
    manager.commit(PartitionId(0), 7, 0, vec![None, None]);
    slow.join().unwrap();

    assert_eq!(manager.query_snapshot().snapshot_id, 7);
    assert_eq!(meta.load_meta().unwrap().unwrap().query_snapshot_id, 7);

    let restarted = SnapshotManager::new(2, 2, meta);
    restarted.start().unwrap();
    assert_eq!(restarted.query_snapshot().snapshot_id, 7);
}

#[test]
fn concurrent_reports_persist_the_last_published_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let meta: Arc<dyn MetaStore> = Arc::new(FileMetaStore::open(dir.path()).unwrap());
    let manager = Arc::new(SnapshotManager::new(4, 2, Arc::clone(&meta)));
    let reporters: Vec<_> = (0..4u32)
        .map(|partition| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                for watermark in 1..=50u64 {
                    manager.commit(PartitionId(partition), watermark, 0, vec![None, None]);
                }
            })
        })
        .collect();
    for reporter in reporters {
        reporter.join().unwrap();
    }

    assert_eq!(manager.query_snapshot().snapshot_id, 50);
    assert_eq!(meta.load_meta().unwrap().unwrap().query_snapshot_id, 50);
}
