use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use shardgraph::coordinator::DdlOutcome;
use shardgraph::ingest::{Operation, PropValue};
use shardgraph::schema::{DdlOperation, PropertyDef, PropertyType, VertexTypeDef};
use shardgraph::types::{QueueId, SnapshotId, VertexId};
use shardgraph::{LocalCluster, ShardConfig, ShardError};

fn config() -> ShardConfig {
    let mut cfg = ShardConfig::default();
    cfg.cluster.store_count = 2;
    cfg.cluster.queue_count = 2;
    cfg.cluster.frontend_count = 2;
    cfg.coordinator.write_snapshot_interval_ms = 10;
    cfg.coordinator.ddl_wait_timeout_ms = 5_000;
    cfg.applier.poll_timeout_ms = 5;
    cfg.applier.retry_backoff_ms = 1;
    cfg.rpc.worker_threads = 2;
    cfg
}

fn person_ddl() -> Vec<DdlOperation> {
    vec![DdlOperation::CreateVertexType(VertexTypeDef {
        label: "person".into(),
        properties: vec![PropertyDef::new("age", PropertyType::Int)],
    })]
}

fn person(id: u64) -> Vec<Operation> {
    vec![Operation::OverwriteVertex {
        label: "person".into(),
        id: VertexId(id),
        props: BTreeMap::from([("age".to_string(), PropValue::Int(20 + id as i64))]),
    }]
}

fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn writes_become_visible_on_every_role() {
    let cluster = LocalCluster::start(&config()).unwrap();

    let ddl_snapshot = match cluster
        .client()
        .submit_batch_ddl("req-1", "session-1", person_ddl())
        .unwrap()
    {
        DdlOutcome::Applied { snapshot_id } => snapshot_id,
        other => panic!("unexpected outcome {other:?}"),
    };
    let schema = cluster.client().fetch_schema().unwrap();
    assert!(schema.has_vertex_type("person"));
    assert_eq!(schema.version, ddl_snapshot);

    let mut last: SnapshotId = 0;
    for id in 0..20 {
        let (snapshot_id, _) = cluster.ingest().write(person(id)).unwrap();
        assert!(snapshot_id > ddl_snapshot);
        last = last.max(snapshot_id);
    }
    let visible = cluster
        .wait_for_query_snapshot(last, Duration::from_secs(5))
        .unwrap();
    assert!(visible.snapshot_id >= last);
    assert!(visible.ddl_snapshot_id >= ddl_snapshot);
    assert!(visible.ddl_snapshot_id <= visible.snapshot_id);

    let total: usize = (0..2)
        .map(|index| cluster.reader(index).unwrap().vertex_count(visible.snapshot_id))
        .sum();
    assert_eq!(total, 20);
    let owner = cluster.reader(7 % 2).unwrap();
    assert_eq!(
        owner
            .vertex("person", VertexId(7), visible.snapshot_id)
            .and_then(|props| props.get("age").cloned()),
        Some(PropValue::Int(27))
    );

    for index in 0..2 {
        let frontend = cluster.frontend(index).unwrap();
        wait_until(|| frontend.query_snapshot_id() >= visible.snapshot_id);
        assert_eq!(frontend.schema().version, ddl_snapshot);
    }
    wait_until(|| {
        cluster
            .notifier()
            .acks()
            .iter()
            .all(|ack| ack.snapshot_id >= visible.snapshot_id)
    });

    let tails = cluster
        .client()
        .get_tail_offsets(vec![QueueId(0), QueueId(1)])
        .unwrap();
    assert!(tails.iter().all(Option::is_some));
    let appended = cluster.ingest().queue_tails();
    assert!(tails.iter().zip(&appended).all(|(consumed, last)| consumed <= last));
    cluster.shutdown();
}

#[test]
fn conflicting_ddl_is_rejected_through_the_client() {
    let cluster = LocalCluster::start(&config()).unwrap();
    let applied = cluster
        .client()
        .submit_batch_ddl("req-1", "session-1", person_ddl())
        .unwrap();
    assert!(matches!(applied, DdlOutcome::Applied { .. }));

    let rejected = cluster
        .client()
        .submit_batch_ddl("req-2", "session-1", person_ddl())
        .unwrap();
    match rejected {
        DdlOutcome::Rejected { message } => assert!(message.contains("person")),
        other => panic!("unexpected outcome {other:?}"),
    }
    let replay = cluster
        .client()
        .submit_batch_ddl("req-1", "session-1", person_ddl())
        .unwrap();
    assert_eq!(replay, applied);
}

#[test]
fn query_snapshot_keeps_advancing_without_writes() {
    let cluster = LocalCluster::start(&config()).unwrap();
    let first = cluster
        .wait_for_query_snapshot(1, Duration::from_secs(5))
        .unwrap();
    let later = cluster
        .wait_for_query_snapshot(first.snapshot_id + 3, Duration::from_secs(5))
        .unwrap();
    assert!(later.snapshot_id > first.snapshot_id);
    assert!(cluster.snapshots().write_snapshot_id() > later.snapshot_id);
    for index in 0..2 {
        let partition = cluster.partition(index).unwrap();
        assert!(partition.watermark().snapshot_id >= later.snapshot_id);
    }
}

#[test]
fn unsupported_topology_is_refused() {
    let mut cfg = config();
    cfg.cluster.ingestor_count = 2;
    assert!(matches!(
        LocalCluster::start(&cfg),
        Err(ShardError::Invalid(_))
    ));
}

#[test]
fn empty_topology_is_refused() {
    let mut cfg = config();
    cfg.cluster.store_count = 0;
    assert!(matches!(
        LocalCluster::start(&cfg),
        Err(ShardError::Invalid(_))
    ));
}
