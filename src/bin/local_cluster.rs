//! Runs every role of a shardgraph deployment in one process and drives a
//! short write workload through it.
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shardgraph::coordinator::DdlOutcome;
use shardgraph::ingest::{Operation, PropValue};
use shardgraph::schema::{DdlOperation, PropertyDef, PropertyType, VertexTypeDef};
use shardgraph::types::{QueueId, VertexId};
use shardgraph::{LocalCluster, ShardConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "local-cluster",
    version,
    about = "Single-process shardgraph cluster"
)]
struct Cli {
    #[arg(long, value_name = "FILE", env = "SHARDGRAPH_CONFIG", help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 100, help = "Vertex writes to issue")]
    writes: u32,

    #[arg(long, default_value_t = 7, help = "Seed for generated vertex ids")]
    seed: u64,

    #[arg(long, default_value_t = 10_000, help = "How long to wait for writes to become visible (ms)")]
    wait_ms: u64,

    #[arg(long, help = "Keep the cluster running until Ctrl-C")]
    hold: bool,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let cfg = match &cli.config {
        Some(path) => ShardConfig::load(path)?,
        None => ShardConfig::default(),
    };
    let cluster = LocalCluster::start(&cfg)?;

    let ddl = vec![DdlOperation::CreateVertexType(VertexTypeDef {
        label: "person".into(),
        properties: vec![
            PropertyDef::new("name", PropertyType::Str),
            PropertyDef::new("age", PropertyType::Int),
        ],
    })];
    match cluster.client().submit_batch_ddl("local-cluster-1", "local-cluster", ddl)? {
        DdlOutcome::Applied { snapshot_id } => println!("schema applied at snapshot {snapshot_id}"),
        DdlOutcome::Rejected { message } => println!("schema rejected: {message}"),
    }

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let mut last_snapshot = 0;
    for n in 0..cli.writes {
        let id = VertexId(rng.gen_range(0..u64::from(cli.writes.max(1)) * 4));
        let mut props = BTreeMap::new();
        props.insert("name".to_string(), PropValue::Str(format!("person-{n}")));
        props.insert("age".to_string(), PropValue::Int(rng.gen_range(18..90)));
        let (snapshot_id, _) = cluster.ingest().write(vec![Operation::OverwriteVertex {
            label: "person".into(),
            id,
            props,
        }])?;
        last_snapshot = last_snapshot.max(snapshot_id);
    }
    info!(writes = cli.writes, last_snapshot, "local_cluster.writes.done");

    let visible = cluster.wait_for_query_snapshot(last_snapshot, Duration::from_millis(cli.wait_ms))?;
    println!(
        "query snapshot {} (ddl {}), write snapshot {}",
        visible.snapshot_id,
        visible.ddl_snapshot_id,
        cluster.snapshots().write_snapshot_id()
    );
    if let Some(frontend) = cluster.frontend(0) {
        println!(
            "frontend 0 at snapshot {}, schema version {}",
            frontend.query_snapshot_id(),
            frontend.schema().version
        );
    }
    let queues: Vec<QueueId> = (0..cluster.ingest().queue_count() as u32).map(QueueId).collect();
    let consumed = cluster.client().get_tail_offsets(queues)?;
    for (queue, (consumed, appended)) in consumed
        .iter()
        .zip(cluster.ingest().queue_tails())
        .enumerate()
    {
        println!("queue {queue}: consumed through {consumed:?}, appended through {appended:?}");
    }
    let mut index = 0;
    while let Some(reader) = cluster.reader(index) {
        println!(
            "partition {index}: {} vertices, {} batches applied",
            reader.vertex_count(visible.snapshot_id),
            reader.applied_batches()
        );
        index += 1;
    }

    if cli.hold {
        println!("running; press Ctrl-C to stop");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(tokio::signal::ctrl_c())?;
    }
    cluster.shutdown();
    Ok(())
}
