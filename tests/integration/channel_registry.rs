use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use shardgraph::config::DiscoveryMode;
use shardgraph::rpc::{
    call_blocking, LocalTransport, RoleChannel, RoleChannelRegistry, RoleType, RpcRequest,
    RpcResponse, RpcService, Transport,
};
use shardgraph::ShardError;

const THREADS: usize = 16;

/// Transport that counts connects and is slow to open a channel.
struct SlowConnect {
    inner: LocalTransport,
    connects: AtomicUsize,
}

impl Transport for SlowConnect {
    fn connect(&self, role: RoleType, index: u32) -> shardgraph::Result<Arc<dyn RoleChannel>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(10));
        self.inner.connect(role, index)
    }
}

struct Counter {
    calls: AtomicUsize,
}

impl RpcService for Counter {
    fn handle(&self, request: RpcRequest) -> shardgraph::Result<RpcResponse> {
        match request {
            RpcRequest::AdvanceIngestSnapshotId { snapshot_id } => {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(RpcResponse::PreviousSnapshotId(snapshot_id - 1))
            }
            other => Err(ShardError::Unsupported(other.name())),
        }
    }
}

fn channel_addr(channel: &Arc<dyn RoleChannel>) -> usize {
    Arc::as_ptr(channel) as *const () as usize
}

#[test]
fn concurrent_first_use_opens_one_channel() {
    let transport = Arc::new(SlowConnect {
        inner: LocalTransport::new(2).unwrap(),
        connects: AtomicUsize::new(0),
    });
    let registry = Arc::new(RoleChannelRegistry::new(
        transport.clone(),
        DiscoveryMode::Dynamic,
        Duration::from_secs(1),
    ));
    registry.register_role(RoleType::Store, 4);

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                channel_addr(&registry.get_channel(RoleType::Store, 2).unwrap())
            })
        })
        .collect();
    let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    assert!(addrs.iter().all(|addr| *addr == addrs[0]));
    assert_eq!(registry.channel_count(), 1);
    registry.stop();
}

#[test]
fn lookups_outside_the_topology_fail() {
    let transport = Arc::new(LocalTransport::new(1).unwrap());
    let registry =
        RoleChannelRegistry::new(transport.clone(), DiscoveryMode::Static, Duration::from_secs(1));
    registry.register_role(RoleType::Frontend, 2);

    for (role, index) in [(RoleType::Coordinator, 0), (RoleType::Frontend, 2)] {
        match registry.get_channel(role, index) {
            Err(ShardError::NetworkConfig(_)) => {}
            Err(err) => panic!("unexpected error {err}"),
            Ok(_) => panic!("channel for {role}/{index}"),
        }
    }
    assert_eq!(transport.connect_count(), 0);
}

#[test]
fn calls_reach_the_bound_service() {
    let transport = Arc::new(LocalTransport::new(2).unwrap());
    let service = Arc::new(Counter {
        calls: AtomicUsize::new(0),
    });
    transport.register_service(RoleType::Ingestor, 0, service.clone());
    let registry =
        RoleChannelRegistry::new(transport.clone(), DiscoveryMode::Static, Duration::from_secs(1));
    registry.register_role(RoleType::Ingestor, 1);
    registry.start().unwrap();
    assert_eq!(transport.connect_count(), 1);

    let channel = registry.get_channel(RoleType::Ingestor, 0).unwrap();
    for snapshot_id in 1..=5 {
        let response = call_blocking(
            channel.as_ref(),
            RpcRequest::AdvanceIngestSnapshotId { snapshot_id },
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(response, RpcResponse::PreviousSnapshotId(snapshot_id - 1));
    }
    let unsupported = call_blocking(channel.as_ref(), RpcRequest::FetchSchema, Duration::from_secs(5));
    assert!(matches!(unsupported, Err(ShardError::Unsupported("FetchSchema"))));
    assert_eq!(service.calls.load(Ordering::SeqCst), 5);

    registry.stop();
    let closed = call_blocking(channel.as_ref(), RpcRequest::FetchSchema, Duration::from_secs(5));
    assert!(matches!(closed, Err(ShardError::ChannelClosed)));
    assert_eq!(transport.connect_count(), 1);
}
