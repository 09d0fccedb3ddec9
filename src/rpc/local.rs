use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, warn};

use crate::types::{Result, ShardError};

use super::{RoleChannel, RoleType, RpcCallback, RpcRequest, RpcService, Transport};

/// In-process [`Transport`] backed by a multi-threaded `tokio` runtime.
///
/// Services are looked up at call time, so a channel may be opened before
/// its service is bound. Handlers run on the runtime's blocking pool and
/// callbacks on its workers; neither ever runs on the caller's thread.
pub struct LocalTransport {
    inner: Arc<Inner>,
    runtime: Mutex<Option<Runtime>>,
    connects: AtomicUsize,
}

struct Inner {
    handle: Handle,
    services: RwLock<HashMap<(RoleType, u32), Arc<dyn RpcService>>>,
}

impl Inner {
    fn service(&self, role: RoleType, index: u32) -> Option<Arc<dyn RpcService>> {
        self.services.read().get(&(role, index)).cloned()
    }
}

impl LocalTransport {
    /// Starts a runtime with `worker_threads` workers.
    pub fn new(worker_threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("shardgraph-rpc")
            .enable_time()
            .build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                handle: runtime.handle().clone(),
                services: RwLock::new(HashMap::new()),
            }),
            runtime: Mutex::new(Some(runtime)),
            connects: AtomicUsize::new(0),
        })
    }

    /// Binds `service` to `(role, index)`, replacing any previous binding.
    pub fn register_service(&self, role: RoleType, index: u32, service: Arc<dyn RpcService>) {
        self.inner.services.write().insert((role, index), service);
        debug!(role = %role, index, "transport.service.bound");
    }

    /// Removes the binding of `(role, index)`.
    pub fn unregister_service(&self, role: RoleType, index: u32) {
        self.inner.services.write().remove(&(role, index));
    }

    /// Number of channels opened so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    /// Stops the runtime, waiting up to `timeout` for running tasks.
    pub fn shutdown(&self, timeout: Duration) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_timeout(timeout);
            debug!("transport.shutdown");
        }
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

impl Transport for LocalTransport {
    fn connect(&self, role: RoleType, index: u32) -> Result<Arc<dyn RoleChannel>> {
        self.connects.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(LocalChannel {
            role,
            index,
            inner: Arc::clone(&self.inner),
            in_flight: Arc::new(InFlight::default()),
        }))
    }
}

#[derive(Default)]
struct InFlightState {
    active: usize,
    closed: bool,
}

#[derive(Default)]
struct InFlight {
    state: Mutex<InFlightState>,
    drained: Condvar,
}

impl InFlight {
    fn begin(self: &Arc<Self>) -> Option<CallGuard> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.active += 1;
        Some(CallGuard(Arc::clone(self)))
    }

    fn close_and_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.closed = true;
        while state.active > 0 {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                return state.active == 0;
            }
        }
        true
    }
}

struct CallGuard(Arc<InFlight>);

impl Drop for CallGuard {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.active -= 1;
        if state.active == 0 {
            self.0.drained.notify_all();
        }
    }
}

struct LocalChannel {
    role: RoleType,
    index: u32,
    inner: Arc<Inner>,
    in_flight: Arc<InFlight>,
}

impl RoleChannel for LocalChannel {
    fn role(&self) -> RoleType {
        self.role
    }

    fn index(&self) -> u32 {
        self.index
    }

    fn call(&self, request: RpcRequest, done: RpcCallback) {
        let Some(guard) = self.in_flight.begin() else {
            self.inner
                .handle
                .spawn(async move { done(Err(ShardError::ChannelClosed)) });
            return;
        };
        let inner = Arc::clone(&self.inner);
        let (role, index) = (self.role, self.index);
        self.inner.handle.spawn(async move {
            let name = request.name();
            let result = match inner.service(role, index) {
                Some(service) => {
                    match tokio::task::spawn_blocking(move || service.handle(request)).await {
                        Ok(result) => result,
                        Err(err) => {
                            warn!(role = %role, index, request = name, error = %err, "transport.handler.failed");
                            Err(ShardError::Transport(format!(
                                "{role}/{index} {name} handler failed: {err}"
                            )))
                        }
                    }
                }
                None => Err(ShardError::Transport(format!(
                    "no service bound at {role}/{index}"
                ))),
            };
            done(result);
            drop(guard);
        });
    }

    fn shutdown(&self, timeout: Duration) -> bool {
        self.in_flight.close_and_wait(timeout)
    }
}
