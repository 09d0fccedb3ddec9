use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

use crate::types::Result;

/// Named background thread that can be joined with a deadline.
///
/// `std` has no timed join, so the thread signals completion over a channel
/// and [`Worker::join_timeout`] waits on that instead.
pub(crate) struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let (done_tx, done) = mpsc::channel();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            body();
            let _ = done_tx.send(());
        })?;
        Ok(Self {
            name,
            handle: Some(handle),
            done,
        })
    }

    /// Waits up to `timeout` for the thread to finish. On timeout the thread is
    /// detached and `false` is returned.
    pub(crate) fn join_timeout(mut self, timeout: Duration) -> bool {
        let finished = match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        };
        let Some(handle) = self.handle.take() else {
            return finished;
        };
        if !finished {
            warn!(worker = %self.name, timeout_ms = timeout.as_millis() as u64, "worker.join.timeout");
            return false;
        }
        if handle.join().is_err() {
            warn!(worker = %self.name, "worker.join.panicked");
        }
        true
    }
}
