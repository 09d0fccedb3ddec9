use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::types::{QueueId, Result, ShardError, SnapshotId};

use super::batch::WriteBatch;

/// K-way merge buffer in front of one storage partition.
///
/// Each input queue is single-writer and already ordered by snapshot id;
/// [`BatchMergeQueue::poll`] releases a batch only once every input has a
/// buffered head, then hands out the head with the smallest
/// `(snapshot_id, arrival)` pair. The output stream is therefore
/// non-decreasing in snapshot id. Every input buffer is bounded and
/// [`BatchMergeQueue::offer`] blocks while its buffer is full.
pub struct BatchMergeQueue {
    capacity: usize,
    state: Mutex<MergeState>,
    readable: Condvar,
    writable: Condvar,
}

struct MergeState {
    inputs: Vec<InputBuffer>,
    next_arrival: u64,
    buffered: usize,
    closed: bool,
    interrupts: u64,
}

#[derive(Default)]
struct InputBuffer {
    pending: VecDeque<Pending>,
    last_snapshot: Option<SnapshotId>,
}

struct Pending {
    arrival: u64,
    batch: WriteBatch,
}

impl BatchMergeQueue {
    /// Creates a merge queue with `queue_count` inputs, each buffering at most `capacity` batches.
    pub fn new(queue_count: usize, capacity: usize) -> Result<Self> {
        if queue_count == 0 {
            return Err(ShardError::Invalid("merge queue needs at least one input"));
        }
        if capacity == 0 {
            return Err(ShardError::Invalid("merge queue capacity must be positive"));
        }
        let inputs = (0..queue_count).map(|_| InputBuffer::default()).collect();
        Ok(Self {
            capacity,
            state: Mutex::new(MergeState {
                inputs,
                next_arrival: 0,
                buffered: 0,
                closed: false,
                interrupts: 0,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        })
    }

    /// Number of input queues.
    pub fn queue_count(&self) -> usize {
        self.state.lock().inputs.len()
    }

    /// Total batches currently buffered across all inputs.
    pub fn len(&self) -> usize {
        self.state.lock().buffered
    }

    /// Returns `true` when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffers `batch` on input `queue_id`, blocking while that input is full.
    ///
    /// Fails with [`ShardError::Shutdown`] once the queue is closed, and with
    /// [`ShardError::Invalid`] if the batch would move its input backwards.
    pub fn offer(&self, queue_id: QueueId, batch: WriteBatch) -> Result<()> {
        let mut state = self.state.lock();
        let index = queue_id.index();
        if index >= state.inputs.len() {
            return Err(ShardError::Invalid("queue id out of range"));
        }
        loop {
            if state.closed {
                return Err(ShardError::Shutdown);
            }
            if state.inputs[index].pending.len() < self.capacity {
                break;
            }
            self.writable.wait(&mut state);
        }
        let input = &mut state.inputs[index];
        if input
            .last_snapshot
            .is_some_and(|last| batch.snapshot_id < last)
        {
            return Err(ShardError::Invalid("batch snapshot regressed within queue"));
        }
        input.last_snapshot = Some(batch.snapshot_id);
        let arrival = state.next_arrival;
        state.next_arrival += 1;
        state.inputs[index].pending.push_back(Pending { arrival, batch });
        state.buffered += 1;
        self.readable.notify_one();
        Ok(())
    }

    /// Waits up to `timeout` for the next batch in merged order.
    ///
    /// Returns `Ok(None)` on timeout or when [`BatchMergeQueue::interrupt`]
    /// wakes the caller, and [`ShardError::Shutdown`] once closed.
    pub fn poll(&self, timeout: Duration) -> Result<Option<WriteBatch>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let interrupts = state.interrupts;
        loop {
            if state.closed {
                return Err(ShardError::Shutdown);
            }
            if let Some(batch) = Self::pop_min(&mut state) {
                self.writable.notify_all();
                return Ok(Some(batch));
            }
            if state.interrupts != interrupts {
                return Ok(None);
            }
            if self.readable.wait_until(&mut state, deadline).timed_out() {
                if state.closed {
                    return Err(ShardError::Shutdown);
                }
                let batch = Self::pop_min(&mut state);
                if batch.is_some() {
                    self.writable.notify_all();
                }
                return Ok(batch);
            }
        }
    }

    /// Wakes every blocked `poll` without delivering a batch.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupts = state.interrupts.wrapping_add(1);
        self.readable.notify_all();
    }

    /// Closes the queue: blocked and future `offer`/`poll` calls fail with `Shutdown`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        debug!(buffered = state.buffered, "merge_queue.closed");
        self.readable.notify_all();
        self.writable.notify_all();
    }

    fn pop_min(state: &mut MergeState) -> Option<WriteBatch> {
        let mut best: Option<(usize, SnapshotId, u64)> = None;
        for (index, input) in state.inputs.iter().enumerate() {
            let head = input.pending.front()?;
            let key = (head.batch.snapshot_id, head.arrival);
            match best {
                Some((_, snapshot, arrival)) if (snapshot, arrival) <= key => {}
                _ => best = Some((index, key.0, key.1)),
            }
        }
        let (index, _, _) = best?;
        let pending = state.inputs[index].pending.pop_front()?;
        state.buffered -= 1;
        Some(pending.batch)
    }
}
