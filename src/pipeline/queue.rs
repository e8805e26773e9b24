//! Thread-safe FIFO used for every inter-thread handoff in a pipeline.
//!
//! `BoundedQueue` is a `Mutex<VecDeque>` guarded by a `Condvar`. A positive
//! capacity makes `push` fail with [`PipelineError::Overflow`] instead of
//! blocking the producer. `shutdown` turns the queue non-blocking for good:
//! blocked consumers wake up, drain what is left and then see `None`.
//!
//! The runtime creates a fresh set of queues for every run, so a queue never
//! needs to leave shutdown mode.

use crate::pipeline::error::{PipelineError, PipelineResult};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct QueueState<T> {
    items: VecDeque<T>,
    shutdown: bool,
    total_pushed: u64,
    total_popped: u64,
    total_rejected: u64,
}

/// FIFO with optional capacity bound and a one-way shutdown mode.
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    capacity: usize,
}

/// Counters for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub len: usize,
    pub pushed: u64,
    pub popped: u64,
    pub rejected: u64,
}

impl<T> BoundedQueue<T> {
    /// Create a queue. A capacity of `0` means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                shutdown: false,
                total_pushed: 0,
                total_popped: 0,
                total_rejected: 0,
            }),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Create an unbounded queue.
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured capacity (`0` = unbounded).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue an item and wake one waiter.
    pub fn push(&self, item: T) -> PipelineResult<()> {
        let mut state = self.lock();
        if self.capacity > 0 && state.items.len() >= self.capacity {
            state.total_rejected += 1;
            return Err(PipelineError::Overflow {
                capacity: self.capacity,
            });
        }
        state.items.push_back(item);
        state.total_pushed += 1;
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Block until an item is available or the queue is shut down.
    ///
    /// Returns `None` only when the queue is both empty and shut down.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        while state.items.is_empty() && !state.shutdown {
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Self::take_front(&mut state)
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let state = self.lock();
        let (mut state, _) = self
            .not_empty
            .wait_timeout_while(state, timeout, |s| s.items.is_empty() && !s.shutdown)
            .unwrap_or_else(PoisonError::into_inner);
        Self::take_front(&mut state)
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.lock();
        Self::take_front(&mut state)
    }

    /// Remove and return everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.lock();
        let items: Vec<T> = state.items.drain(..).collect();
        state.total_popped += items.len() as u64;
        items
    }

    fn take_front(state: &mut QueueState<T>) -> Option<T> {
        let item = state.items.pop_front();
        if item.is_some() {
            state.total_popped += 1;
        }
        item
    }

    /// Switch to non-blocking mode and wake every waiter. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutdown = true;
        drop(state);
        self.not_empty.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            len: state.items.len(),
            pushed: state.total_pushed,
            popped: state.total_popped,
            rejected: state.total_rejected,
        }
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

/// Latch + condition variable the process loop sleeps on.
///
/// `notify` sets the latch before waking, so a notification that arrives
/// before `wait` is never lost.
#[derive(Debug, Default)]
pub struct WakeSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latch and wake the waiter.
    pub fn notify(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        drop(pending);
        self.cond.notify_all();
    }

    /// Block until the latch is set, then clear it.
    pub fn wait(&self) {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pending = self
            .cond
            .wait_while(pending, |p| !*p)
            .unwrap_or_else(PoisonError::into_inner);
        *pending = false;
    }

    /// Block until the latch is set or `timeout` elapses. Returns whether it was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut pending, _) = self
            .cond
            .wait_timeout_while(pending, timeout, |p| !*p)
            .unwrap_or_else(PoisonError::into_inner);
        let was_set = *pending;
        *pending = false;
        was_set
    }
}
