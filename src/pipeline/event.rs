//! Timer events delivered back to the process loop.
//!
//! Stages that need to re-evaluate after a time window (the throttle in
//! delay mode) call [`EventScheduler::schedule`]. A detached timer thread
//! sleeps for the delay, pushes a [`StageEvent`] onto the run's event queue
//! and wakes the process loop, so the loop itself never sleeps on a stage's
//! behalf.

use crate::pipeline::queue::{BoundedQueue, WakeSignal};
use std::sync::Arc;
use std::time::Duration;

/// Wake token addressed to one stage of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageEvent {
    /// Index of the stage that scheduled the event.
    pub stage_index: usize,
    /// Opaque value chosen by the stage.
    pub token: u64,
}

/// Handle used by stages to schedule one-shot events.
#[derive(Clone)]
pub struct EventScheduler {
    events: Arc<BoundedQueue<StageEvent>>,
    signal: Option<Arc<WakeSignal>>,
}

impl EventScheduler {
    /// Scheduler bound to a running pipeline's event queue and wake signal.
    pub fn new(events: Arc<BoundedQueue<StageEvent>>, signal: Arc<WakeSignal>) -> Self {
        Self {
            events,
            signal: Some(signal),
        }
    }

    /// Scheduler with a private queue and nobody to wake.
    ///
    /// Used when a chain is driven directly; events pile up in
    /// [`pending`](Self::pending) until the caller hands them to the chain.
    pub fn detached() -> Self {
        Self {
            events: Arc::new(BoundedQueue::unbounded()),
            signal: None,
        }
    }

    /// Deliver `event` after `delay`. Returns immediately.
    pub fn schedule(&self, delay: Duration, event: StageEvent) {
        let events = self.events.clone();
        let signal = self.signal.clone();
        let spawned = std::thread::Builder::new()
            .name("stage-timer".into())
            .spawn(move || {
                std::thread::sleep(delay);
                if let Err(e) = events.push(event) {
                    tracing::warn!("Dropping timer event for stage {}: {}", event.stage_index, e);
                    return;
                }
                if let Some(signal) = signal {
                    signal.notify();
                }
            });
        if let Err(e) = spawned {
            tracing::error!("Failed to spawn timer thread: {}", e);
        }
    }

    /// Queue the scheduled events land in.
    pub fn pending(&self) -> &BoundedQueue<StageEvent> {
        &self.events
    }
}

impl Default for EventScheduler {
    fn default() -> Self {
        Self::detached()
    }
}

impl std::fmt::Debug for EventScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventScheduler")
            .field("pending", &self.events.len())
            .field("attached", &self.signal.is_some())
            .finish()
    }
}
