//! Named broadcast queues shared by all pipelines of one application context.
//!
//! Each named queue keeps one [`BoundedQueue`] per subscriber. `publish`
//! copies the message into every buffer that exists at the time of the call;
//! there is no history, so late subscribers only see later messages.
//!
//! A full subscriber buffer only costs that subscriber its copy: the failure
//! is logged and counted and delivery continues with the remaining buffers.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::message::MessageWrapper;
use crate::pipeline::queue::BoundedQueue;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

/// Identifier of a subscriber buffer within one named queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

pub type Buffer = Arc<BoundedQueue<MessageWrapper>>;

struct Subscribers {
    buffers: BTreeMap<SubscriptionId, Buffer>,
    next_id: u64,
}

struct FanoutQueue {
    name: String,
    subscribers: RwLock<Subscribers>,
}

/// Shared handle to one named queue.
#[derive(Clone)]
pub struct QueueHandle(Arc<FanoutQueue>);

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.0
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .buffers
            .len()
    }

    #[cfg(test)]
    pub(crate) fn seed_next_id(&self, next: u64) {
        self.0
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .next_id = next;
    }
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("name", &self.0.name)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// A subscriber's delivery buffer.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub buffer: Buffer,
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Process-wide directory of named fan-out queues.
#[derive(Default)]
pub struct FanoutRegistry {
    queues: RwLock<HashMap<String, QueueHandle>>,
}

impl FanoutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a queue by name, creating it on first use.
    pub fn get_or_create(&self, name: &str) -> QueueHandle {
        if let Some(handle) = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return handle.clone();
        }

        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        queues
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!("Creating fan-out queue '{}'", name);
                QueueHandle(Arc::new(FanoutQueue {
                    name: name.to_string(),
                    subscribers: RwLock::new(Subscribers {
                        buffers: BTreeMap::new(),
                        next_id: 0,
                    }),
                }))
            })
            .clone()
    }

    /// Allocate a new delivery buffer on `handle`.
    pub fn subscribe(&self, handle: &QueueHandle, capacity: usize) -> PipelineResult<Subscription> {
        let mut subs = handle
            .0
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let id = SubscriptionId(subs.next_id);
        subs.next_id = subs.next_id.checked_add(1).ok_or_else(|| {
            PipelineError::ResourceExhausted(format!(
                "subscriber ids exhausted on queue '{}'",
                handle.name()
            ))
        })?;

        let buffer = Arc::new(BoundedQueue::new(capacity));
        subs.buffers.insert(id, buffer.clone());
        tracing::debug!("Subscribed {} to fan-out queue '{}'", id, handle.name());
        Ok(Subscription { id, buffer })
    }

    /// Remove a delivery buffer. Unknown ids are ignored.
    pub fn unsubscribe(&self, handle: &QueueHandle, id: SubscriptionId) {
        let removed = handle
            .0
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .buffers
            .remove(&id);
        if let Some(buffer) = removed {
            buffer.shutdown();
            tracing::debug!("Unsubscribed {} from fan-out queue '{}'", id, handle.name());
        }
    }

    /// Deliver a copy of `wrapper` to every current subscriber.
    pub fn publish(&self, handle: &QueueHandle, wrapper: &MessageWrapper) -> PublishReport {
        let subs = handle
            .0
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut report = PublishReport::default();
        for (id, buffer) in &subs.buffers {
            match buffer.push(wrapper.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        "Fan-out queue '{}': dropping copy for {}: {}",
                        handle.name(),
                        id,
                        e
                    );
                }
            }
        }
        report
    }

    /// Publish `wrapper` to the queue called `name`.
    pub fn redirect(&self, wrapper: &MessageWrapper, name: &str) -> PublishReport {
        let handle = self.get_or_create(name);
        self.publish(&handle, wrapper)
    }

    /// Names of all known queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for FanoutRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutRegistry")
            .field("queues", &self.queue_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::message::Message;

    fn wrapper(text: &str) -> MessageWrapper {
        MessageWrapper::new(Message::raw("t", text.as_bytes().to_vec()))
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let reg = FanoutRegistry::new();
        let a = reg.get_or_create("shared");
        let b = reg.get_or_create("shared");
        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(reg.queue_names(), vec!["shared".to_string()]);
    }

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let reg = FanoutRegistry::new();
        let q = reg.get_or_create("q");
        let s1 = reg.subscribe(&q, 0).unwrap();
        let s2 = reg.subscribe(&q, 0).unwrap();
        assert_ne!(s1.id, s2.id);

        let report = reg.publish(&q, &wrapper("hello"));
        assert_eq!(report, PublishReport { delivered: 2, failed: 0 });
        assert_eq!(s1.buffer.try_pop().unwrap().working.as_bytes().unwrap(), b"hello");
        assert_eq!(s2.buffer.try_pop().unwrap().working.as_bytes().unwrap(), b"hello");
    }

    #[test]
    fn test_late_subscriber_sees_no_history() {
        let reg = FanoutRegistry::new();
        let q = reg.get_or_create("q");
        let report = reg.redirect(&wrapper("early"), "q");
        assert_eq!(report.delivered, 0);

        let late = reg.subscribe(&q, 0).unwrap();
        assert!(late.buffer.try_pop().is_none());
    }

    #[test]
    fn test_full_buffer_does_not_block_others() {
        let reg = FanoutRegistry::new();
        let q = reg.get_or_create("q");
        let slow = reg.subscribe(&q, 1).unwrap();
        let fast = reg.subscribe(&q, 0).unwrap();
        let other = reg.subscribe(&q, 0).unwrap();

        reg.publish(&q, &wrapper("one"));
        let report = reg.publish(&q, &wrapper("two"));

        assert_eq!(report, PublishReport { delivered: 2, failed: 1 });
        assert_eq!(slow.buffer.len(), 1);
        assert_eq!(fast.buffer.len(), 2);
        assert_eq!(other.buffer.len(), 2);
    }

    #[test]
    fn test_unsubscribe_removes_buffer() {
        let reg = FanoutRegistry::new();
        let q = reg.get_or_create("q");
        let s1 = reg.subscribe(&q, 0).unwrap();
        let s2 = reg.subscribe(&q, 0).unwrap();
        reg.unsubscribe(&q, s1.id);
        assert_eq!(q.subscriber_count(), 1);
        assert!(s1.buffer.is_shutdown());

        reg.publish(&q, &wrapper("x"));
        assert!(s1.buffer.try_pop().is_none());
        assert_eq!(s2.buffer.len(), 1);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let reg = FanoutRegistry::new();
        let q = reg.get_or_create("q");
        let s1 = reg.subscribe(&q, 0).unwrap();
        reg.unsubscribe(&q, s1.id);
        let s2 = reg.subscribe(&q, 0).unwrap();
        assert!(s2.id > s1.id);
    }

    #[test]
    fn test_id_exhaustion() {
        let reg = FanoutRegistry::new();
        let q = reg.get_or_create("q");
        q.seed_next_id(u64::MAX);
        let err = reg.subscribe(&q, 0).unwrap_err();
        assert!(matches!(err, PipelineError::ResourceExhausted(_)));
        assert_eq!(q.subscriber_count(), 0);
    }
}
