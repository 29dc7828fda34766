//! Bounded handoff between the source adapters and the broker publisher.
//!
//! Adapters never wait on the queue. When it is full the newest item takes
//! the place of an older one: an item of the same mapping is superseded if
//! one is queued, otherwise the oldest item overall is evicted. The displaced
//! item is returned to the caller so it can be accounted as dropped.

use crate::mapping::{MappingId, Qos};
use crate::transform::Value;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// One publish waiting for the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    /// Mapping the value belongs to
    pub mapping_id: MappingId,
    /// Mapping name, or id when unnamed
    pub mapping_name: String,
    /// Target topic
    pub topic: String,
    /// Delivery guarantee
    pub qos: Qos,
    /// Value to publish
    pub value: Value,
    /// Decimals used when rendering a scalar
    pub decimals: u32,
    /// Pipeline-wide sequence number
    pub seq: u64,
}

/// Result of [`PublishQueue::push`].
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Queued without displacing anything
    Queued,
    /// Queued in place of an older item of the same mapping
    Superseded(Outgoing),
    /// Queued after evicting the oldest item
    Evicted(Outgoing),
    /// Queue closed, item returned
    Closed(Outgoing),
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<Outgoing>,
    closed: bool,
}

/// Bounded multi-producer, single-consumer publish queue.
#[derive(Debug)]
pub struct PublishQueue {
    inner: Mutex<Inner>,
    ready: Notify,
    capacity: usize,
}

impl PublishQueue {
    /// Create a queue holding at most `capacity` items (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ready: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue an item without waiting.
    pub fn push(&self, item: Outgoing) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Closed(item);
            }

            let outcome = if inner.items.len() < self.capacity {
                PushOutcome::Queued
            } else if let Some(pos) = inner
                .items
                .iter()
                .position(|queued| queued.mapping_id == item.mapping_id)
            {
                match inner.items.remove(pos) {
                    Some(old) => PushOutcome::Superseded(old),
                    None => PushOutcome::Queued,
                }
            } else {
                match inner.items.pop_front() {
                    Some(old) => PushOutcome::Evicted(old),
                    None => PushOutcome::Queued,
                }
            };
            inner.items.push_back(item);
            outcome
        };
        self.ready.notify_one();
        outcome
    }

    /// Take the oldest item, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<Outgoing> {
        loop {
            let notified = self.ready.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take the oldest item if there is one.
    pub fn try_pop(&self) -> Option<Outgoing> {
        self.inner.lock().items.pop_front()
    }

    /// Refuse further pushes and wake the consumer.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.ready.notify_waiters();
        self.ready.notify_one();
    }

    /// Remove everything still queued.
    pub fn drain(&self) -> Vec<Outgoing> {
        self.inner.lock().items.drain(..).collect()
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    fn item(mapping: &str, seq: u64) -> Outgoing {
        Outgoing {
            mapping_id: mapping.into(),
            mapping_name: mapping.into(),
            topic: format!("t/{mapping}"),
            qos: Qos::AtLeastOnce,
            value: Value::Scalar(f64::from(u32::try_from(seq).unwrap())),
            decimals: 0,
            seq,
        }
    }

    #[test]
    fn fifo_order() {
        let queue = PublishQueue::new(4);
        assert_eq!(queue.push(item("a", 1)), PushOutcome::Queued);
        assert_eq!(queue.push(item("b", 2)), PushOutcome::Queued);
        assert_eq!(queue.try_pop().map(|i| i.seq), Some(1));
        assert_eq!(queue.try_pop().map(|i| i.seq), Some(2));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn overflow_supersedes_same_mapping() {
        let queue = PublishQueue::new(2);
        queue.push(item("a", 1));
        queue.push(item("b", 2));

        let outcome = queue.push(item("b", 3));
        assert!(matches!(outcome, PushOutcome::Superseded(old) if old.seq == 2));

        let order: Vec<u64> = std::iter::from_fn(|| queue.try_pop()).map(|i| i.seq).collect();
        assert_eq!(order, vec![1, 3]);
    }

    #[test]
    fn overflow_evicts_oldest_otherwise() {
        let queue = PublishQueue::new(2);
        queue.push(item("a", 1));
        queue.push(item("b", 2));

        let outcome = queue.push(item("c", 3));
        assert!(matches!(outcome, PushOutcome::Evicted(old) if old.seq == 1));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn closed_queue_rejects() {
        let queue = PublishQueue::new(2);
        queue.push(item("a", 1));
        queue.close();
        assert!(matches!(queue.push(item("a", 2)), PushOutcome::Closed(_)));
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_waits_for_push() {
        let queue = PublishQueue::new(2);
        let mut pop = task::spawn(queue.pop());
        assert_pending!(pop.poll());

        queue.push(item("a", 7));
        assert!(pop.is_woken());
        let popped = assert_ready!(pop.poll());
        assert_eq!(popped.map(|i| i.seq), Some(7));
    }

    #[test]
    fn pop_ends_after_close() {
        let queue = PublishQueue::new(2);
        let mut pop = task::spawn(queue.pop());
        assert_pending!(pop.poll());

        queue.close();
        assert!(pop.is_woken());
        assert_eq!(assert_ready!(pop.poll()), None);
    }
}
