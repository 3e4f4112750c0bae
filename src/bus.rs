//! In-process message buses
//!
//! Bounded queues connect channel adapters to the orchestrator and the
//! orchestrator back to the channel manager. On overflow the oldest
//! unprocessed item is dropped and counted; adapters may additionally
//! apply backpressure upstream where the platform SDK allows it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::intents::OrchestratorIntent;
use crate::message::Message;

/// Outbound action paired with its originating channel
#[derive(Debug, Clone)]
pub struct OutboundItem {
    /// Channel tag the intent must be dispatched through
    pub channel: String,
    /// The intent to dispatch
    pub intent: OrchestratorIntent,
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    name: &'static str,
}

/// Bounded queue that drops the oldest item on overflow
pub struct BoundedBus<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BoundedBus<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Consuming half of a [`BoundedBus`]
pub struct BusReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> BoundedBus<T> {
    /// Create a bus with the given capacity; returns the publishing
    /// half and the receiver the consumer loop owns
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> (Self, BusReceiver<T>) {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            name,
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            BusReceiver { shared },
        )
    }

    /// Publish an item. When the queue is full the oldest unprocessed
    /// item is dropped and counted rather than blocking the producer.
    pub fn publish(&self, item: T) {
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if queue.len() >= self.shared.capacity {
                queue.pop_front();
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    bus = self.shared.name,
                    dropped,
                    "bus overflow, dropping oldest message"
                );
            }
            queue.push_back(item);
        }
        self.shared.notify.notify_one();
    }

    /// Total items dropped due to overflow
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl<T> BusReceiver<T> {
    /// Await the next item
    pub async fn recv(&mut self) -> T {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(item) = self.try_recv() {
                return item;
            }
            notified.await;
        }
    }

    /// Pop an item without waiting
    pub fn try_recv(&self) -> Option<T> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
    }

    /// Pending item count
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inbound bus carrying canonical messages from adapters
pub type InboundBus = BoundedBus<Message>;

/// Outbound bus carrying intents back to the channel manager
pub type OutboundBus = BoundedBus<OutboundItem>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Identity;

    #[tokio::test]
    async fn publish_and_receive() {
        let (bus, mut rx) = InboundBus::new("inbound", 4);
        bus.publish(Message::text("telegram", "c1", "m1", Identity::new("u"), "hi"));
        let msg = rx.recv().await;
        assert_eq!(msg.id, "m1");
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let (bus, mut rx) = InboundBus::new("inbound", 1);
        bus.publish(Message::text("telegram", "c1", "m1", Identity::new("u"), "a"));
        bus.publish(Message::text("telegram", "c1", "m2", Identity::new("u"), "b"));
        assert_eq!(bus.dropped(), 1);
        let msg = rx.recv().await;
        assert_eq!(msg.id, "m2");
    }
}
