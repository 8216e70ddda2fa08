//! # Event Publisher
//!
//! Defines the publishing side of the event bus.

use crate::events::{BusEvent, EventFilter};
use crate::subscriber::{EventStream, EventSubscriber, Registry, Slot, Subscription};
use crate::DEFAULT_CHANNEL_CAPACITY;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Trait for publishing events to the bus.
#[async_trait]
pub trait EventPublisher<E: BusEvent>: Send + Sync {
    /// Publish an event to the bus.
    ///
    /// Waits while any interested subscriber's inbox is full.
    ///
    /// # Returns
    ///
    /// The number of subscribers that received the event.
    async fn publish(&self, event: E) -> usize;

    /// Get the total number of events published.
    fn events_published(&self) -> u64;
}

/// In-memory implementation of the event bus.
///
/// Every subscription gets its own bounded `tokio::sync::mpsc` queue. A
/// publisher fans an event out to each interested queue in turn, waiting for
/// room when one is full, so delivery is lossless and per-publisher ordered.
pub struct InMemoryEventBus<E: BusEvent> {
    /// Registered subscriptions.
    registry: Registry<E>,

    /// Total events published.
    events_published: AtomicU64,

    /// Inbox capacity per subscription.
    capacity: usize,
}

impl<E: BusEvent> InMemoryEventBus<E> {
    /// Create a new in-memory event bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new in-memory event bus with specified inbox capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Vec::new())),
            events_published: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to events matching a filter.
    ///
    /// Events published after this call returns are queued for the
    /// subscription, even if nobody is polling it yet.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter<E::Kind>) -> Subscription<E> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();

        self.registry.write().push(Slot {
            id,
            filter: filter.clone(),
            sender,
        });

        debug!(subscription = %id, kinds = ?filter.kinds, "New subscription created");

        Subscription::new(id, receiver, filter, Arc::downgrade(&self.registry))
    }

    /// Get a stream of events matching a filter.
    #[must_use]
    pub fn event_stream(&self, filter: EventFilter<E::Kind>) -> EventStream<E> {
        EventStream::new(self.subscribe(filter))
    }

    /// Get the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Get the per-subscription inbox capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<E: BusEvent> Default for InMemoryEventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: BusEvent> EventPublisher<E> for InMemoryEventBus<E> {
    async fn publish(&self, event: E) -> usize {
        let kind = event.kind();

        // Always increment counter (event was attempted)
        self.events_published.fetch_add(1, Ordering::Relaxed);

        let targets: Vec<mpsc::Sender<E>> = {
            let slots = self.registry.read();
            slots
                .iter()
                .filter(|slot| slot.filter.matches_kind(kind))
                .map(|slot| slot.sender.clone())
                .collect()
        };

        if targets.is_empty() {
            trace!(kind = ?kind, "Event has no interested subscribers");
            return 0;
        }

        let mut delivered = 0;
        for sender in targets {
            if sender.send(event.clone()).await.is_ok() {
                delivered += 1;
            } else {
                debug!(kind = ?kind, "Subscriber went away during publish");
            }
        }

        trace!(kind = ?kind, receivers = delivered, "Event published");
        delivered
    }

    fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }
}

impl<E: BusEvent> EventSubscriber<E> for InMemoryEventBus<E> {
    fn subscribe(&self, filter: EventFilter<E::Kind>) -> Subscription<E> {
        InMemoryEventBus::subscribe(self, filter)
    }
}
