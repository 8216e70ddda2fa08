//! # Event Subscriber
//!
//! Defines the subscription side of the event bus.

use crate::events::{BusEvent, EventFilter};
use parking_lot::RwLock;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::debug;
use uuid::Uuid;

/// Shared table of live subscriptions.
pub(crate) type Registry<E> = Arc<RwLock<Vec<Slot<E>>>>;

/// One registered inbox.
pub(crate) struct Slot<E: BusEvent> {
    pub(crate) id: Uuid,
    pub(crate) filter: EventFilter<E::Kind>,
    pub(crate) sender: mpsc::Sender<E>,
}

/// Errors from subscription operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The event bus was closed.
    #[error("Event bus closed")]
    Closed,
}

/// Trait for subscribing to events from the bus.
pub trait EventSubscriber<E: BusEvent>: Send + Sync {
    /// Subscribe to events matching a filter.
    fn subscribe(&self, filter: EventFilter<E::Kind>) -> Subscription<E>;
}

/// A subscription handle for receiving events.
///
/// When dropped, the inbox is unregistered from the bus.
pub struct Subscription<E: BusEvent> {
    id: Uuid,

    /// The inbox receiver.
    receiver: mpsc::Receiver<E>,

    /// Filter for this subscription.
    filter: EventFilter<E::Kind>,

    /// Back-reference to the bus registry (for cleanup).
    registry: Weak<RwLock<Vec<Slot<E>>>>,
}

impl<E: BusEvent> Subscription<E> {
    pub(crate) fn new(
        id: Uuid,
        receiver: mpsc::Receiver<E>,
        filter: EventFilter<E::Kind>,
        registry: Weak<RwLock<Vec<Slot<E>>>>,
    ) -> Self {
        Self {
            id,
            receiver,
            filter,
            registry,
        }
    }

    /// Receive the next event.
    ///
    /// # Returns
    ///
    /// - `Some(event)` - The next matching event
    /// - `None` - The bus was dropped
    pub async fn recv(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    /// Try to receive the next event without waiting.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(event))` - An event was queued
    /// - `Ok(None)` - The inbox is empty
    /// - `Err(SubscriptionError::Closed)` - The bus was dropped
    pub fn try_recv(&mut self) -> Result<Option<E>, SubscriptionError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(SubscriptionError::Closed),
        }
    }

    /// Poll the inbox.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<E>> {
        self.receiver.poll_recv(cx)
    }

    /// Get the filter for this subscription.
    #[must_use]
    pub fn filter(&self) -> &EventFilter<E::Kind> {
        &self.filter
    }

    /// Unique id of this subscription.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl<E: BusEvent> Drop for Subscription<E> {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        registry.write().retain(|slot| slot.id != self.id);
        debug!(subscription = %self.id, "Subscription dropped");
    }
}

/// A stream wrapper for subscriptions.
///
/// Implements `tokio_stream::Stream` for use with stream combinators.
pub struct EventStream<E: BusEvent> {
    subscription: Subscription<E>,
}

impl<E: BusEvent> EventStream<E> {
    /// Create a new event stream from a subscription.
    #[must_use]
    pub fn new(subscription: Subscription<E>) -> Self {
        Self { subscription }
    }

    /// Get the filter for this stream.
    #[must_use]
    pub fn filter(&self) -> &EventFilter<E::Kind> {
        self.subscription.filter()
    }
}

// Only a receiver and a filter live here; nothing is pinned structurally.
impl<E: BusEvent> Unpin for EventStream<E> {}

impl<E: BusEvent> Stream for EventStream<E> {
    type Item = E;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().subscription.poll_recv(cx)
    }
}
