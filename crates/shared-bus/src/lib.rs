//! # Shared Bus - Event Bus for Coordinator Services
//!
//! Publish/subscribe dispatcher used by every coordination service.
//!
//! ## Delivery Rules
//!
//! - **Interest by kind:** a subscriber registers the event kinds it handles;
//!   the bus only enqueues events whose kind matches.
//! - **Ordered, bounded inboxes:** each subscription owns one bounded queue;
//!   events from one publisher arrive in publish order.
//! - **Backpressure, never loss:** publishing to a full inbox waits until the
//!   subscriber makes room.
//! - **No direct calls:** services only talk through the bus.
//!
//! ```text
//! ┌──────────────┐                    ┌──────────────┐
//! │  Service A   │                    │  Service B   │
//! │              │    publish()       │   (inbox)    │
//! │              │ ──────┐            │              │
//! └──────────────┘       │            └──────────────┘
//!                        ▼                    ↑
//!                  ┌──────────────┐          │
//!                  │  Event Bus   │          │
//!                  │              │ ─────────┘
//!                  └──────────────┘  subscribe(kinds)
//! ```
//!
//! The bus is generic over the event type: anything implementing
//! [`BusEvent`] can flow through it.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod events;
pub mod publisher;
pub mod subscriber;

// Re-export main types
pub use events::{BusEvent, EventFilter};
pub use publisher::{EventPublisher, InMemoryEventBus};
pub use subscriber::{EventStream, EventSubscriber, Subscription, SubscriptionError};

/// Maximum events to buffer per subscriber before backpressure.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;
