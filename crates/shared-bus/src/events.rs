//! # Bus Events
//!
//! The contract an event type must satisfy to travel on the bus, and the
//! kind-based filter subscribers register with.

use std::fmt::Debug;
use std::hash::Hash;

/// An event that can be published on the bus.
///
/// Every event maps to a cheap, copyable kind tag. Subscriptions are keyed by
/// kind, so a service can declare its interests without seeing payloads.
pub trait BusEvent: Clone + Debug + Send + Sync + 'static {
    /// Discriminant used for subscription filtering.
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// Kind of this event.
    fn kind(&self) -> Self::Kind;
}

/// Filter for subscribing to specific event kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter<K> {
    /// Kinds to include. Empty means all kinds.
    pub kinds: Vec<K>,
}

impl<K> Default for EventFilter<K> {
    fn default() -> Self {
        Self { kinds: Vec::new() }
    }
}

impl<K: Copy + Eq> EventFilter<K> {
    /// Create a filter that accepts all events.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Create a filter for specific kinds.
    #[must_use]
    pub fn kinds(kinds: Vec<K>) -> Self {
        Self { kinds }
    }

    /// Check if a kind passes this filter.
    #[must_use]
    pub fn matches_kind(&self, kind: K) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }

    /// Check if an event passes this filter.
    #[must_use]
    pub fn matches<E>(&self, event: &E) -> bool
    where
        E: BusEvent<Kind = K>,
    {
        self.matches_kind(event.kind())
    }
}
