//! Rendezvous between local signals and superior orders on a subordinate.
//!
//! The local side (the user's commit request, or the local vote) and the
//! superior's order travel on different paths and may arrive in any order.
//! Each waiter keeps two maps keyed by xid and fires once both hold the same
//! xid. A rollback order replaces any other buffered order, so it always wins.
//! Firing hands the order's sender to the transaction as its superior.
//!
//! Orders whose local signal never shows up are dropped one transaction
//! timeout after they arrived.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shared_bus::EventPublisher;
use shared_types::Xid;
use tracing::{debug, info, warn};

use super::{with_terminal, Service};
use crate::domain::Transaction;
use crate::events::{EventBus, EventKind, TxEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Order {
    Prepare,
    Commit,
    Rollback,
}

/// An order and the server that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Received {
    order: Order,
    superior: String,
}

impl Received {
    fn new(order: Order, superior: String) -> Self {
        Self { order, superior }
    }
}

/// The two halves of a rendezvous.
struct Rendezvous<L> {
    local: HashMap<Xid, L>,
    orders: HashMap<Xid, (Received, u64)>,
}

impl<L> Rendezvous<L> {
    fn new() -> Self {
        Self {
            local: HashMap::new(),
            orders: HashMap::new(),
        }
    }

    fn on_local(&mut self, xid: &Xid, signal: L) -> Option<(L, Received)> {
        if self.local.contains_key(xid) {
            return None;
        }
        match self.orders.remove(xid) {
            Some((received, _)) => Some((signal, received)),
            None => {
                self.local.insert(xid.clone(), signal);
                None
            }
        }
    }

    fn on_order(&mut self, xid: &Xid, received: Received, now: u64) -> Option<(L, Received)> {
        if let Some(signal) = self.local.remove(xid) {
            return Some((signal, received));
        }
        let rollback = received.order == Order::Rollback;
        let buffered = self
            .orders
            .entry(xid.clone())
            .or_insert_with(|| (received.clone(), now));
        if rollback {
            buffered.0 = received;
        }
        None
    }

    /// Drop orders received before `now - max_age`.
    fn prune(&mut self, now: u64, max_age: Duration) -> usize {
        let before = self.orders.len();
        let max_age = max_age.as_millis() as u64;
        self.orders
            .retain(|_, (_, received)| now.saturating_sub(*received) < max_age);
        before - self.orders.len()
    }

    fn forget(&mut self, xid: &Xid) {
        self.local.remove(xid);
        self.orders.remove(xid);
    }

    #[cfg(test)]
    fn buffered_orders(&self) -> usize {
        self.orders.len()
    }
}

// =============================================================================
// PREPARE ORDER
// =============================================================================

/// Joins the local commit (or rollback) request with the superior's
/// prepare (or rollback) order.
pub struct PrepareOrderWaiter {
    bus: Arc<EventBus>,
    order_ttl: Duration,
    rendezvous: Rendezvous<Arc<Transaction>>,
}

impl PrepareOrderWaiter {
    pub fn new(bus: Arc<EventBus>, order_ttl: Duration) -> Self {
        Self {
            bus,
            order_ttl,
            rendezvous: Rendezvous::new(),
        }
    }

    async fn fire(&self, transaction: Arc<Transaction>, received: Received) {
        transaction.set_superior(&received.superior);
        let event = match received.order {
            Order::Rollback => {
                info!(xid = %transaction.xid(), "Rollback ordered before prepare");
                transaction.set_rollback_ordered();
                TxEvent::LogRollbackDecision { transaction }
            }
            _ => {
                debug!(xid = %transaction.xid(), "Prepare order matched");
                TxEvent::SubordinatePrepareRequested { transaction }
            }
        };
        self.bus.publish(event).await;
    }
}

#[async_trait]
impl Service for PrepareOrderWaiter {
    fn name(&self) -> &'static str {
        "prepare-order-waiter"
    }

    fn interests(&self) -> Vec<EventKind> {
        with_terminal(vec![
            EventKind::CommitRequested,
            EventKind::RollbackRequested,
            EventKind::PrepareOrder,
            EventKind::RollbackOrder,
            EventKind::TimerTick,
        ])
    }

    async fn handle(&mut self, event: TxEvent) {
        let now = shared_types::current_time_millis();
        let fired = match event {
            TxEvent::CommitRequested { transaction }
            | TxEvent::RollbackRequested { transaction }
                if transaction.is_subordinate() =>
            {
                let xid = transaction.xid().clone();
                self.rendezvous.on_local(&xid, transaction)
            }
            TxEvent::PrepareOrder { xid, superior } => {
                let received = Received::new(Order::Prepare, superior);
                self.rendezvous.on_order(&xid, received, now)
            }
            TxEvent::RollbackOrder { xid, superior } => {
                let received = Received::new(Order::Rollback, superior);
                self.rendezvous.on_order(&xid, received, now)
            }
            TxEvent::TimerTick { now } => {
                let dropped = self.rendezvous.prune(now, self.order_ttl);
                if dropped > 0 {
                    debug!(dropped, "Stale prepare orders dropped");
                }
                None
            }
            other => {
                if let Some(transaction) = other.terminal_transaction() {
                    self.rendezvous.forget(transaction.xid());
                }
                None
            }
        };
        if let Some((transaction, received)) = fired {
            self.fire(transaction, received).await;
        }
    }
}

// =============================================================================
// COMMIT ORDER
// =============================================================================

/// Joins the subordinate's reported vote with the superior's commit (or
/// rollback) order.
pub struct CommitOrderWaiter {
    bus: Arc<EventBus>,
    order_ttl: Duration,
    rendezvous: Rendezvous<(Arc<Transaction>, bool)>,
}

impl CommitOrderWaiter {
    pub fn new(bus: Arc<EventBus>, order_ttl: Duration) -> Self {
        Self {
            bus,
            order_ttl,
            rendezvous: Rendezvous::new(),
        }
    }

    async fn fire(&self, transaction: Arc<Transaction>, readied: bool, received: Received) {
        transaction.set_superior(&received.superior);
        let event = match received.order {
            Order::Commit if readied => {
                info!(xid = %transaction.xid(), "Commit ordered");
                TxEvent::LogCommitDecision { transaction }
            }
            Order::Commit => {
                warn!(xid = %transaction.xid(), "Commit ordered after a failed vote, rolling back");
                TxEvent::LogRollbackDecision { transaction }
            }
            _ => {
                info!(xid = %transaction.xid(), "Rollback ordered");
                transaction.set_rollback_ordered();
                TxEvent::LogRollbackDecision { transaction }
            }
        };
        self.bus.publish(event).await;
    }
}

#[async_trait]
impl Service for CommitOrderWaiter {
    fn name(&self) -> &'static str {
        "commit-order-waiter"
    }

    fn interests(&self) -> Vec<EventKind> {
        with_terminal(vec![
            EventKind::PrepareReported,
            EventKind::CommitOrder,
            EventKind::RollbackOrder,
            EventKind::TimerTick,
        ])
    }

    async fn handle(&mut self, event: TxEvent) {
        let now = shared_types::current_time_millis();
        let fired = match event {
            TxEvent::PrepareReported {
                transaction,
                readied,
            } => {
                let xid = transaction.xid().clone();
                self.rendezvous.on_local(&xid, (transaction, readied))
            }
            TxEvent::CommitOrder { xid, superior } => {
                let received = Received::new(Order::Commit, superior);
                self.rendezvous.on_order(&xid, received, now)
            }
            TxEvent::RollbackOrder { xid, superior } => {
                let received = Received::new(Order::Rollback, superior);
                self.rendezvous.on_order(&xid, received, now)
            }
            TxEvent::TimerTick { now } => {
                let dropped = self.rendezvous.prune(now, self.order_ttl);
                if dropped > 0 {
                    debug!(dropped, "Stale commit orders dropped");
                }
                None
            }
            other => {
                if let Some(transaction) = other.terminal_transaction() {
                    self.rendezvous.forget(transaction.xid());
                }
                None
            }
        };
        if let Some(((transaction, readied), received)) = fired {
            self.fire(transaction, readied, received).await;
        }
    }
}
