//! Deadline supervision.
//!
//! A transaction is watched from the moment a commit or rollback request is
//! accepted. Each tick times out whatever is past its deadline; a terminal
//! outcome stops the watch instead. Timing out does not cancel calls already
//! issued to branches.

use std::sync::Arc;

use async_trait::async_trait;
use shared_bus::EventPublisher;
use tracing::{debug, warn};

use super::Service;
use crate::domain::Tracker;
use crate::events::{EventBus, EventKind, TxEvent};
use crate::metrics;

pub struct TimerService {
    bus: Arc<EventBus>,
    tracker: Tracker,
}

impl TimerService {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            tracker: Tracker::new(),
        }
    }

    async fn sweep(&mut self, now: u64) {
        for transaction in self.tracker.expired(now) {
            self.tracker.untrack(transaction.xid());
            warn!(xid = %transaction.xid(), "Transaction timed out");
            metrics::record_timeout();
            self.bus
                .publish(TxEvent::TransactionTimedOut { transaction })
                .await;
        }
    }
}

#[async_trait]
impl Service for TimerService {
    fn name(&self) -> &'static str {
        "timer"
    }

    fn interests(&self) -> Vec<EventKind> {
        vec![
            EventKind::CommitRequested,
            EventKind::RollbackRequested,
            EventKind::TimerTick,
            EventKind::TwoPcDone,
            EventKind::TwoPcFailed,
            EventKind::RollbackDone,
            EventKind::RollbackFailed,
        ]
    }

    async fn handle(&mut self, event: TxEvent) {
        match event {
            TxEvent::CommitRequested { transaction }
            | TxEvent::RollbackRequested { transaction } => {
                self.tracker.track(&transaction);
            }
            TxEvent::TimerTick { now } => self.sweep(now).await,
            other => {
                let Some(transaction) = other.terminal_transaction() else {
                    return;
                };
                let xid = transaction.xid().clone();
                if self.tracker.untrack(&xid).is_some() {
                    debug!(xid = %xid, "Timer cancelled");
                    self.bus.publish(TxEvent::TimerCancelled { xid }).await;
                }
            }
        }
    }
}
