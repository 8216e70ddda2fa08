//! Result delivery and recovery triggers.
//!
//! Watches every transaction the user handed to commit or rollback. The first
//! terminal event untracks it, closes it and puts exactly one result into the
//! caller's future. The oldest watched transaction also bounds recovery: only
//! decisions older than its creation time are considered dangling.

use std::sync::Arc;

use async_trait::async_trait;
use shared_bus::EventPublisher;
use shared_types::current_time_millis;
use tracing::{debug, info};

use super::{with_terminal, Service};
use crate::domain::{Tracker, TransactionResult};
use crate::error::TransactionError;
use crate::events::{EventBus, EventKind, TxEvent};
use crate::metrics;

pub struct ManagerService {
    bus: Arc<EventBus>,
    in_flight: Tracker,
}

impl ManagerService {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            in_flight: Tracker::new(),
        }
    }

    /// Creation time of the oldest in-flight transaction, or now.
    fn inflight_cutoff(&self) -> u64 {
        self.in_flight
            .oldest_creation_time()
            .unwrap_or_else(current_time_millis)
    }

    fn resolve(&mut self, event: &TxEvent) {
        let (transaction, result, outcome): (_, TransactionResult, _) = match event {
            TxEvent::TwoPcDone { transaction } => (transaction, Ok(true), "committed"),
            TxEvent::RollbackDone { transaction } => (transaction, Ok(false), "rolled_back"),
            TxEvent::TwoPcFailed {
                transaction,
                reason,
            } => (
                transaction,
                Err(TransactionError::Commit(reason.clone())),
                "commit_failed",
            ),
            TxEvent::RollbackFailed {
                transaction,
                reason,
            } => (
                transaction,
                Err(TransactionError::Rollback(reason.clone())),
                "rollback_failed",
            ),
            TxEvent::TransactionTimedOut { transaction } => {
                (transaction, Err(TransactionError::Timeout), "timed_out")
            }
            _ => return,
        };

        if self.in_flight.untrack(transaction.xid()).is_none() {
            debug!(xid = %transaction.xid(), outcome, "Outcome for untracked transaction ignored");
            return;
        }
        transaction.close();
        if transaction.deliver(result) {
            info!(xid = %transaction.xid(), outcome, "Result delivered");
            metrics::record_outcome(outcome);
        }
    }
}

#[async_trait]
impl Service for ManagerService {
    fn name(&self) -> &'static str {
        "manager"
    }

    fn interests(&self) -> Vec<EventKind> {
        with_terminal(vec![
            EventKind::CommitRequested,
            EventKind::RollbackRequested,
            EventKind::StartRecovery,
            EventKind::RetryReceived,
        ])
    }

    async fn handle(&mut self, event: TxEvent) {
        match event {
            TxEvent::CommitRequested { transaction }
            | TxEvent::RollbackRequested { transaction } => {
                self.in_flight.track(&transaction);
            }
            TxEvent::StartRecovery => {
                let inflight_cutoff = self.inflight_cutoff();
                self.bus
                    .publish(TxEvent::RecoveryRequested { inflight_cutoff })
                    .await;
            }
            TxEvent::RetryReceived { server_id } => {
                let inflight_cutoff = self.inflight_cutoff();
                debug!(peer = %server_id, "Peer asked for its decisions");
                self.bus
                    .publish(TxEvent::RedeliverDecisions {
                        server_id,
                        inflight_cutoff,
                    })
                    .await;
            }
            other => self.resolve(&other),
        }
    }
}
