//! Durable decision point.
//!
//! The first decision recorded on a transaction is the only one ever written;
//! a duplicate or conflicting request is dropped. Nothing moves on to phase
//! two until the journal has accepted the write.
//!
//! The write runs on its own task; the inbox only records the decision on the
//! aggregate, so a slow journal holds up one transaction, not all of them.

use std::sync::Arc;

use async_trait::async_trait;
use shared_bus::EventPublisher;
use shared_types::Decision;
use tracing::{debug, error, info, warn};

use super::{BranchExecutor, Service};
use crate::domain::{Phase, Transaction};
use crate::events::{EventBus, EventKind, TxEvent};
use crate::metrics;
use crate::ports::outbound::Journal;

pub struct DecisionLogger {
    bus: Arc<EventBus>,
    journal: Arc<dyn Journal>,
    executor: BranchExecutor,
}

impl DecisionLogger {
    pub fn new(bus: Arc<EventBus>, journal: Arc<dyn Journal>, executor: BranchExecutor) -> Self {
        Self {
            bus,
            journal,
            executor,
        }
    }

    fn log(&self, transaction: Arc<Transaction>, decision: Decision) {
        let xid = transaction.xid().clone();
        if !transaction.record_decision(decision) {
            match transaction.decision() {
                Some(existing) if existing == decision => {
                    debug!(xid = %xid, %decision, "Decision already logged")
                }
                existing => {
                    warn!(xid = %xid, %decision, ?existing, "Conflicting decision ignored")
                }
            }
            return;
        }

        let bus = self.bus.clone();
        let journal = self.journal.clone();
        let executor = self.executor.clone();
        tokio::spawn(async move {
            let event = write(journal.as_ref(), &executor, transaction, decision).await;
            bus.publish(event).await;
        });
    }
}

async fn write(
    journal: &dyn Journal,
    executor: &BranchExecutor,
    transaction: Arc<Transaction>,
    decision: Decision,
) -> TxEvent {
    let xid = transaction.xid().clone();
    let records = transaction.branch_records();
    match journal.log_decision(&records, decision).await {
        Ok(()) => {
            info!(xid = %xid, %decision, branches = records.len(), "Decision logged");
            metrics::record_decision(decision);
            match decision {
                Decision::Commit => TxEvent::CommitDecisionLogged { transaction },
                Decision::Rollback => TxEvent::RollbackDecisionLogged { transaction },
            }
        }
        Err(err) => {
            error!(xid = %xid, %decision, error = %err, "Decision could not be logged");
            if transaction.is_subordinate() {
                executor.report_failed(
                    &xid,
                    &transaction.superior_server_id(),
                    Phase::from(decision),
                );
            }
            let reason = err.to_string();
            match decision {
                Decision::Commit => TxEvent::TwoPcFailed {
                    transaction,
                    reason,
                },
                Decision::Rollback => TxEvent::RollbackFailed {
                    transaction,
                    reason,
                },
            }
        }
    }
}

#[async_trait]
impl Service for DecisionLogger {
    fn name(&self) -> &'static str {
        "decision-logger"
    }

    fn interests(&self) -> Vec<EventKind> {
        vec![EventKind::LogCommitDecision, EventKind::LogRollbackDecision]
    }

    async fn handle(&mut self, event: TxEvent) {
        match event {
            TxEvent::LogCommitDecision { transaction } => self.log(transaction, Decision::Commit),
            TxEvent::LogRollbackDecision { transaction } => {
                self.log(transaction, Decision::Rollback)
            }
            _ => {}
        }
    }
}
