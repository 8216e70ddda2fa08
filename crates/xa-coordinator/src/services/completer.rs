//! Final journal write and the subordinate's `done` report.
//!
//! Like the decision write, the completion write runs off the inbox.

use std::sync::Arc;

use async_trait::async_trait;
use shared_bus::EventPublisher;
use shared_types::Decision;
use tracing::{error, info};

use super::{BranchExecutor, Service};
use crate::domain::{Phase, Transaction};
use crate::events::{EventBus, EventKind, TxEvent};
use crate::ports::outbound::Journal;

pub struct Completer {
    bus: Arc<EventBus>,
    journal: Arc<dyn Journal>,
    executor: BranchExecutor,
}

impl Completer {
    pub fn new(bus: Arc<EventBus>, journal: Arc<dyn Journal>, executor: BranchExecutor) -> Self {
        Self {
            bus,
            journal,
            executor,
        }
    }

    fn complete(&self, transaction: Arc<Transaction>, decision: Decision) {
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
    let superior = transaction.superior_server_id();

    match journal.log_completed(&records, decision).await {
        Ok(()) => {
            if transaction.is_subordinate() {
                executor.report_done(&xid, &superior);
            }
            info!(xid = %xid, %decision, "Transaction completed");
            match decision {
                Decision::Commit => TxEvent::TwoPcDone { transaction },
                Decision::Rollback => TxEvent::RollbackDone { transaction },
            }
        }
        Err(err) => {
            error!(xid = %xid, %decision, error = %err, "Completion could not be logged");
            if transaction.is_subordinate() {
                executor.report_failed(&xid, &superior, Phase::from(decision));
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
impl Service for Completer {
    fn name(&self) -> &'static str {
        "completer"
    }

    fn interests(&self) -> Vec<EventKind> {
        vec![EventKind::CommitCompleted, EventKind::RollbackCompleted]
    }

    async fn handle(&mut self, event: TxEvent) {
        match event {
            TxEvent::CommitCompleted { transaction } => {
                self.complete(transaction, Decision::Commit)
            }
            TxEvent::RollbackCompleted { transaction } => {
                self.complete(transaction, Decision::Rollback)
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryJournal, LoopbackNetwork, PeerEndpoint};
    use crate::services::spawn_service;
    use crate::services::test_support::*;
    use shared_types::UidGenerator;

    fn fixture(local: &str) -> (Arc<EventBus>, Arc<InMemoryJournal>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let superior_bus = Arc::new(EventBus::new());
        let journal = Arc::new(InMemoryJournal::new());
        let network = LoopbackNetwork::new();
        network.register(
            "sup",
            Arc::new(PeerEndpoint::new("sup", superior_bus.clone())),
        );
        let executor = BranchExecutor::new(bus.clone(), Arc::new(network), local);
        spawn_service(&bus, Completer::new(bus.clone(), journal.clone(), executor));
        (bus, journal, superior_bus)
    }

    #[tokio::test]
    async fn test_subordinate_reports_done() {
        let (bus, journal, superior_bus) = fixture("sub");
        let mut done = watch(&superior_bus, vec![EventKind::BranchDone]);
        let mut out = watch(&bus, vec![EventKind::TwoPcDone]);
        let generator = UidGenerator::new("sub").unwrap();
        let tx = subordinate(&generator, "sup");
        enlist(&tx, &generator, "db");

        bus.publish(TxEvent::CommitCompleted {
            transaction: tx.clone(),
        })
        .await;

        next(&mut out).await;
        match next(&mut done).await {
            TxEvent::BranchDone { xid } => assert_eq!(&xid, tx.xid()),
            other => panic!("unexpected {other:?}"),
        }
        let completions = journal.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].decision, Decision::Commit);
    }

    #[tokio::test]
    async fn test_journal_failure_on_rollback() {
        let (bus, journal, _) = fixture("sup");
        journal.set_fail_writes(true);
        let mut out = watch(&bus, vec![EventKind::RollbackFailed]);
        let generator = UidGenerator::new("sup").unwrap();
        let tx = superior(&generator);

        bus.publish(TxEvent::RollbackCompleted { transaction: tx })
            .await;

        assert!(matches!(next(&mut out).await, TxEvent::RollbackFailed { .. }));
        assert!(journal.completions().is_empty());
    }

    #[tokio::test]
    async fn test_superior_does_not_report() {
        let (bus, _journal, superior_bus) = fixture("sup");
        let mut done = watch(&superior_bus, vec![EventKind::BranchDone]);
        let mut out = watch(&bus, vec![EventKind::RollbackDone]);
        let generator = UidGenerator::new("sup").unwrap();

        bus.publish(TxEvent::RollbackCompleted {
            transaction: superior(&generator),
        })
        .await;

        next(&mut out).await;
        quiet(&mut done).await;
    }

    #[tokio::test]
    async fn test_nested_subordinate_reports_done_to_order_sender() {
        let (bus, _journal, superior_bus) = fixture("sub");
        let mut at_root = watch(&superior_bus, vec![EventKind::BranchDone]);
        let generator = UidGenerator::new("sub").unwrap();
        // "mid" is not reachable, so only a misrouted report would arrive
        let tx = subordinate(&generator, "sup");
        tx.set_superior("mid");
        let mut out = watch(&bus, vec![EventKind::TwoPcDone]);

        bus.publish(TxEvent::CommitCompleted { transaction: tx })
            .await;

        next(&mut out).await;
        quiet(&mut at_root).await;
    }

    #[tokio::test]
    async fn test_slow_completion_does_not_hold_up_others() {
        let bus = Arc::new(EventBus::new());
        let generator = UidGenerator::new("sup").unwrap();
        let slow = superior(&generator);
        enlist(&slow, &generator, "db");
        let fast = superior(&generator);
        enlist(&fast, &generator, "db");
        let journal = Arc::new(GatedJournal::new(slow.xid().clone()));
        let executor = BranchExecutor::new(bus.clone(), Arc::new(LoopbackNetwork::new()), "sup");
        spawn_service(&bus, Completer::new(bus.clone(), journal.clone(), executor));
        let mut out = watch(&bus, vec![EventKind::RollbackDone]);

        bus.publish(TxEvent::RollbackCompleted {
            transaction: slow.clone(),
        })
        .await;
        bus.publish(TxEvent::RollbackCompleted {
            transaction: fast.clone(),
        })
        .await;

        match next(&mut out).await {
            TxEvent::RollbackDone { transaction } => assert_eq!(transaction.xid(), fast.xid()),
            other => panic!("unexpected {other:?}"),
        }
        journal.open();
        match next(&mut out).await {
            TxEvent::RollbackDone { transaction } => assert_eq!(transaction.xid(), slow.xid()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(journal.inner().completions().len(), 2);
    }
}
