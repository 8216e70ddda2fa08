//! Phase one on a subordinate.
//!
//! Local prepare starts only once the superior's prepare order and the local
//! commit request have both arrived ([`PrepareOrderWaiter`](super::PrepareOrderWaiter)).
//! When every local branch has answered, the vote goes back to the superior
//! and the transaction waits for the order in
//! [`CommitOrderWaiter`](super::CommitOrderWaiter). A rollback order received
//! in the meantime wins over the vote.
//!
//! A branch delegated further down (A → B → C, seen from C) reports to the
//! server that sent the orders. That server is journaled before anything
//! prepares, so recovery can find it again.

use std::sync::Arc;

use async_trait::async_trait;
use shared_bus::EventPublisher;
use shared_types::{XaException, Xid};
use tracing::{debug, info, warn};

use super::{with_terminal, BranchExecutor, Service};
use crate::domain::{BranchOutcome, Phase, Tracker, Transaction};
use crate::events::{EventBus, EventKind, TxEvent};
use crate::ports::outbound::Journal;

pub struct SubordinatePreparer {
    bus: Arc<EventBus>,
    journal: Arc<dyn Journal>,
    executor: BranchExecutor,
    tracker: Tracker,
}

impl SubordinatePreparer {
    pub fn new(bus: Arc<EventBus>, journal: Arc<dyn Journal>, executor: BranchExecutor) -> Self {
        Self {
            bus,
            journal,
            executor,
            tracker: Tracker::new(),
        }
    }

    async fn on_prepare_requested(&mut self, transaction: Arc<Transaction>) {
        let xid = transaction.xid().clone();
        self.tracker.track(&transaction);
        if self.tracker.in_stage(&xid) {
            debug!(xid = %xid, "Duplicate prepare request ignored");
            return;
        }
        if transaction.is_rollback_ordered() || transaction.is_rollback_only() {
            self.tracker.untrack(&xid);
            self.vote(transaction).await;
            return;
        }

        let branches = transaction.branch_xids();
        if branches.is_empty() {
            self.tracker.untrack(&xid);
            self.vote(transaction).await;
            return;
        }

        debug!(xid = %xid, branches = branches.len(), "Preparing local branches");
        self.tracker.start_stage(&xid, branches);
        if transaction.is_nested() {
            self.record_superior_then_prepare(transaction);
        } else {
            prepare_all(&self.executor, &transaction);
        }
    }

    /// Journal the superior, then prepare. A failed write fails every branch.
    fn record_superior_then_prepare(&self, transaction: Arc<Transaction>) {
        let bus = self.bus.clone();
        let journal = self.journal.clone();
        let executor = self.executor.clone();
        tokio::spawn(async move {
            let superior = transaction.superior_server_id();
            match journal
                .log_superior(&transaction.branch_records(), &superior)
                .await
            {
                Ok(()) => prepare_all(&executor, &transaction),
                Err(err) => {
                    warn!(xid = %transaction.xid(), superior = %superior, %err, "Superior not journaled");
                    for xid in transaction.branch_xids() {
                        let error =
                            XaException::resource_error(format!("superior not journaled: {err}"));
                        bus.publish(TxEvent::PrepareBranchFailed { xid, error })
                            .await;
                    }
                }
            }
        });
    }

    async fn on_outcome(&mut self, branch: &Xid, outcome: BranchOutcome) {
        if let Some(transaction) = self.tracker.record(branch, outcome, Phase::Prepare) {
            self.tracker.untrack(transaction.xid());
            self.vote(transaction).await;
        }
    }

    /// Tell the superior how phase one went, unless it already decided.
    async fn vote(&self, transaction: Arc<Transaction>) {
        let xid = transaction.xid().clone();
        if transaction.is_rollback_ordered() {
            info!(xid = %xid, "Rollback already ordered");
            self.bus
                .publish(TxEvent::LogRollbackDecision { transaction })
                .await;
            return;
        }

        let readied =
            !transaction.is_rollback_only() && !transaction.has_failures(Phase::Prepare);
        let superior = transaction.superior_server_id();
        if readied {
            info!(xid = %xid, superior = %superior, "Subordinate prepared, reporting ready");
            self.executor.report_ready(&xid, &superior);
        } else {
            warn!(xid = %xid, superior = %superior, "Subordinate cannot commit, reporting failed");
            self.executor.report_failed(&xid, &superior, Phase::Prepare);
        }
        self.bus
            .publish(TxEvent::PrepareReported {
                transaction,
                readied,
            })
            .await;
    }
}

#[async_trait]
impl Service for SubordinatePreparer {
    fn name(&self) -> &'static str {
        "subordinate-preparer"
    }

    fn interests(&self) -> Vec<EventKind> {
        with_terminal(vec![
            EventKind::TransactionCreated,
            EventKind::SubordinatePrepareRequested,
            EventKind::RollbackOrder,
            EventKind::BranchPrepared,
            EventKind::PrepareBranchFailed,
            EventKind::BranchReadied,
            EventKind::BranchFailed,
        ])
    }

    async fn handle(&mut self, event: TxEvent) {
        match event {
            TxEvent::TransactionCreated { transaction } if transaction.is_subordinate() => {
                self.tracker.track(&transaction);
            }
            TxEvent::SubordinatePrepareRequested { transaction } => {
                self.on_prepare_requested(transaction).await;
            }
            TxEvent::RollbackOrder { xid, superior } => {
                if let Some(transaction) = self.tracker.get(&xid) {
                    debug!(xid = %xid, "Rollback ordered during prepare");
                    transaction.set_superior(&superior);
                    transaction.set_rollback_ordered();
                }
            }
            TxEvent::BranchPrepared { xid, read_only } => {
                self.on_outcome(&xid, BranchOutcome::Prepared { read_only })
                    .await;
            }
            TxEvent::PrepareBranchFailed { xid, .. }
            | TxEvent::BranchFailed {
                xid,
                phase: Phase::Prepare,
            } => {
                self.on_outcome(&xid, BranchOutcome::Failed(Phase::Prepare))
                    .await;
            }
            TxEvent::BranchReadied { xid } => {
                self.on_outcome(&xid, BranchOutcome::Readied).await;
            }
            other => {
                if let Some(transaction) = other.terminal_transaction() {
                    self.tracker.untrack(transaction.xid());
                }
            }
        }
    }
}

fn prepare_all(executor: &BranchExecutor, transaction: &Transaction) {
    for target in transaction.xa_targets() {
        executor.prepare(target);
    }
    for target in transaction.peer_targets() {
        executor.peer_prepare(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryJournal, LoopbackNetwork, PeerEndpoint, PeerVerb, XaVerb};
    use crate::services::spawn_service;
    use crate::services::test_support::*;
    use shared_types::{UidGenerator, XaException};

    struct Fixture {
        bus: Arc<EventBus>,
        superior_bus: Arc<EventBus>,
        journal: Arc<InMemoryJournal>,
        network: LoopbackNetwork,
        generator: UidGenerator,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(EventBus::new());
        let superior_bus = Arc::new(EventBus::new());
        let journal = Arc::new(InMemoryJournal::new());
        let network = LoopbackNetwork::new();
        network.register(
            "sup",
            Arc::new(PeerEndpoint::new("sup", superior_bus.clone())),
        );
        let executor = BranchExecutor::new(bus.clone(), Arc::new(network.clone()), "sub");
        spawn_service(
            &bus,
            SubordinatePreparer::new(bus.clone(), journal.clone(), executor),
        );
        Fixture {
            bus,
            superior_bus,
            journal,
            network,
            generator: UidGenerator::new("sub").unwrap(),
        }
    }

    async fn request(f: &Fixture, tx: &Arc<Transaction>) {
        f.bus
            .publish(TxEvent::TransactionCreated {
                transaction: tx.clone(),
            })
            .await;
        f.bus
            .publish(TxEvent::SubordinatePrepareRequested {
                transaction: tx.clone(),
            })
            .await;
    }

    #[tokio::test]
    async fn test_prepared_branches_report_ready() {
        let f = fixture();
        let mut reported = watch(&f.bus, vec![EventKind::PrepareReported]);
        let mut at_superior = watch(&f.superior_bus, vec![EventKind::BranchReadied]);
        let tx = subordinate(&f.generator, "sup");
        let (_, db) = enlist(&tx, &f.generator, "db");

        request(&f, &tx).await;

        match next(&mut reported).await {
            TxEvent::PrepareReported { readied, .. } => assert!(readied),
            other => panic!("unexpected {other:?}"),
        }
        match next(&mut at_superior).await {
            TxEvent::BranchReadied { xid } => assert_eq!(&xid, tx.xid()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(db.count(XaVerb::Prepare), 1);
        assert_eq!(f.journal.superior_of(tx.xid()), None);
    }

    #[tokio::test]
    async fn test_nested_branch_reports_to_order_sender() {
        let f = fixture();
        let middle_bus = Arc::new(EventBus::new());
        f.network
            .register("mid", Arc::new(PeerEndpoint::new("mid", middle_bus.clone())));
        let mut at_middle = watch(&middle_bus, vec![EventKind::BranchReadied]);
        let tx = subordinate(&f.generator, "sup");
        let (db_xid, db) = enlist(&tx, &f.generator, "db");
        tx.set_superior("mid");

        request(&f, &tx).await;

        match next(&mut at_middle).await {
            TxEvent::BranchReadied { xid } => assert_eq!(&xid, tx.xid()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(db.count(XaVerb::Prepare), 1);
        assert_eq!(f.journal.superior_of(&db_xid).as_deref(), Some("mid"));
        assert!(f.network.calls_to("sup", PeerVerb::Ready).is_empty());
    }

    #[tokio::test]
    async fn test_unjournaled_superior_fails_prepare() {
        let f = fixture();
        let middle_bus = Arc::new(EventBus::new());
        f.network
            .register("mid", Arc::new(PeerEndpoint::new("mid", middle_bus.clone())));
        let mut at_middle = watch(&middle_bus, vec![EventKind::BranchFailed]);
        let mut reported = watch(&f.bus, vec![EventKind::PrepareReported]);
        let tx = subordinate(&f.generator, "sup");
        let (_, db) = enlist(&tx, &f.generator, "db");
        tx.set_superior("mid");
        f.journal.set_fail_writes(true);

        request(&f, &tx).await;

        match next(&mut reported).await {
            TxEvent::PrepareReported { readied, .. } => assert!(!readied),
            other => panic!("unexpected {other:?}"),
        }
        match next(&mut at_middle).await {
            TxEvent::BranchFailed { phase, .. } => assert_eq!(phase, Phase::Prepare),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(db.count(XaVerb::Prepare), 0);
    }

    #[tokio::test]
    async fn test_failed_branch_reports_failed() {
        let f = fixture();
        let mut reported = watch(&f.bus, vec![EventKind::PrepareReported]);
        let mut at_superior = watch(&f.superior_bus, vec![EventKind::BranchFailed]);
        let tx = subordinate(&f.generator, "sup");
        let (_, db) = enlist(&tx, &f.generator, "db");
        db.fail_on(XaVerb::Prepare, XaException::resource_error("full"));

        request(&f, &tx).await;

        match next(&mut reported).await {
            TxEvent::PrepareReported { readied, .. } => assert!(!readied),
            other => panic!("unexpected {other:?}"),
        }
        next(&mut at_superior).await;
        assert!(f.network.calls_to("sup", PeerVerb::Ready).is_empty());
    }

    #[tokio::test]
    async fn test_rollback_only_votes_no_without_preparing() {
        let f = fixture();
        let mut reported = watch(&f.bus, vec![EventKind::PrepareReported]);
        let tx = subordinate(&f.generator, "sup");
        let (_, db) = enlist(&tx, &f.generator, "db");
        tx.set_rollback_only();

        request(&f, &tx).await;

        match next(&mut reported).await {
            TxEvent::PrepareReported { readied, .. } => assert!(!readied),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(db.count(XaVerb::Prepare), 0);
    }

    #[tokio::test]
    async fn test_rollback_order_beats_vote() {
        let f = fixture();
        let mut out = watch(
            &f.bus,
            vec![EventKind::PrepareReported, EventKind::LogRollbackDecision],
        );
        let tx = subordinate(&f.generator, "sup");
        enlist(&tx, &f.generator, "db");
        f.bus
            .publish(TxEvent::TransactionCreated {
                transaction: tx.clone(),
            })
            .await;
        f.bus
            .publish(TxEvent::RollbackOrder {
                xid: tx.xid().clone(),
                superior: "sup".into(),
            })
            .await;
        f.bus
            .publish(TxEvent::SubordinatePrepareRequested {
                transaction: tx.clone(),
            })
            .await;

        assert!(matches!(next(&mut out).await, TxEvent::LogRollbackDecision { .. }));
        quiet(&mut out).await;
        assert!(f.network.calls_to("sup", PeerVerb::Ready).is_empty());
    }
}
