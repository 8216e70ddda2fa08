//! Phase one on the superior.
//!
//! Tracks every superior transaction from creation. A commit request fans
//! prepare out to every branch; once every branch has answered the
//! transaction leaves this stage with a commit decision, or with a rollback
//! decision if any branch failed (presumed abort).

use std::sync::Arc;

use async_trait::async_trait;
use shared_bus::EventPublisher;
use shared_types::Xid;
use tracing::{debug, info};

use super::{with_terminal, BranchExecutor, Service};
use crate::domain::{BranchOutcome, Phase, Tracker, Transaction};
use crate::events::{EventBus, EventKind, TxEvent};

pub struct SuperiorPreparer {
    bus: Arc<EventBus>,
    executor: BranchExecutor,
    tracker: Tracker,
}

impl SuperiorPreparer {
    pub fn new(bus: Arc<EventBus>, executor: BranchExecutor) -> Self {
        Self {
            bus,
            executor,
            tracker: Tracker::new(),
        }
    }

    async fn on_commit_requested(&mut self, transaction: Arc<Transaction>) {
        let xid = transaction.xid().clone();
        self.tracker.track(&transaction);
        if self.tracker.in_stage(&xid) {
            debug!(xid = %xid, "Duplicate commit request ignored");
            return;
        }

        let branches = transaction.branch_xids();
        if branches.is_empty() {
            self.tracker.untrack(&xid);
            self.decide(transaction).await;
            return;
        }

        debug!(xid = %xid, branches = branches.len(), "Preparing");
        self.tracker.start_stage(&xid, branches);
        for target in transaction.xa_targets() {
            self.executor.prepare(target);
        }
        for target in transaction.peer_targets() {
            self.executor.peer_prepare(target);
        }
    }

    async fn on_rollback_requested(&mut self, transaction: Arc<Transaction>) {
        if self.tracker.untrack(transaction.xid()).is_some() {
            self.bus
                .publish(TxEvent::LogRollbackDecision { transaction })
                .await;
        }
    }

    async fn on_outcome(&mut self, branch: &Xid, outcome: BranchOutcome) {
        if let Some(transaction) = self.tracker.record(branch, outcome, Phase::Prepare) {
            self.tracker.untrack(transaction.xid());
            self.decide(transaction).await;
        }
    }

    async fn decide(&self, transaction: Arc<Transaction>) {
        let failed = transaction.failed_branches(Phase::Prepare);
        let event = if failed.is_empty() && !transaction.is_rollback_only() {
            info!(xid = %transaction.xid(), "All branches prepared, committing");
            TxEvent::LogCommitDecision { transaction }
        } else {
            info!(xid = %transaction.xid(), failed = failed.len(), "Prepare failed, rolling back");
            TxEvent::LogRollbackDecision { transaction }
        };
        self.bus.publish(event).await;
    }
}

#[async_trait]
impl Service for SuperiorPreparer {
    fn name(&self) -> &'static str {
        "superior-preparer"
    }

    fn interests(&self) -> Vec<EventKind> {
        with_terminal(vec![
            EventKind::TransactionCreated,
            EventKind::CommitRequested,
            EventKind::RollbackRequested,
            EventKind::BranchPrepared,
            EventKind::PrepareBranchFailed,
            EventKind::BranchReadied,
            EventKind::BranchFailed,
        ])
    }

    async fn handle(&mut self, event: TxEvent) {
        match event {
            TxEvent::TransactionCreated { transaction } if transaction.is_superior() => {
                self.tracker.track(&transaction);
            }
            TxEvent::CommitRequested { transaction } if transaction.is_superior() => {
                self.on_commit_requested(transaction).await;
            }
            TxEvent::RollbackRequested { transaction } if transaction.is_superior() => {
                self.on_rollback_requested(transaction).await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LoopbackNetwork, PeerCall, PeerEndpoint, PeerVerb, XaVerb};
    use crate::services::spawn_service;
    use crate::services::test_support::*;
    use shared_types::{UidGenerator, XaException};

    struct Fixture {
        bus: Arc<EventBus>,
        network: LoopbackNetwork,
        generator: UidGenerator,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(EventBus::new());
        let network = LoopbackNetwork::new();
        let executor = BranchExecutor::new(bus.clone(), Arc::new(network.clone()), "sup");
        spawn_service(&bus, SuperiorPreparer::new(bus.clone(), executor));
        Fixture {
            bus,
            network,
            generator: UidGenerator::new("sup").unwrap(),
        }
    }

    fn decisions(bus: &EventBus) -> shared_bus::Subscription<TxEvent> {
        watch(
            bus,
            vec![EventKind::LogCommitDecision, EventKind::LogRollbackDecision],
        )
    }

    async fn start(f: &Fixture, tx: &Arc<Transaction>) {
        f.bus
            .publish(TxEvent::TransactionCreated {
                transaction: tx.clone(),
            })
            .await;
        f.bus
            .publish(TxEvent::CommitRequested {
                transaction: tx.clone(),
            })
            .await;
    }

    #[tokio::test]
    async fn test_timed_out_creation_is_forgotten() {
        let bus = Arc::new(EventBus::new());
        let executor = BranchExecutor::new(bus.clone(), Arc::new(LoopbackNetwork::new()), "sup");
        let mut service = SuperiorPreparer::new(bus.clone(), executor);
        let tx = superior(&UidGenerator::new("sup").unwrap());

        service
            .handle(TxEvent::TransactionCreated {
                transaction: tx.clone(),
            })
            .await;
        assert_eq!(service.tracker.len(), 1);

        // the user never commits; the manager drops it at expiry
        service
            .handle(TxEvent::TransactionTimedOut { transaction: tx })
            .await;
        assert!(service.tracker.is_empty());
    }

    #[tokio::test]
    async fn test_all_prepared_logs_commit() {
        let f = fixture();
        let mut out = decisions(&f.bus);
        let tx = superior(&f.generator);
        let (_, a) = enlist(&tx, &f.generator, "db-a");
        let (_, b) = enlist(&tx, &f.generator, "db-b");

        start(&f, &tx).await;

        assert!(matches!(next(&mut out).await, TxEvent::LogCommitDecision { .. }));
        assert_eq!(a.count(XaVerb::Prepare), 1);
        assert_eq!(b.count(XaVerb::Prepare), 1);
        quiet(&mut out).await;
    }

    #[tokio::test]
    async fn test_single_failure_rolls_back() {
        let f = fixture();
        let mut out = decisions(&f.bus);
        let tx = superior(&f.generator);
        enlist(&tx, &f.generator, "db-a");
        let (_, b) = enlist(&tx, &f.generator, "db-b");
        b.fail_on(XaVerb::Prepare, XaException::resource_error("disk"));

        start(&f, &tx).await;

        assert!(matches!(next(&mut out).await, TxEvent::LogRollbackDecision { .. }));
        quiet(&mut out).await;
    }

    #[tokio::test]
    async fn test_empty_transaction_commits_immediately() {
        let f = fixture();
        let mut out = decisions(&f.bus);
        let tx = superior(&f.generator);

        start(&f, &tx).await;

        assert!(matches!(next(&mut out).await, TxEvent::LogCommitDecision { .. }));
    }

    #[tokio::test]
    async fn test_peer_branch_waits_for_ready() {
        let f = fixture();
        let mut out = decisions(&f.bus);
        let sub_bus = Arc::new(EventBus::new());
        let mut orders = watch(&sub_bus, vec![EventKind::PrepareOrder]);
        f.network
            .register("sub", Arc::new(PeerEndpoint::new("sub", sub_bus.clone())));
        let tx = superior(&f.generator);
        enlist(&tx, &f.generator, "db-a");
        let peer = crate::ports::PeerFactory::connect(&f.network, "sub")
            .await
            .unwrap();
        let peer_xid = enlist_peer(&tx, &f.generator, "sub", peer);

        start(&f, &tx).await;

        match next(&mut orders).await {
            TxEvent::PrepareOrder { xid, superior } => {
                assert_eq!(xid, peer_xid);
                assert_eq!(superior, f.generator.server_id());
            }
            other => panic!("unexpected {other:?}"),
        }
        quiet(&mut out).await;

        f.bus
            .publish(TxEvent::BranchReadied { xid: peer_xid.clone() })
            .await;
        assert!(matches!(next(&mut out).await, TxEvent::LogCommitDecision { .. }));
        let prepares: Vec<PeerCall> = f.network.calls_to("sub", PeerVerb::Prepare);
        assert_eq!(prepares.len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_request_before_commit() {
        let f = fixture();
        let mut out = decisions(&f.bus);
        let tx = superior(&f.generator);
        let (_, a) = enlist(&tx, &f.generator, "db-a");

        f.bus
            .publish(TxEvent::TransactionCreated {
                transaction: tx.clone(),
            })
            .await;
        f.bus
            .publish(TxEvent::RollbackRequested {
                transaction: tx.clone(),
            })
            .await;

        assert!(matches!(next(&mut out).await, TxEvent::LogRollbackDecision { .. }));
        assert_eq!(a.count(XaVerb::Prepare), 0);
    }

    #[tokio::test]
    async fn test_duplicate_commit_request_prepares_once() {
        let f = fixture();
        let mut out = decisions(&f.bus);
        let tx = superior(&f.generator);
        let (_, a) = enlist(&tx, &f.generator, "db-a");
        let sub_bus = Arc::new(EventBus::new());
        f.network
            .register("sub", Arc::new(PeerEndpoint::new("sub", sub_bus)));
        let peer = crate::ports::PeerFactory::connect(&f.network, "sub")
            .await
            .unwrap();
        let peer_xid = enlist_peer(&tx, &f.generator, "sub", peer);

        start(&f, &tx).await;
        f.bus
            .publish(TxEvent::CommitRequested {
                transaction: tx.clone(),
            })
            .await;
        f.bus.publish(TxEvent::BranchReadied { xid: peer_xid }).await;

        assert!(matches!(next(&mut out).await, TxEvent::LogCommitDecision { .. }));
        quiet(&mut out).await;
        assert_eq!(a.count(XaVerb::Prepare), 1);
    }
}
