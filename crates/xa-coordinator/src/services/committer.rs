//! Phase two: commit.
//!
//! [`PhaseTwo`] is the stage machine shared with [`Rollback`](super::Rollback):
//! after the decision is durable, send the outcome to every branch that still
//! needs it and wait until every local call returned and every peer reported
//! `done`. Read-only branches are already finished and get no call.

use std::sync::Arc;

use async_trait::async_trait;
use shared_bus::EventPublisher;
use shared_types::{Decision, Xid};
use tracing::{debug, info, warn};

use super::{with_terminal, BranchExecutor, Service};
use crate::domain::{BranchOutcome, Phase, Role, Tracker, Transaction};
use crate::events::{EventBus, EventKind, TxEvent};

/// Fan-out and completion tracking for one phase-two direction.
pub(super) struct PhaseTwo {
    bus: Arc<EventBus>,
    executor: BranchExecutor,
    tracker: Tracker,
    decision: Decision,
}

impl PhaseTwo {
    pub(super) fn new(bus: Arc<EventBus>, executor: BranchExecutor, decision: Decision) -> Self {
        Self {
            bus,
            executor,
            tracker: Tracker::new(),
            decision,
        }
    }

    fn phase(&self) -> Phase {
        Phase::from(self.decision)
    }

    pub(super) async fn start(&mut self, transaction: Arc<Transaction>) {
        let xid = transaction.xid().clone();
        if !self.tracker.track(&transaction) {
            debug!(xid = %xid, decision = %self.decision, "Phase two already running");
            return;
        }

        let phase = self.phase();
        let pending: Vec<Xid> = transaction
            .branch_xids()
            .into_iter()
            .filter(|branch| !transaction.is_branch_finished(branch, phase))
            .collect();
        if pending.is_empty() {
            self.finish(transaction).await;
            return;
        }

        debug!(xid = %xid, decision = %self.decision, branches = pending.len(), "Completing branches");
        self.tracker.start_stage(&xid, pending.iter().cloned());
        for target in transaction.xa_targets() {
            if !pending.contains(&target.xid) {
                continue;
            }
            match self.decision {
                Decision::Commit => self.executor.commit(target),
                Decision::Rollback => self.executor.rollback(target),
            }
        }
        for target in transaction.peer_targets() {
            if !pending.contains(&target.xid) {
                continue;
            }
            match self.decision {
                Decision::Commit => self.executor.peer_commit(target),
                Decision::Rollback => self.executor.peer_rollback(target),
            }
        }
    }

    pub(super) async fn on_outcome(&mut self, branch: &Xid, outcome: BranchOutcome) {
        let phase = self.phase();
        if let Some(transaction) = self.tracker.record(branch, outcome, phase) {
            self.finish(transaction).await;
        }
    }

    pub(super) fn forget(&mut self, xid: &Xid) {
        self.tracker.untrack(xid);
    }

    async fn finish(&mut self, transaction: Arc<Transaction>) {
        self.tracker.untrack(transaction.xid());
        let xid = transaction.xid().clone();
        let failed = transaction.failed_branches(self.phase());

        let event = if failed.is_empty() {
            info!(xid = %xid, decision = %self.decision, "All branches completed");
            match self.decision {
                Decision::Commit => TxEvent::CommitCompleted { transaction },
                Decision::Rollback => TxEvent::RollbackCompleted { transaction },
            }
        } else {
            warn!(xid = %xid, decision = %self.decision, failed = failed.len(), "Branches failed to complete");
            if transaction.is_subordinate() {
                self.executor
                    .report_failed(&xid, &transaction.superior_server_id(), self.phase());
            }
            let reason = format!("{} branch(es) failed to {}", failed.len(), self.decision);
            match self.decision {
                Decision::Commit => TxEvent::TwoPcFailed {
                    transaction,
                    reason,
                },
                Decision::Rollback => TxEvent::RollbackFailed {
                    transaction,
                    reason,
                },
            }
        };
        self.bus.publish(event).await;
    }
}

/// Commits transactions of one role once the commit decision is logged.
pub struct Committer {
    role: Role,
    stage: PhaseTwo,
}

impl Committer {
    pub fn superior(bus: Arc<EventBus>, executor: BranchExecutor) -> Self {
        Self::new(Role::Superior, bus, executor)
    }

    pub fn subordinate(bus: Arc<EventBus>, executor: BranchExecutor) -> Self {
        Self::new(Role::Subordinate, bus, executor)
    }

    fn new(role: Role, bus: Arc<EventBus>, executor: BranchExecutor) -> Self {
        Self {
            role,
            stage: PhaseTwo::new(bus, executor, Decision::Commit),
        }
    }
}

#[async_trait]
impl Service for Committer {
    fn name(&self) -> &'static str {
        match self.role {
            Role::Superior => "superior-committer",
            Role::Subordinate => "subordinate-committer",
        }
    }

    fn interests(&self) -> Vec<EventKind> {
        with_terminal(vec![
            EventKind::CommitDecisionLogged,
            EventKind::BranchCommitted,
            EventKind::CommitBranchFailed,
            EventKind::BranchDone,
            EventKind::BranchFailed,
        ])
    }

    async fn handle(&mut self, event: TxEvent) {
        match event {
            TxEvent::CommitDecisionLogged { transaction } if transaction.role() == self.role => {
                self.stage.start(transaction).await;
            }
            TxEvent::BranchCommitted { xid } => {
                self.stage.on_outcome(&xid, BranchOutcome::Committed).await;
            }
            TxEvent::CommitBranchFailed { xid, .. }
            | TxEvent::BranchFailed {
                xid,
                phase: Phase::Commit,
            } => {
                self.stage
                    .on_outcome(&xid, BranchOutcome::Failed(Phase::Commit))
                    .await;
            }
            TxEvent::BranchDone { xid } => {
                self.stage.on_outcome(&xid, BranchOutcome::Done).await;
            }
            other => {
                if let Some(transaction) = other.terminal_transaction() {
                    self.stage.forget(transaction.xid());
                }
            }
        }
    }
}
