//! Phase two: rollback, for both roles.
//!
//! Branches that never prepared are dissociated with `end(TMFAIL)` before the
//! rollback call. A branch that failed to prepare still gets the call; only a
//! failure of the rollback itself makes the outcome `RollbackFailed`.

use std::sync::Arc;

use async_trait::async_trait;
use shared_types::Decision;

use super::committer::PhaseTwo;
use super::{with_terminal, BranchExecutor, Service};
use crate::domain::{BranchOutcome, Phase};
use crate::events::{EventBus, EventKind, TxEvent};

pub struct Rollback {
    stage: PhaseTwo,
}

impl Rollback {
    pub fn new(bus: Arc<EventBus>, executor: BranchExecutor) -> Self {
        Self {
            stage: PhaseTwo::new(bus, executor, Decision::Rollback),
        }
    }
}

#[async_trait]
impl Service for Rollback {
    fn name(&self) -> &'static str {
        "rollback"
    }

    fn interests(&self) -> Vec<EventKind> {
        with_terminal(vec![
            EventKind::RollbackDecisionLogged,
            EventKind::BranchRolledBack,
            EventKind::RollbackBranchFailed,
            EventKind::BranchDone,
            EventKind::BranchFailed,
        ])
    }

    async fn handle(&mut self, event: TxEvent) {
        match event {
            TxEvent::RollbackDecisionLogged { transaction } => {
                self.stage.start(transaction).await;
            }
            TxEvent::BranchRolledBack { xid } => {
                self.stage.on_outcome(&xid, BranchOutcome::RolledBack).await;
            }
            TxEvent::RollbackBranchFailed { xid, .. }
            | TxEvent::BranchFailed {
                xid,
                phase: Phase::Rollback,
            } => {
                self.stage
                    .on_outcome(&xid, BranchOutcome::Failed(Phase::Rollback))
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
