//! Branch executor.
//!
//! Issues the actual XA and XA+ calls on behalf of the coordination
//! services. Every call runs on its own task and its outcome comes back as an
//! event, so a slow resource never stalls a service inbox.
//!
//! ## Heuristic reconciliation
//!
//! | Phase-two error | Commit path | Rollback path |
//! |-----------------|-------------|---------------|
//! | `XA_HEURCOM` | `forget`, success | failed |
//! | `XA_HEURRB` | failed | `forget`, success |
//! | `XA_HEURMIX` / `XA_HEURHAZ` | failed | failed |
//! | `XAER_NOTA`, `XA_RB*` | failed | success only if never prepared |
//! | anything else | failed | failed |
//!
//! A branch that never voted "yes" may already be gone when the rollback
//! arrives, so "unknown" and "rolled back" both mean done. Once a branch is in
//! doubt, and always during recovery, only the matching heuristic counts.
//!
//! ## Reports
//!
//! Reports go to the server that sent the orders, not to the owner of the
//! global transaction id; orders this coordinator sends name it as superior.

use std::collections::BTreeSet;
use std::sync::Arc;

use shared_bus::EventPublisher;
use shared_types::{
    Decision, Vote, XaException, Xid, TMENDRSCAN, TMFAIL, TMNOFLAGS, TMSTARTRSCAN, TMSUCCESS,
    XAER_NOTA,
};
use tracing::{debug, warn};

use crate::domain::{PeerTarget, Phase, XaTarget};
use crate::events::{EventBus, TxEvent};
use crate::ports::outbound::{PeerFactory, XaResource};

/// Status report sent from a subordinate to its superior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Report {
    Ready,
    Failed(Phase),
    Done,
}

#[derive(Clone)]
pub struct BranchExecutor {
    bus: Arc<EventBus>,
    peers: Arc<dyn PeerFactory>,
    local_server_id: Arc<str>,
}

impl BranchExecutor {
    pub fn new(bus: Arc<EventBus>, peers: Arc<dyn PeerFactory>, local_server_id: &str) -> Self {
        Self {
            bus,
            peers,
            local_server_id: Arc::from(local_server_id),
        }
    }

    pub fn local_server_id(&self) -> &str {
        &self.local_server_id
    }

    // =========================================================================
    // PHASE ONE
    // =========================================================================

    /// `end(TMSUCCESS)` then `prepare` on a local branch.
    pub fn prepare(&self, target: XaTarget) {
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let xid = target.xid;
            let outcome = async {
                target.resource.end(&xid, TMSUCCESS).await?;
                target.resource.prepare(&xid).await
            }
            .await;

            let event = match outcome {
                Ok(vote) => {
                    debug!(xid = %xid, resource = %target.resource_name, ?vote, "Branch prepared");
                    TxEvent::BranchPrepared {
                        read_only: vote == Vote::ReadOnly,
                        xid,
                    }
                }
                Err(error) => {
                    warn!(xid = %xid, resource = %target.resource_name, %error, "Prepare failed");
                    TxEvent::PrepareBranchFailed { xid, error }
                }
            };
            bus.publish(event).await;
        });
    }

    /// Send a prepare order to a peer.
    ///
    /// A delivered order produces no event; the peer answers with `ready` or
    /// `failed` later.
    pub fn peer_prepare(&self, target: PeerTarget) {
        let bus = self.bus.clone();
        let local = self.local_server_id.clone();
        tokio::spawn(async move {
            if let Err(error) = target.peer.prepare(&target.xid, &local).await {
                warn!(xid = %target.xid, peer = %target.server_id, %error, "Prepare order not delivered");
                bus.publish(TxEvent::PrepareBranchFailed {
                    xid: target.xid,
                    error,
                })
                .await;
            }
        });
    }

    // =========================================================================
    // PHASE TWO
    // =========================================================================

    pub fn commit(&self, target: XaTarget) {
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let xid = target.xid;
            let event = match complete(target.resource.as_ref(), &xid, Decision::Commit, false).await
            {
                Ok(()) => TxEvent::BranchCommitted { xid },
                Err(error) => {
                    warn!(xid = %xid, resource = %target.resource_name, %error, "Commit failed");
                    TxEvent::CommitBranchFailed { xid, error }
                }
            };
            bus.publish(event).await;
        });
    }

    /// Roll back a local branch; an unprepared branch is dissociated first.
    pub fn rollback(&self, target: XaTarget) {
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let xid = target.xid;
            if !target.prepared {
                if let Err(error) = target.resource.end(&xid, TMFAIL).await {
                    debug!(xid = %xid, %error, "end(TMFAIL) before rollback failed");
                }
            }
            let outcome = complete(
                target.resource.as_ref(),
                &xid,
                Decision::Rollback,
                !target.in_doubt,
            )
            .await;
            let event = match outcome {
                Ok(()) => TxEvent::BranchRolledBack { xid },
                Err(error) => {
                    warn!(xid = %xid, resource = %target.resource_name, %error, "Rollback failed");
                    TxEvent::RollbackBranchFailed { xid, error }
                }
            };
            bus.publish(event).await;
        });
    }

    pub fn peer_commit(&self, target: PeerTarget) {
        let bus = self.bus.clone();
        let local = self.local_server_id.clone();
        tokio::spawn(async move {
            let xid = target.xid;
            let event = match target.peer.commit(&xid, &local).await {
                Ok(()) => TxEvent::BranchCommitted { xid },
                Err(error) => {
                    warn!(xid = %xid, peer = %target.server_id, %error, "Commit order not delivered");
                    TxEvent::CommitBranchFailed { xid, error }
                }
            };
            bus.publish(event).await;
        });
    }

    pub fn peer_rollback(&self, target: PeerTarget) {
        let bus = self.bus.clone();
        let local = self.local_server_id.clone();
        tokio::spawn(async move {
            let xid = target.xid;
            let event = match target.peer.rollback(&xid, &local).await {
                Ok(()) => TxEvent::BranchRolledBack { xid },
                Err(error) => {
                    warn!(xid = %xid, peer = %target.server_id, %error, "Rollback order not delivered");
                    TxEvent::RollbackBranchFailed { xid, error }
                }
            };
            bus.publish(event).await;
        });
    }

    // =========================================================================
    // REPORTS TO THE SUPERIOR
    // =========================================================================

    pub fn report_ready(&self, xid: &Xid, superior: &str) {
        self.report(xid.clone(), superior, Report::Ready);
    }

    pub fn report_failed(&self, xid: &Xid, superior: &str, phase: Phase) {
        self.report(xid.clone(), superior, Report::Failed(phase));
    }

    pub fn report_done(&self, xid: &Xid, superior: &str) {
        self.report(xid.clone(), superior, Report::Done);
    }

    fn report(&self, xid: Xid, superior: &str, report: Report) {
        let peers = self.peers.clone();
        let superior = superior.to_string();
        tokio::spawn(async move {
            let result = async {
                let peer = peers.connect(&superior).await?;
                match report {
                    Report::Ready => peer.ready(&xid).await,
                    Report::Failed(phase) => peer.failed(&xid, phase).await,
                    Report::Done => peer.done(&xid).await,
                }
            }
            .await;
            match result {
                Ok(()) => debug!(xid = %xid, superior = %superior, ?report, "Reported to superior"),
                Err(error) => {
                    warn!(xid = %xid, superior = %superior, ?report, %error, "Report to superior failed")
                }
            }
        });
    }

    /// Ask `superior` to re-send its decisions for this server.
    pub fn send_retry(&self, superior: &str) {
        let peers = self.peers.clone();
        let superior = superior.to_string();
        let local = self.local_server_id.clone();
        tokio::spawn(async move {
            let result = async { peers.connect(&superior).await?.retry(&local).await }.await;
            match result {
                Ok(()) => debug!(superior = %superior, "Retry requested"),
                Err(error) => warn!(superior = %superior, %error, "Retry request failed"),
            }
        });
    }

    /// Re-send a logged decision to the subordinate `server_id`.
    pub fn redeliver(&self, server_id: &str, xid: Xid, decision: Decision) {
        let peers = self.peers.clone();
        let server_id = server_id.to_string();
        let local = self.local_server_id.clone();
        tokio::spawn(async move {
            let result = async {
                let peer = peers.connect(&server_id).await?;
                match decision {
                    Decision::Commit => peer.commit(&xid, &local).await,
                    Decision::Rollback => peer.rollback(&xid, &local).await,
                }
            }
            .await;
            if let Err(error) = result {
                warn!(xid = %xid, peer = %server_id, %decision, %error, "Decision redelivery failed");
            }
        });
    }

    // =========================================================================
    // RECOVERY
    // =========================================================================

    /// Full in-doubt scan of one resource.
    ///
    /// Keeps only branches owned by this server and created before `cutoff`.
    pub fn recover(
        &self,
        round: u64,
        resource_name: String,
        resource: Arc<dyn XaResource>,
        cutoff: u64,
    ) {
        let bus = self.bus.clone();
        let local = self.local_server_id.clone();
        tokio::spawn(async move {
            let event = match scan(resource.as_ref()).await {
                Ok(found) => {
                    let xids: Vec<Xid> = found
                        .into_iter()
                        .filter(|xid| {
                            xid.branch_server_id() == &*local
                                && xid.branch_qualifier().timestamp() < cutoff
                        })
                        .collect();
                    debug!(round, resource = %resource_name, count = xids.len(), "Resource scanned");
                    TxEvent::ResourceRecovered {
                        round,
                        resource_name,
                        xids,
                    }
                }
                Err(error) => {
                    warn!(round, resource = %resource_name, %error, "Recovery scan failed");
                    TxEvent::ResourceRecoveryFailed {
                        round,
                        resource_name,
                        error,
                    }
                }
            };
            bus.publish(event).await;
        });
    }

    /// Apply `decision` to a recovered branch.
    pub fn resolve_recovered(
        &self,
        xid: Xid,
        resource_name: String,
        resource: Arc<dyn XaResource>,
        decision: Decision,
    ) {
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let event = match complete(resource.as_ref(), &xid, decision, false).await {
                Ok(()) => match decision {
                    Decision::Commit => TxEvent::RecoveredXidCommitted { xid, resource_name },
                    Decision::Rollback => TxEvent::RecoveredXidRolledBack { xid, resource_name },
                },
                Err(error) => {
                    warn!(xid = %xid, resource = %resource_name, %decision, %error, "Recovered branch unresolved");
                    TxEvent::RecoveredXidFailed {
                        xid,
                        resource_name,
                        decision,
                        error,
                    }
                }
            };
            bus.publish(event).await;
        });
    }
}

/// Phase-two call with heuristic reconciliation.
///
/// `never_prepared` accepts "unknown" and `XA_RB*` on rollback.
async fn complete(
    resource: &dyn XaResource,
    xid: &Xid,
    decision: Decision,
    never_prepared: bool,
) -> Result<(), XaException> {
    let result = match decision {
        Decision::Commit => resource.commit(xid, false).await,
        Decision::Rollback => resource.rollback(xid).await,
    };
    match result {
        Ok(()) => Ok(()),
        Err(error) if error.code == decision.matching_heuristic() => {
            debug!(xid = %xid, code = error.code_name(), "Heuristic outcome matches decision, forgetting");
            resource.forget(xid).await
        }
        Err(error)
            if never_prepared
                && decision == Decision::Rollback
                && (error.code == XAER_NOTA || error.is_rollback()) =>
        {
            debug!(xid = %xid, code = error.code_name(), "Unprepared branch already gone");
            Ok(())
        }
        Err(error) => Err(error),
    }
}

/// `TMSTARTRSCAN`, then `TMNOFLAGS` until nothing new, then `TMENDRSCAN`.
async fn scan(resource: &dyn XaResource) -> Result<BTreeSet<Xid>, XaException> {
    let mut found = BTreeSet::new();
    let mut batch = resource.recover(TMSTARTRSCAN).await?;
    loop {
        let before = found.len();
        found.extend(batch);
        if found.len() == before {
            break;
        }
        batch = resource.recover(TMNOFLAGS).await?;
    }
    if let Err(error) = resource.recover(TMENDRSCAN).await {
        debug!(%error, "End of recovery scan rejected");
    }
    Ok(found)
}
