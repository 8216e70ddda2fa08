//! # Crash Recovery
//!
//! One round at a time: `Idle → Started → Ready → Idle`. A round queries the
//! journal for dangling decisions and scans every registered resource for
//! in-doubt branches, then resolves each branch this server owns:
//!
//! | Journal | Superior | Action |
//! |---------|----------|--------|
//! | decision found | any | apply it |
//! | nothing | this server | status lookup; commit only if completed as commit, else presume rollback |
//! | nothing | remote | keep pending and ask that superior to `retry` |
//!
//! The superior of a branch is the server journaled by the subordinate
//! preparer for nested branches, else the owner of the global id.
//!
//! When the round finishes, dangling decisions of cleanly scanned resources
//! that are no longer in doubt are written as completed.
//!
//! Pending branches survive the round. A commit or rollback order later
//! redelivered by the superior resolves every pending branch of that global
//! transaction, and the superior then gets `done` (or `failed`).
//!
//! The superior side of `retry` lives here too: dangling decisions logged for
//! the asking peer are sent again and completed once the peer reports `done`.
//!
//! Pending branches and redelivered decisions not answered within the
//! recovery timeout are dropped; the journal and the resources still hold
//! them, so the next round or the next `retry` picks them up again.
//!
//! Journal lookups and the closing write of a round, and the lookup behind a
//! `retry`, are awaited on the inbox. Rounds are rare and serialized, so
//! orders arriving meanwhile only queue behind them. Completions reported by
//! peers are written on their own task.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shared_bus::EventPublisher;
use shared_types::{current_time_millis, Decision, Uid, Xid};
use tracing::{debug, error, info, warn};

use super::{BranchExecutor, Service};
use crate::domain::Phase;
use crate::events::{EventBus, EventKind, TxEvent};
use crate::metrics;
use crate::ports::outbound::{BranchRecord, DanglingTransactions, Journal, TransactionStatus};
use crate::resources::ResourceRegistry;

/// Where the current round stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    /// No round running
    Idle,
    /// Waiting for the journal query and the resource scans
    Started,
    /// Resolving recovered branches
    Ready,
}

/// A recovered branch: resource name and branch xid.
type BranchKey = (String, Xid);

struct Round {
    number: u64,
    started_at: u64,
    dangling: Option<DanglingTransactions>,
    pending_scans: HashSet<String>,
    scanned: BTreeMap<String, Vec<Xid>>,
    failed_scans: usize,
    outstanding: HashSet<BranchKey>,
    resolved: HashSet<BranchKey>,
    failures: usize,
}

/// Global transaction id and the superior in-doubt branches wait on.
type RetryKey = (Uid, String);

/// In-doubt branches (branch → resource name) waiting on a remote superior.
struct PendingRetry {
    branches: BTreeMap<Xid, String>,
    since: u64,
}

/// Branches waiting on one redelivered order.
struct RetryGroup {
    decision: Decision,
    superior: String,
    outstanding: HashSet<BranchKey>,
    failed: bool,
}

/// Decision sent again to a peer, waiting for its `done`.
struct Redelivery {
    server_id: String,
    decision: Decision,
    sent_at: u64,
}

pub struct RecoveryService {
    bus: Arc<EventBus>,
    journal: Arc<dyn Journal>,
    resources: Arc<ResourceRegistry>,
    executor: BranchExecutor,
    recovery_timeout: Duration,
    status: RecoveryStatus,
    rounds: u64,
    round: Option<Round>,
    pending_retries: HashMap<RetryKey, PendingRetry>,
    /// Order xid → branches it is resolving
    retry_groups: HashMap<Xid, RetryGroup>,
    /// Branch → order xid of its retry group
    retry_branches: HashMap<BranchKey, Xid>,
    /// Peer branch → decision sent again on the peer's request
    redelivered: HashMap<Xid, Redelivery>,
}

impl RecoveryService {
    pub fn new(
        bus: Arc<EventBus>,
        journal: Arc<dyn Journal>,
        resources: Arc<ResourceRegistry>,
        executor: BranchExecutor,
        recovery_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            journal,
            resources,
            executor,
            recovery_timeout,
            status: RecoveryStatus::Idle,
            rounds: 0,
            round: None,
            pending_retries: HashMap::new(),
            retry_groups: HashMap::new(),
            retry_branches: HashMap::new(),
            redelivered: HashMap::new(),
        }
    }

    pub fn status(&self) -> RecoveryStatus {
        self.status
    }

    // =========================================================================
    // ROUND LIFECYCLE
    // =========================================================================

    fn start(&mut self, inflight_cutoff: u64) {
        if self.status != RecoveryStatus::Idle {
            debug!(round = self.rounds, "Recovery already running");
            return;
        }
        self.rounds += 1;
        let number = self.rounds;
        let names = self.resources.names();
        info!(round = number, resources = names.len(), inflight_cutoff, "Recovery started");

        let journal = self.journal.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let event = match journal.find_dangling_transactions(inflight_cutoff).await {
                Ok(dangling) => TxEvent::DanglingTransactionsFound {
                    round: number,
                    dangling,
                },
                Err(err) => TxEvent::DanglingQueryFailed {
                    round: number,
                    error: err.to_string(),
                },
            };
            bus.publish(event).await;
        });

        for name in &names {
            if let Some(resource) = self.resources.get(name) {
                self.executor
                    .recover(number, name.clone(), resource, inflight_cutoff);
            }
        }

        self.status = RecoveryStatus::Started;
        self.round = Some(Round {
            number,
            started_at: current_time_millis(),
            dangling: None,
            pending_scans: names.into_iter().collect(),
            scanned: BTreeMap::new(),
            failed_scans: 0,
            outstanding: HashSet::new(),
            resolved: HashSet::new(),
            failures: 0,
        });
    }

    /// Round `number` is the one running.
    fn current(&mut self, number: u64) -> Option<&mut Round> {
        self.round.as_mut().filter(|round| round.number == number)
    }

    async fn try_resolve(&mut self) {
        let ready = self.status == RecoveryStatus::Started
            && self
                .round
                .as_ref()
                .is_some_and(|r| r.dangling.is_some() && r.pending_scans.is_empty());
        if !ready {
            return;
        }
        self.status = RecoveryStatus::Ready;

        let Some(round) = self.round.as_ref() else {
            return;
        };
        let scanned = round.scanned.clone();
        let dangling = round.dangling.clone().unwrap_or_default();
        let local = self.executor.local_server_id().to_string();

        let now = current_time_millis();
        let mut issued = Vec::new();
        let mut superiors = BTreeSet::new();
        let mut failures = 0;
        for (name, xids) in &scanned {
            let Some(resource) = self.resources.get(name) else {
                continue;
            };
            for xid in xids {
                let logged = dangling.get(name).and_then(|entries| entries.get(xid));
                let decision = match logged {
                    Some(decision) => *decision,
                    None if xid.superior_server_id() == local => {
                        match self.journal.find_transaction_status(xid).await {
                            Ok(TransactionStatus::Completed(Decision::Commit)) => Decision::Commit,
                            Ok(_) => {
                                debug!(xid = %xid, "No decision logged, presuming rollback");
                                Decision::Rollback
                            }
                            Err(err) => {
                                warn!(xid = %xid, error = %err, "Status lookup failed, branch left in doubt");
                                failures += 1;
                                continue;
                            }
                        }
                    }
                    None => {
                        let superior = match self.journal.find_superior(xid).await {
                            Ok(Some(superior)) => superior,
                            Ok(None) => xid.superior_server_id().to_string(),
                            Err(err) => {
                                warn!(xid = %xid, error = %err, "Superior lookup failed, branch left in doubt");
                                failures += 1;
                                continue;
                            }
                        };
                        debug!(xid = %xid, superior = %superior, "Waiting on remote superior");
                        self.pending_retries
                            .entry((xid.global_transaction_id().clone(), superior.clone()))
                            .or_insert_with(|| PendingRetry {
                                branches: BTreeMap::new(),
                                since: now,
                            })
                            .branches
                            .insert(xid.clone(), name.clone());
                        superiors.insert(superior);
                        continue;
                    }
                };
                self.executor
                    .resolve_recovered(xid.clone(), name.clone(), resource.clone(), decision);
                issued.push((name.clone(), xid.clone()));
            }
        }

        for superior in &superiors {
            self.executor.send_retry(superior);
        }

        if let Some(round) = self.round.as_mut() {
            round.failures += failures;
            round.outstanding.extend(issued);
            info!(
                round = round.number,
                resolving = round.outstanding.len(),
                superiors = superiors.len(),
                "Recovered branches dispatched"
            );
            if round.outstanding.is_empty() {
                self.finish().await;
            }
        }
    }

    async fn finish(&mut self) {
        let Some(round) = self.round.take() else {
            return;
        };
        self.status = RecoveryStatus::Idle;

        let mut succeeded = round.failures == 0 && round.failed_scans == 0;
        if let Some(dangling) = &round.dangling {
            for (decision, records) in closable(&round, dangling) {
                match self.journal.log_completed(&records, decision).await {
                    Ok(()) => {
                        debug!(round = round.number, %decision, branches = records.len(), "Dangling decisions closed")
                    }
                    Err(err) => {
                        error!(round = round.number, error = %err, "Could not close dangling decisions");
                        succeeded = false;
                    }
                }
            }
        }

        info!(round = round.number, succeeded, "Recovery finished");
        metrics::record_recovery_round(succeeded);
        self.bus
            .publish(TxEvent::RecoveryFinished {
                round: round.number,
                succeeded,
            })
            .await;
    }

    async fn fail(&mut self, number: u64, reason: &str) {
        if self.current(number).is_none() {
            return;
        }
        warn!(round = number, reason, "Recovery round failed");
        self.round = None;
        self.status = RecoveryStatus::Idle;
        metrics::record_recovery_round(false);
        self.bus
            .publish(TxEvent::RecoveryFinished {
                round: number,
                succeeded: false,
            })
            .await;
    }

    // =========================================================================
    // OUTCOMES
    // =========================================================================

    async fn on_resolved(&mut self, xid: Xid, resource_name: String, decision: Decision, ok: bool) {
        let key = (resource_name, xid);
        if ok {
            metrics::record_recovered(decision);
        }

        if let Some(round) = self.round.as_mut() {
            if round.outstanding.remove(&key) {
                if ok {
                    round.resolved.insert(key);
                } else {
                    round.failures += 1;
                }
                if round.outstanding.is_empty() && self.status == RecoveryStatus::Ready {
                    self.finish().await;
                }
                return;
            }
        }

        let Some(order) = self.retry_branches.remove(&key) else {
            return;
        };
        let Some(group) = self.retry_groups.get_mut(&order) else {
            return;
        };
        group.outstanding.remove(&key);
        group.failed |= !ok;
        if group.outstanding.is_empty() {
            if let Some(group) = self.retry_groups.remove(&order) {
                self.report_retry(&order, &group);
            }
        }
    }

    fn report_retry(&self, order: &Xid, group: &RetryGroup) {
        if group.failed {
            warn!(xid = %order, superior = %group.superior, "Redelivered decision could not be applied everywhere");
            self.executor
                .report_failed(order, &group.superior, Phase::from(group.decision));
        } else {
            info!(xid = %order, superior = %group.superior, "Redelivered decision applied");
            self.executor.report_done(order, &group.superior);
        }
    }

    /// `superior` redelivered its decision for `order`.
    fn on_order(&mut self, order: Xid, decision: Decision, superior: String) {
        let key = (order.global_transaction_id().clone(), superior);
        let Some(pending) = self.pending_retries.remove(&key) else {
            return;
        };
        let (_, superior) = key;
        let branches = pending.branches;
        info!(xid = %order, %decision, superior = %superior, branches = branches.len(), "Resolving pending branches");

        let mut group = RetryGroup {
            decision,
            superior,
            outstanding: HashSet::new(),
            failed: false,
        };
        for (xid, name) in branches {
            match self.resources.get(&name) {
                Some(resource) => {
                    let key = (name.clone(), xid.clone());
                    self.retry_branches.insert(key.clone(), order.clone());
                    group.outstanding.insert(key);
                    self.executor
                        .resolve_recovered(xid, name, resource, group.decision);
                }
                None => {
                    warn!(xid = %xid, resource = %name, "Resource gone, branch left in doubt");
                    group.failed = true;
                }
            }
        }

        if group.outstanding.is_empty() {
            self.report_retry(&order, &group);
        } else {
            self.retry_groups.insert(order, group);
        }
    }

    /// Drop retries and redeliveries nobody answered in time.
    fn evict_stale(&mut self, now: u64) {
        let max_age = self.recovery_timeout.as_millis() as u64;
        let retries = self.pending_retries.len();
        self.pending_retries
            .retain(|_, pending| now.saturating_sub(pending.since) < max_age);
        let redeliveries = self.redelivered.len();
        self.redelivered
            .retain(|_, sent| now.saturating_sub(sent.sent_at) < max_age);

        let dropped_retries = retries - self.pending_retries.len();
        let dropped_redeliveries = redeliveries - self.redelivered.len();
        if dropped_retries + dropped_redeliveries > 0 {
            debug!(
                retries = dropped_retries,
                redeliveries = dropped_redeliveries,
                "Unanswered recovery requests dropped"
            );
        }
    }

    #[cfg(test)]
    fn waiting(&self) -> (usize, usize) {
        (self.pending_retries.len(), self.redelivered.len())
    }

    // =========================================================================
    // SUPERIOR SIDE OF RETRY
    // =========================================================================

    async fn redeliver(&mut self, server_id: String, inflight_cutoff: u64) {
        let dangling = match self.journal.find_dangling_transactions(inflight_cutoff).await {
            Ok(dangling) => dangling,
            Err(err) => {
                warn!(peer = %server_id, error = %err, "Cannot redeliver decisions");
                return;
            }
        };
        let Some(entries) = dangling.get(&server_id) else {
            debug!(peer = %server_id, "No decisions to redeliver");
            return;
        };
        info!(peer = %server_id, count = entries.len(), "Redelivering decisions");
        let now = current_time_millis();
        for (xid, decision) in entries {
            self.redelivered.insert(
                xid.clone(),
                Redelivery {
                    server_id: server_id.clone(),
                    decision: *decision,
                    sent_at: now,
                },
            );
            self.executor.redeliver(&server_id, xid.clone(), *decision);
        }
    }

    fn on_peer_done(&mut self, xid: &Xid) {
        let Some(Redelivery {
            server_id,
            decision,
            ..
        }) = self.redelivered.remove(xid)
        else {
            return;
        };
        let journal = self.journal.clone();
        let xid = xid.clone();
        tokio::spawn(async move {
            let record = BranchRecord::new(xid.clone(), server_id);
            match journal.log_completed(&[record], decision).await {
                Ok(()) => info!(xid = %xid, %decision, "Peer branch completed after redelivery"),
                Err(err) => error!(xid = %xid, error = %err, "Could not log peer completion"),
            }
        });
    }
}

/// Dangling entries of cleanly scanned resources that can be marked completed,
/// grouped by decision.
fn closable(round: &Round, dangling: &DanglingTransactions) -> Vec<(Decision, Vec<BranchRecord>)> {
    let mut by_decision: BTreeMap<bool, Vec<BranchRecord>> = BTreeMap::new();
    for (name, in_doubt) in &round.scanned {
        let Some(entries) = dangling.get(name) else {
            continue;
        };
        for (xid, decision) in entries {
            let key = (name.clone(), xid.clone());
            if !in_doubt.contains(xid) || round.resolved.contains(&key) {
                by_decision
                    .entry(decision.is_commit())
                    .or_default()
                    .push(BranchRecord::new(xid.clone(), name.clone()));
            }
        }
    }
    by_decision
        .into_iter()
        .map(|(commit, records)| {
            let decision = if commit {
                Decision::Commit
            } else {
                Decision::Rollback
            };
            (decision, records)
        })
        .collect()
}

#[async_trait]
impl Service for RecoveryService {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn interests(&self) -> Vec<EventKind> {
        vec![
            EventKind::RecoveryRequested,
            EventKind::DanglingTransactionsFound,
            EventKind::DanglingQueryFailed,
            EventKind::ResourceRecovered,
            EventKind::ResourceRecoveryFailed,
            EventKind::RecoveredXidCommitted,
            EventKind::RecoveredXidRolledBack,
            EventKind::RecoveredXidFailed,
            EventKind::CommitOrder,
            EventKind::RollbackOrder,
            EventKind::RedeliverDecisions,
            EventKind::BranchDone,
            EventKind::BranchFailed,
            EventKind::TimerTick,
        ]
    }

    async fn handle(&mut self, event: TxEvent) {
        match event {
            TxEvent::RecoveryRequested { inflight_cutoff } => self.start(inflight_cutoff),
            TxEvent::DanglingTransactionsFound { round, dangling } => {
                if let Some(current) = self.current(round) {
                    current.dangling = Some(dangling);
                    self.try_resolve().await;
                }
            }
            TxEvent::DanglingQueryFailed { round, error } => self.fail(round, &error).await,
            TxEvent::ResourceRecovered {
                round,
                resource_name,
                xids,
            } => {
                if let Some(current) = self.current(round) {
                    current.pending_scans.remove(&resource_name);
                    current.scanned.insert(resource_name, xids);
                    self.try_resolve().await;
                }
            }
            TxEvent::ResourceRecoveryFailed {
                round,
                resource_name,
                ..
            } => {
                if let Some(current) = self.current(round) {
                    current.pending_scans.remove(&resource_name);
                    current.failed_scans += 1;
                    self.try_resolve().await;
                }
            }
            TxEvent::RecoveredXidCommitted { xid, resource_name } => {
                self.on_resolved(xid, resource_name, Decision::Commit, true)
                    .await
            }
            TxEvent::RecoveredXidRolledBack { xid, resource_name } => {
                self.on_resolved(xid, resource_name, Decision::Rollback, true)
                    .await
            }
            TxEvent::RecoveredXidFailed {
                xid,
                resource_name,
                decision,
                ..
            } => self.on_resolved(xid, resource_name, decision, false).await,
            TxEvent::CommitOrder { xid, superior } => {
                self.on_order(xid, Decision::Commit, superior)
            }
            TxEvent::RollbackOrder { xid, superior } => {
                self.on_order(xid, Decision::Rollback, superior)
            }
            TxEvent::RedeliverDecisions {
                server_id,
                inflight_cutoff,
            } => self.redeliver(server_id, inflight_cutoff).await,
            TxEvent::BranchDone { xid } => self.on_peer_done(&xid),
            TxEvent::BranchFailed { xid, .. } => {
                if let Some(sent) = self.redelivered.remove(&xid) {
                    warn!(xid = %xid, peer = %sent.server_id, decision = %sent.decision, "Peer failed to apply redelivered decision");
                }
            }
            TxEvent::TimerTick { now } => {
                let expired = self.round.as_ref().and_then(|round| {
                    let timeout = self.recovery_timeout.as_millis() as u64;
                    (now.saturating_sub(round.started_at) >= timeout).then_some(round.number)
                });
                if let Some(number) = expired {
                    self.fail(number, "timed out").await;
                }
                self.evict_stale(now);
            }
            _ => {}
        }
    }
}
