//! Per-stage bookkeeping.
//!
//! Each service owns its own `Tracker`; nothing else touches it, so it needs
//! no locking. A tracker maps transaction xids to transactions, branch xids to
//! their owning transaction, and keeps the set of branches still outstanding
//! in the current stage.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use shared_types::Xid;

use super::branch::{BranchOutcome, Phase};
use super::transaction::Transaction;

#[derive(Debug, Default)]
pub struct Tracker {
    transactions: HashMap<Xid, Arc<Transaction>>,
    branches: HashMap<Xid, Xid>,
    remaining: HashMap<Xid, HashSet<Xid>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking; false if already tracked.
    pub fn track(&mut self, transaction: &Arc<Transaction>) -> bool {
        if self.transactions.contains_key(transaction.xid()) {
            return false;
        }
        self.transactions
            .insert(transaction.xid().clone(), transaction.clone());
        true
    }

    pub fn is_tracked(&self, xid: &Xid) -> bool {
        self.transactions.contains_key(xid)
    }

    pub fn get(&self, xid: &Xid) -> Option<Arc<Transaction>> {
        self.transactions.get(xid).cloned()
    }

    /// Stop tracking and forget its branches.
    pub fn untrack(&mut self, xid: &Xid) -> Option<Arc<Transaction>> {
        let transaction = self.transactions.remove(xid)?;
        self.branches.retain(|_, owner| owner != xid);
        self.remaining.remove(xid);
        Some(transaction)
    }

    /// Begin a stage: route `branches` to `xid` and mark them all outstanding.
    ///
    /// Calling it again for the same transaction resets the outstanding set.
    pub fn start_stage(&mut self, xid: &Xid, branches: impl IntoIterator<Item = Xid>) -> bool {
        if !self.transactions.contains_key(xid) {
            return false;
        }
        let branches: HashSet<Xid> = branches.into_iter().collect();
        for branch in &branches {
            self.branches.insert(branch.clone(), xid.clone());
        }
        self.remaining.insert(xid.clone(), branches);
        true
    }

    /// A stage was started for `xid` and not yet forgotten.
    pub fn in_stage(&self, xid: &Xid) -> bool {
        self.remaining.contains_key(xid)
    }

    /// Current stage has nothing outstanding.
    pub fn is_stage_complete(&self, xid: &Xid) -> bool {
        self.remaining.get(xid).is_some_and(HashSet::is_empty)
    }

    /// Transaction a branch belongs to, if tracked here.
    pub fn owner_of(&self, branch: &Xid) -> Option<Arc<Transaction>> {
        self.branches
            .get(branch)
            .and_then(|owner| self.transactions.get(owner))
            .cloned()
    }

    /// Apply a branch outcome.
    ///
    /// Returns the owning transaction exactly once: when this outcome
    /// finished the last outstanding branch of the stage.
    pub fn record(
        &mut self,
        branch: &Xid,
        outcome: BranchOutcome,
        phase: Phase,
    ) -> Option<Arc<Transaction>> {
        let transaction = self.owner_of(branch)?;
        transaction.mark_branch(branch, outcome);
        if !transaction.is_branch_finished(branch, phase) {
            return None;
        }

        let remaining = self.remaining.get_mut(transaction.xid())?;
        if remaining.remove(branch) && remaining.is_empty() {
            Some(transaction)
        } else {
            None
        }
    }

    /// Transactions past their deadline at `now`.
    pub fn expired(&self, now: u64) -> Vec<Arc<Transaction>> {
        self.transactions
            .values()
            .filter(|tx| tx.is_expired(now))
            .cloned()
            .collect()
    }

    /// Earliest creation time among tracked transactions.
    pub fn oldest_creation_time(&self) -> Option<u64> {
        self.transactions.values().map(|tx| tx.created_at()).min()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
