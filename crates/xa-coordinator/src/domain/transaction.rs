//! The transaction aggregate.
//!
//! One global transaction as seen by this coordinator: its role, deadline,
//! result sink and the two branch collections. Branches are keyed by their
//! own xid, never linked to each other directly.
//!
//! ## Role
//!
//! | Superior server id of the xid | Role |
//! |-------------------------------|------|
//! | equals local server id | [`Role::Superior`] |
//! | anything else | [`Role::Subordinate`] |
//!
//! The role is fixed at construction.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shared_types::{current_time_millis, Decision, Xid};

use super::branch::{BranchOutcome, Phase, XaBranch, XaPlusBranch};
use super::result::{result_channel, ResultSink, TransactionFuture, TransactionResult};
use crate::ports::outbound::{BranchRecord, XaPlusResource, XaResource};

/// Which side of the XA+ tree this coordinator is on for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Owns the global decision
    Superior,
    /// Executes its branch on the superior's order
    Subordinate,
}

/// Snapshot of an XA branch for issuing a call.
#[derive(Clone)]
pub struct XaTarget {
    pub xid: Xid,
    pub resource_name: String,
    pub resource: Arc<dyn XaResource>,
    /// Prepare was attempted, whatever the answer
    pub prepared: bool,
    /// Prepare voted "yes" and the branch awaits phase two
    pub in_doubt: bool,
    pub read_only: bool,
}

/// Snapshot of an XA+ branch for issuing a call.
#[derive(Clone)]
pub struct PeerTarget {
    pub xid: Xid,
    pub server_id: String,
    pub peer: Arc<dyn XaPlusResource>,
}

struct TransactionState {
    superior: String,
    xa_branches: BTreeMap<Xid, XaBranch>,
    xaplus_branches: BTreeMap<Xid, XaPlusBranch>,
    rollback_only: bool,
    rollback_ordered: bool,
    decision: Option<Decision>,
    closed: bool,
    future: Option<TransactionFuture>,
}

/// One global transaction.
pub struct Transaction {
    xid: Xid,
    role: Role,
    created_at: u64,
    expires_at: u64,
    sink: ResultSink,
    state: Mutex<TransactionState>,
}

impl Transaction {
    /// Create a transaction; the role follows from `local_server_id`.
    pub fn new(xid: Xid, local_server_id: &str, timeout: Duration) -> Self {
        let created_at = current_time_millis();
        let role = if xid.superior_server_id() == local_server_id {
            Role::Superior
        } else {
            Role::Subordinate
        };
        let (sink, future) = result_channel(xid.clone());
        let superior = xid.superior_server_id().to_string();

        Self {
            xid,
            role,
            created_at,
            expires_at: created_at.saturating_add(timeout.as_millis() as u64),
            sink,
            state: Mutex::new(TransactionState {
                superior,
                xa_branches: BTreeMap::new(),
                xaplus_branches: BTreeMap::new(),
                rollback_only: false,
                rollback_ordered: false,
                decision: None,
                closed: false,
                future: Some(future),
            }),
        }
    }

    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_superior(&self) -> bool {
        self.role == Role::Superior
    }

    pub fn is_subordinate(&self) -> bool {
        self.role == Role::Subordinate
    }

    /// Server whose orders this transaction follows and that receives its
    /// reports. Starts as the owner of the global transaction id.
    pub fn superior_server_id(&self) -> String {
        self.state.lock().superior.clone()
    }

    /// The superior named by an order; differs from the owner of the global
    /// transaction id when the branch was delegated further down.
    pub fn set_superior(&self, server_id: &str) {
        self.state.lock().superior = server_id.to_string();
    }

    /// Orders come from a server other than the owner of the global id.
    pub fn is_nested(&self) -> bool {
        self.state.lock().superior != self.xid.superior_server_id()
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    // --- enlistment -------------------------------------------------------

    /// Add an XA branch; false once the transaction is closed.
    pub fn add_xa_branch(&self, branch: XaBranch) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.xa_branches.insert(branch.xid.clone(), branch);
        true
    }

    /// Add an XA+ branch; false once the transaction is closed.
    pub fn add_xaplus_branch(&self, branch: XaPlusBranch) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.xaplus_branches.insert(branch.xid.clone(), branch);
        true
    }

    /// Resource handle already enlisted under `resource_name`.
    pub fn enlisted_resource(&self, resource_name: &str) -> Option<Arc<dyn XaResource>> {
        self.state
            .lock()
            .xa_branches
            .values()
            .find(|b| b.resource_name == resource_name)
            .map(|b| b.resource.clone())
    }

    pub fn branch_count(&self) -> usize {
        let state = self.state.lock();
        state.xa_branches.len() + state.xaplus_branches.len()
    }

    pub fn branch_xids(&self) -> Vec<Xid> {
        let state = self.state.lock();
        state
            .xa_branches
            .keys()
            .chain(state.xaplus_branches.keys())
            .cloned()
            .collect()
    }

    pub fn has_branch(&self, xid: &Xid) -> bool {
        let state = self.state.lock();
        state.xa_branches.contains_key(xid) || state.xaplus_branches.contains_key(xid)
    }

    pub fn xa_targets(&self) -> Vec<XaTarget> {
        self.state
            .lock()
            .xa_branches
            .values()
            .map(|b| XaTarget {
                xid: b.xid.clone(),
                resource_name: b.resource_name.clone(),
                resource: b.resource.clone(),
                prepared: b.flags.prepared(),
                in_doubt: b.flags.prepared() && !b.flags.failed(Phase::Prepare),
                read_only: b.flags.read_only(),
            })
            .collect()
    }

    pub fn peer_targets(&self) -> Vec<PeerTarget> {
        self.state
            .lock()
            .xaplus_branches
            .values()
            .map(|b| PeerTarget {
                xid: b.xid.clone(),
                server_id: b.server_id.clone(),
                peer: b.peer.clone(),
            })
            .collect()
    }

    /// Journal view of every branch.
    pub fn branch_records(&self) -> Vec<BranchRecord> {
        let state = self.state.lock();
        state
            .xa_branches
            .values()
            .map(|b| BranchRecord::new(b.xid.clone(), b.resource_name.clone()))
            .chain(
                state
                    .xaplus_branches
                    .values()
                    .map(|b| BranchRecord::new(b.xid.clone(), b.server_id.clone())),
            )
            .collect()
    }

    // --- branch progress --------------------------------------------------

    /// Apply an outcome to a branch; false if the branch is unknown.
    pub fn mark_branch(&self, xid: &Xid, outcome: BranchOutcome) -> bool {
        let mut state = self.state.lock();
        if let Some(branch) = state.xa_branches.get_mut(xid) {
            branch.apply(outcome);
            return true;
        }
        if let Some(branch) = state.xaplus_branches.get_mut(xid) {
            branch.apply(outcome);
            return true;
        }
        false
    }

    /// Branch needs nothing more in `phase`.
    pub fn is_branch_finished(&self, xid: &Xid, phase: Phase) -> bool {
        let state = self.state.lock();
        if let Some(branch) = state.xa_branches.get(xid) {
            return branch.is_finished(phase);
        }
        state
            .xaplus_branches
            .get(xid)
            .is_some_and(|b| b.is_finished(phase))
    }

    /// Every branch is finished in `phase`.
    pub fn is_phase_complete(&self, phase: Phase) -> bool {
        let state = self.state.lock();
        state.xa_branches.values().all(|b| b.is_finished(phase))
            && state.xaplus_branches.values().all(|b| b.is_finished(phase))
    }

    /// All branches committed and every peer confirmed `done`.
    pub fn is_commit_done(&self) -> bool {
        self.is_phase_complete(Phase::Commit)
    }

    /// All branches rolled back and every peer confirmed `done`.
    pub fn is_rollback_done(&self) -> bool {
        self.is_phase_complete(Phase::Rollback)
    }

    /// Branches that failed in `phase`.
    pub fn failed_branches(&self, phase: Phase) -> Vec<Xid> {
        let state = self.state.lock();
        state
            .xa_branches
            .values()
            .filter(|b| b.flags.failed(phase))
            .map(|b| b.xid.clone())
            .chain(
                state
                    .xaplus_branches
                    .values()
                    .filter(|b| b.flags.failed(phase))
                    .map(|b| b.xid.clone()),
            )
            .collect()
    }

    pub fn has_failures(&self, phase: Phase) -> bool {
        !self.failed_branches(phase).is_empty()
    }

    // --- flags ------------------------------------------------------------

    /// Local vote is "no".
    pub fn set_rollback_only(&self) {
        self.state.lock().rollback_only = true;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.state.lock().rollback_only
    }

    /// Superior already ordered rollback.
    pub fn set_rollback_ordered(&self) {
        self.state.lock().rollback_ordered = true;
    }

    pub fn is_rollback_ordered(&self) -> bool {
        self.state.lock().rollback_ordered
    }

    /// Record the global decision; false if one was already recorded.
    pub fn record_decision(&self, decision: Decision) -> bool {
        let mut state = self.state.lock();
        if state.decision.is_some() {
            return false;
        }
        state.decision = Some(decision);
        true
    }

    pub fn decision(&self) -> Option<Decision> {
        self.state.lock().decision
    }

    // --- lifecycle --------------------------------------------------------

    /// Hand the caller-facing future out; only the first call gets it.
    pub fn take_future(&self) -> Option<TransactionFuture> {
        self.state.lock().future.take()
    }

    /// Put the terminal result; false if one was already delivered.
    pub fn deliver(&self, result: TransactionResult) -> bool {
        self.sink.deliver(result)
    }

    pub fn is_delivered(&self) -> bool {
        self.sink.is_delivered()
    }

    /// No more enlistment.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Transaction")
            .field("xid", &self.xid)
            .field("role", &self.role)
            .field("expires_at", &self.expires_at)
            .field("xa_branches", &state.xa_branches.len())
            .field("xaplus_branches", &state.xaplus_branches.len())
            .field("decision", &state.decision)
            .field("closed", &state.closed)
            .finish()
    }
}
