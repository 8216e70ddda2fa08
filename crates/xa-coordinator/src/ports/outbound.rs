//! Driven Ports (SPI - Outbound Dependencies)
//!
//! The coordinator never knows whether a resource is a local driver or a
//! remote coordinator: both are reached through these traits, and the
//! transport behind a peer is supplied by the embedding application.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared_types::{Decision, Vote, XaException, Xid};

use crate::domain::Phase;
use crate::error::JournalError;

/// Standard XA resource manager.
#[async_trait]
pub trait XaResource: Send + Sync {
    /// Associate work with a branch (`TMNOFLAGS` or `TMJOIN`).
    async fn start(&self, xid: &Xid, flags: i32) -> Result<(), XaException>;

    /// Dissociate work from a branch (`TMSUCCESS` or `TMFAIL`).
    async fn end(&self, xid: &Xid, flags: i32) -> Result<(), XaException>;

    /// Phase one.
    async fn prepare(&self, xid: &Xid) -> Result<Vote, XaException>;

    /// Phase two, commit.
    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaException>;

    /// Phase two, rollback.
    async fn rollback(&self, xid: &Xid) -> Result<(), XaException>;

    /// Discard knowledge of a heuristically completed branch.
    async fn forget(&self, xid: &Xid) -> Result<(), XaException>;

    /// In-doubt scan (`TMSTARTRSCAN`, `TMNOFLAGS`, `TMENDRSCAN`).
    async fn recover(&self, flags: i32) -> Result<Vec<Xid>, XaException>;
}

/// XA+ peer coordinator.
///
/// Outbound calls (`prepare`, `commit`, `rollback`) are orders from a
/// superior, which names itself so the subordinate knows where to report;
/// `ready`, `failed` and `done` are status reports from a subordinate;
/// `retry` asks a superior to re-send its decisions.
///
/// The superior is not always the owner of the global transaction id: in a
/// chain A → B → C, C reports to B.
#[async_trait]
pub trait XaPlusResource: Send + Sync {
    /// Order the peer to prepare its branch.
    async fn prepare(&self, xid: &Xid, superior_server_id: &str) -> Result<(), XaException>;

    /// Order the peer to commit its branch.
    async fn commit(&self, xid: &Xid, superior_server_id: &str) -> Result<(), XaException>;

    /// Order the peer to roll back its branch.
    async fn rollback(&self, xid: &Xid, superior_server_id: &str) -> Result<(), XaException>;

    /// Branch prepared successfully.
    async fn ready(&self, xid: &Xid) -> Result<(), XaException>;

    /// Branch could not finish `phase`.
    async fn failed(&self, xid: &Xid, phase: Phase) -> Result<(), XaException>;

    /// Branch completed durably.
    async fn done(&self, xid: &Xid) -> Result<(), XaException>;

    /// `server_id` has in-doubt branches and wants the decisions again.
    async fn retry(&self, server_id: &str) -> Result<(), XaException>;
}

/// Resolves a server id to a peer handle.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Handle for `server_id`.
    async fn connect(&self, server_id: &str) -> Result<Arc<dyn XaPlusResource>, XaException>;
}

/// One branch as written to the journal.
///
/// For XA+ branches the resource name is the peer's server id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchRecord {
    pub xid: Xid,
    pub resource_name: String,
}

impl BranchRecord {
    pub fn new(xid: Xid, resource_name: impl Into<String>) -> Self {
        Self {
            xid,
            resource_name: resource_name.into(),
        }
    }
}

/// Logged decisions without a completion: resource name → branch → decision.
pub type DanglingTransactions = HashMap<String, HashMap<Xid, Decision>>;

/// Outcome of a journal status lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// No completion recorded for the global transaction
    NotFound,
    /// The global transaction completed with this decision
    Completed(Decision),
}

/// Append-only decision log.
///
/// Writes must be durable before they return `Ok`.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Record the decision for every branch of a transaction.
    async fn log_decision(
        &self,
        branches: &[BranchRecord],
        decision: Decision,
    ) -> Result<(), JournalError>;

    /// Record that every branch reached the decided outcome.
    async fn log_completed(
        &self,
        branches: &[BranchRecord],
        decision: Decision,
    ) -> Result<(), JournalError>;

    /// Decisions logged before `cutoff_millis` that never completed.
    async fn find_dangling_transactions(
        &self,
        cutoff_millis: u64,
    ) -> Result<DanglingTransactions, JournalError>;

    /// Completion status of the global transaction `xid` belongs to.
    async fn find_transaction_status(&self, xid: &Xid) -> Result<TransactionStatus, JournalError>;

    /// Record the server that orders `branches` when it is not the owner of
    /// their global transaction id. Written before the branches prepare.
    async fn log_superior(
        &self,
        branches: &[BranchRecord],
        superior_server_id: &str,
    ) -> Result<(), JournalError>;

    /// Superior recorded by [`Journal::log_superior`] for a branch.
    async fn find_superior(&self, xid: &Xid) -> Result<Option<String>, JournalError>;
}
