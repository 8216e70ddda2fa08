//! Volatile journal.
//!
//! Keeps every write in order so tests can check exactly what was logged, and
//! answers dangling and status queries from that history. Superior records
//! live apart from decisions and completions.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::{current_time_millis, Decision, Xid};
use tracing::debug;

use crate::error::JournalError;
use crate::ports::outbound::{BranchRecord, DanglingTransactions, Journal, TransactionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Decision,
    Completed,
}

/// One journal write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalWrite {
    pub kind: WriteKind,
    pub decision: Decision,
    pub records: Vec<BranchRecord>,
    pub logged_at: u64,
}

#[derive(Default)]
struct JournalState {
    writes: Vec<JournalWrite>,
    superiors: HashMap<Xid, String>,
    fail_writes: bool,
    fail_queries: bool,
}

#[derive(Default)]
pub struct InMemoryJournal {
    state: Mutex<JournalState>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until switched off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Make every query fail until switched off.
    pub fn set_fail_queries(&self, fail: bool) {
        self.state.lock().fail_queries = fail;
    }

    /// Insert a decision with an explicit timestamp, as if logged before a crash.
    pub fn seed_decision(&self, records: Vec<BranchRecord>, decision: Decision, logged_at: u64) {
        self.state.lock().writes.push(JournalWrite {
            kind: WriteKind::Decision,
            decision,
            records,
            logged_at,
        });
    }

    /// Superior recorded for `xid`, without going through the trait.
    pub fn superior_of(&self, xid: &Xid) -> Option<String> {
        self.state.lock().superiors.get(xid).cloned()
    }

    pub fn writes(&self) -> Vec<JournalWrite> {
        self.state.lock().writes.clone()
    }

    pub fn decisions(&self) -> Vec<JournalWrite> {
        self.writes_of(WriteKind::Decision)
    }

    pub fn completions(&self) -> Vec<JournalWrite> {
        self.writes_of(WriteKind::Completed)
    }

    fn writes_of(&self, kind: WriteKind) -> Vec<JournalWrite> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.kind == kind)
            .cloned()
            .collect()
    }

    fn append(
        &self,
        kind: WriteKind,
        records: &[BranchRecord],
        decision: Decision,
    ) -> Result<(), JournalError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(JournalError::WriteFailed("journal unavailable".to_string()));
        }
        state.writes.push(JournalWrite {
            kind,
            decision,
            records: records.to_vec(),
            logged_at: current_time_millis(),
        });
        debug!(kind = ?kind, %decision, branches = records.len(), "Journal write");
        Ok(())
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn log_decision(
        &self,
        branches: &[BranchRecord],
        decision: Decision,
    ) -> Result<(), JournalError> {
        self.append(WriteKind::Decision, branches, decision)
    }

    async fn log_completed(
        &self,
        branches: &[BranchRecord],
        decision: Decision,
    ) -> Result<(), JournalError> {
        self.append(WriteKind::Completed, branches, decision)
    }

    async fn find_dangling_transactions(
        &self,
        cutoff_millis: u64,
    ) -> Result<DanglingTransactions, JournalError> {
        let state = self.state.lock();
        if state.fail_queries {
            return Err(JournalError::QueryFailed("journal unavailable".to_string()));
        }

        let completed: HashSet<&Xid> = state
            .writes
            .iter()
            .filter(|w| w.kind == WriteKind::Completed)
            .flat_map(|w| w.records.iter().map(|r| &r.xid))
            .collect();

        let mut dangling = DanglingTransactions::new();
        for write in state
            .writes
            .iter()
            .filter(|w| w.kind == WriteKind::Decision && w.logged_at < cutoff_millis)
        {
            for record in write.records.iter().filter(|r| !completed.contains(&r.xid)) {
                dangling
                    .entry(record.resource_name.clone())
                    .or_default()
                    .insert(record.xid.clone(), write.decision);
            }
        }
        Ok(dangling)
    }

    async fn find_transaction_status(&self, xid: &Xid) -> Result<TransactionStatus, JournalError> {
        let state = self.state.lock();
        if state.fail_queries {
            return Err(JournalError::QueryFailed("journal unavailable".to_string()));
        }

        let status = state
            .writes
            .iter()
            .rev()
            .filter(|w| w.kind == WriteKind::Completed)
            .find(|w| w.records.iter().any(|r| r.xid.is_same_global(xid)))
            .map(|w| TransactionStatus::Completed(w.decision))
            .unwrap_or(TransactionStatus::NotFound);
        Ok(status)
    }

    async fn log_superior(
        &self,
        branches: &[BranchRecord],
        superior_server_id: &str,
    ) -> Result<(), JournalError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(JournalError::WriteFailed("journal unavailable".to_string()));
        }
        for record in branches {
            state
                .superiors
                .insert(record.xid.clone(), superior_server_id.to_string());
        }
        debug!(superior = %superior_server_id, branches = branches.len(), "Superior recorded");
        Ok(())
    }

    async fn find_superior(&self, xid: &Xid) -> Result<Option<String>, JournalError> {
        let state = self.state.lock();
        if state.fail_queries {
            return Err(JournalError::QueryFailed("journal unavailable".to_string()));
        }
        Ok(state.superiors.get(xid).cloned())
    }
}
