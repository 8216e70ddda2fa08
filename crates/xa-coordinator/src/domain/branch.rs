//! Branch state.
//!
//! Flags only ever go from `false` to `true`. A failure is recorded per phase
//! and also counts as reaching that phase, so aggregate checks can tell
//! "every branch answered" apart from "every branch succeeded".

use std::fmt;
use std::sync::Arc;

use shared_types::{Decision, Xid};

use crate::ports::outbound::{XaPlusResource, XaResource};

/// Protocol phase a branch outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Prepare,
    Commit,
    Rollback,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Prepare => write!(f, "prepare"),
            Phase::Commit => write!(f, "commit"),
            Phase::Rollback => write!(f, "rollback"),
        }
    }
}

impl From<Decision> for Phase {
    /// Phase two that carries out `decision`.
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Commit => Phase::Commit,
            Decision::Rollback => Phase::Rollback,
        }
    }
}

/// Something a branch reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOutcome {
    /// Local prepare returned a vote
    Prepared { read_only: bool },
    /// Peer reported `ready`
    Readied,
    /// Commit call returned
    Committed,
    /// Rollback call returned
    RolledBack,
    /// Phase call failed, or the peer reported `failed`
    Failed(Phase),
    /// Peer reported `done`
    Done,
}

/// Monotonic phase flags of one branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchFlags {
    prepared: bool,
    committed: bool,
    rolled_back: bool,
    read_only: bool,
    prepare_failed: bool,
    commit_failed: bool,
    rollback_failed: bool,
}

impl BranchFlags {
    pub fn prepared(&self) -> bool {
        self.prepared
    }

    pub fn committed(&self) -> bool {
        self.committed
    }

    pub fn rolled_back(&self) -> bool {
        self.rolled_back
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Branch answered in `phase`, successfully or not.
    pub fn reached(&self, phase: Phase) -> bool {
        match phase {
            Phase::Prepare => self.prepared,
            Phase::Commit => self.committed,
            Phase::Rollback => self.rolled_back,
        }
    }

    /// Branch failed in `phase`.
    pub fn failed(&self, phase: Phase) -> bool {
        match phase {
            Phase::Prepare => self.prepare_failed,
            Phase::Commit => self.commit_failed,
            Phase::Rollback => self.rollback_failed,
        }
    }

    pub(crate) fn mark_prepared(&mut self, read_only: bool) {
        self.prepared = true;
        self.read_only |= read_only;
    }

    pub(crate) fn mark_reached(&mut self, phase: Phase) {
        match phase {
            Phase::Prepare => self.prepared = true,
            Phase::Commit => self.committed = true,
            Phase::Rollback => self.rolled_back = true,
        }
    }

    pub(crate) fn mark_failed(&mut self, phase: Phase) {
        self.mark_reached(phase);
        match phase {
            Phase::Prepare => self.prepare_failed = true,
            Phase::Commit => self.commit_failed = true,
            Phase::Rollback => self.rollback_failed = true,
        }
    }
}

/// Branch on a local XA resource.
pub struct XaBranch {
    pub xid: Xid,
    pub resource_name: String,
    pub resource: Arc<dyn XaResource>,
    pub flags: BranchFlags,
}

impl XaBranch {
    pub fn new(xid: Xid, resource_name: impl Into<String>, resource: Arc<dyn XaResource>) -> Self {
        Self {
            xid,
            resource_name: resource_name.into(),
            resource,
            flags: BranchFlags::default(),
        }
    }

    pub(crate) fn apply(&mut self, outcome: BranchOutcome) {
        match outcome {
            BranchOutcome::Prepared { read_only } => self.flags.mark_prepared(read_only),
            BranchOutcome::Committed => self.flags.mark_reached(Phase::Commit),
            BranchOutcome::RolledBack => self.flags.mark_reached(Phase::Rollback),
            BranchOutcome::Failed(phase) => self.flags.mark_failed(phase),
            // peer-only signals
            BranchOutcome::Readied | BranchOutcome::Done => {}
        }
    }

    /// Finished for `phase`: answered, or never needed because it was read-only.
    pub fn is_finished(&self, phase: Phase) -> bool {
        self.flags.reached(phase) || (phase != Phase::Prepare && self.flags.read_only())
    }
}

impl fmt::Debug for XaBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XaBranch")
            .field("xid", &self.xid)
            .field("resource_name", &self.resource_name)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Branch delegated to a peer coordinator.
///
/// `readied` and `done` are the peer's acknowledgements. A returned commit or
/// rollback call only means the order was delivered; the branch is retired
/// once the peer also reports `done`.
pub struct XaPlusBranch {
    pub xid: Xid,
    pub server_id: String,
    pub peer: Arc<dyn XaPlusResource>,
    pub flags: BranchFlags,
    pub readied: bool,
    pub done: bool,
}

impl XaPlusBranch {
    pub fn new(xid: Xid, server_id: impl Into<String>, peer: Arc<dyn XaPlusResource>) -> Self {
        Self {
            xid,
            server_id: server_id.into(),
            peer,
            flags: BranchFlags::default(),
            readied: false,
            done: false,
        }
    }

    pub(crate) fn apply(&mut self, outcome: BranchOutcome) {
        match outcome {
            BranchOutcome::Prepared { read_only } => self.flags.mark_prepared(read_only),
            BranchOutcome::Readied => {
                self.readied = true;
                self.flags.mark_prepared(false);
            }
            BranchOutcome::Committed => self.flags.mark_reached(Phase::Commit),
            BranchOutcome::RolledBack => self.flags.mark_reached(Phase::Rollback),
            BranchOutcome::Failed(phase) => {
                self.flags.mark_failed(phase);
                // no done will follow a phase-two failure
                if phase != Phase::Prepare {
                    self.done = true;
                }
            }
            BranchOutcome::Done => self.done = true,
        }
    }

    pub fn is_finished(&self, phase: Phase) -> bool {
        match phase {
            Phase::Prepare => self.flags.prepared(),
            _ => self.flags.reached(phase) && self.done,
        }
    }
}

impl fmt::Debug for XaPlusBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XaPlusBranch")
            .field("xid", &self.xid)
            .field("server_id", &self.server_id)
            .field("flags", &self.flags)
            .field("readied", &self.readied)
            .field("done", &self.done)
            .finish()
    }
}
