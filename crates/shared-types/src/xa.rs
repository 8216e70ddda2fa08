//! # XA Protocol Constants
//!
//! Flags, return codes and the two small enums every component speaks:
//! [`Vote`] (result of a prepare) and [`Decision`] (outcome of a transaction).

use std::fmt;

use serde::{Deserialize, Serialize};

// Flags
/// No flags.
pub const TMNOFLAGS: i32 = 0x0000_0000;
/// Join an existing branch.
pub const TMJOIN: i32 = 0x0020_0000;
/// End a recovery scan.
pub const TMENDRSCAN: i32 = 0x0080_0000;
/// Start a recovery scan.
pub const TMSTARTRSCAN: i32 = 0x0100_0000;
/// Dissociate successfully.
pub const TMSUCCESS: i32 = 0x0400_0000;
/// Dissociate and mark rollback-only.
pub const TMFAIL: i32 = 0x2000_0000;
/// One-phase commit.
pub const TMONEPHASE: i32 = 0x4000_0000;

// Return codes
/// Normal completion.
pub const XA_OK: i32 = 0;
/// Branch was read-only and has been committed.
pub const XA_RDONLY: i32 = 3;
/// Routine returned with no effect and may be reissued.
pub const XA_RETRY: i32 = 4;
/// Branch was partially committed and partially rolled back.
pub const XA_HEURMIX: i32 = 5;
/// Branch was heuristically rolled back.
pub const XA_HEURRB: i32 = 6;
/// Branch was heuristically committed.
pub const XA_HEURCOM: i32 = 7;
/// Branch may have been heuristically completed.
pub const XA_HEURHAZ: i32 = 8;
/// Lower bound of the rollback codes.
pub const XA_RBBASE: i32 = 100;
/// Rollback for an unspecified reason.
pub const XA_RBROLLBACK: i32 = XA_RBBASE;
/// Rollback caused by a communication failure.
pub const XA_RBCOMMFAIL: i32 = XA_RBBASE + 1;
/// Rollback caused by a deadlock.
pub const XA_RBDEADLOCK: i32 = XA_RBBASE + 2;
/// Rollback caused by an integrity violation.
pub const XA_RBINTEGRITY: i32 = XA_RBBASE + 3;
/// Rollback for a reason not listed.
pub const XA_RBOTHER: i32 = XA_RBBASE + 4;
/// Protocol error in the resource manager.
pub const XA_RBPROTO: i32 = XA_RBBASE + 5;
/// Branch took too long.
pub const XA_RBTIMEOUT: i32 = XA_RBBASE + 6;
/// Branch may be retried.
pub const XA_RBTRANSIENT: i32 = XA_RBBASE + 7;
/// Upper bound of the rollback codes.
pub const XA_RBEND: i32 = XA_RBTRANSIENT;
/// Asynchronous operation already outstanding.
pub const XAER_ASYNC: i32 = -2;
/// Resource manager error.
pub const XAER_RMERR: i32 = -3;
/// Unknown xid.
pub const XAER_NOTA: i32 = -4;
/// Invalid arguments.
pub const XAER_INVAL: i32 = -5;
/// Routine invoked in an improper context.
pub const XAER_PROTO: i32 = -6;
/// Resource manager unavailable.
pub const XAER_RMFAIL: i32 = -7;
/// Xid already exists.
pub const XAER_DUPID: i32 = -8;
/// Resource manager doing work outside the transaction.
pub const XAER_OUTSIDE: i32 = -9;

/// Symbolic name of an XA return code.
pub fn xa_code_name(code: i32) -> &'static str {
    match code {
        XA_OK => "XA_OK",
        XA_RDONLY => "XA_RDONLY",
        XA_RETRY => "XA_RETRY",
        XA_HEURMIX => "XA_HEURMIX",
        XA_HEURRB => "XA_HEURRB",
        XA_HEURCOM => "XA_HEURCOM",
        XA_HEURHAZ => "XA_HEURHAZ",
        XA_RBROLLBACK => "XA_RBROLLBACK",
        XA_RBCOMMFAIL => "XA_RBCOMMFAIL",
        XA_RBDEADLOCK => "XA_RBDEADLOCK",
        XA_RBINTEGRITY => "XA_RBINTEGRITY",
        XA_RBOTHER => "XA_RBOTHER",
        XA_RBPROTO => "XA_RBPROTO",
        XA_RBTIMEOUT => "XA_RBTIMEOUT",
        XA_RBTRANSIENT => "XA_RBTRANSIENT",
        XAER_ASYNC => "XAER_ASYNC",
        XAER_RMERR => "XAER_RMERR",
        XAER_NOTA => "XAER_NOTA",
        XAER_INVAL => "XAER_INVAL",
        XAER_PROTO => "XAER_PROTO",
        XAER_RMFAIL => "XAER_RMFAIL",
        XAER_DUPID => "XAER_DUPID",
        XAER_OUTSIDE => "XAER_OUTSIDE",
        _ => "UNKNOWN",
    }
}

/// Result of a successful prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    /// Branch is prepared and must be committed or rolled back.
    Prepared,
    /// Branch did no updates and is already complete.
    ReadOnly,
}

impl Vote {
    /// XA return code for this vote.
    pub fn code(self) -> i32 {
        match self {
            Vote::Prepared => XA_OK,
            Vote::ReadOnly => XA_RDONLY,
        }
    }

    /// Map an XA return code to a vote.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            XA_OK => Some(Vote::Prepared),
            XA_RDONLY => Some(Vote::ReadOnly),
            _ => None,
        }
    }
}

/// Global outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    /// All branches commit.
    Commit,
    /// All branches roll back.
    Rollback,
}

impl Decision {
    /// True for [`Decision::Commit`].
    pub fn is_commit(self) -> bool {
        matches!(self, Decision::Commit)
    }

    /// Heuristic code that means a branch already reached this outcome on its own.
    pub fn matching_heuristic(self) -> i32 {
        match self {
            Decision::Commit => XA_HEURCOM,
            Decision::Rollback => XA_HEURRB,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Commit => write!(f, "commit"),
            Decision::Rollback => write!(f, "rollback"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_codes() {
        assert_eq!(Vote::from_code(XA_OK), Some(Vote::Prepared));
        assert_eq!(Vote::from_code(XA_RDONLY), Some(Vote::ReadOnly));
        assert_eq!(Vote::from_code(XA_RBROLLBACK), None);
        assert_eq!(Vote::ReadOnly.code(), XA_RDONLY);
    }

    #[test]
    fn test_code_names() {
        assert_eq!(xa_code_name(XAER_NOTA), "XAER_NOTA");
        assert_eq!(xa_code_name(XA_RBTIMEOUT), "XA_RBTIMEOUT");
        assert_eq!(xa_code_name(42), "UNKNOWN");
    }

    #[test]
    fn test_decision_heuristics() {
        assert_eq!(Decision::Commit.matching_heuristic(), XA_HEURCOM);
        assert_eq!(Decision::Rollback.matching_heuristic(), XA_HEURRB);
        assert_eq!(Decision::Rollback.to_string(), "rollback");
    }
}
