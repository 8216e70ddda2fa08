//! # Coordinator Events
//!
//! Every message that flows between the coordination services.
//!
//! ## Pipeline (superior)
//!
//! ```text
//! CommitRequested ─→ Preparer ──(branch calls)──→ BranchPrepared / PrepareBranchFailed
//!                        │                        BranchReadied / BranchFailed (peers)
//!                        ▼
//!          LogCommitDecision | LogRollbackDecision ─→ DecisionLogger
//!                        │
//!                        ▼
//!          CommitDecisionLogged | RollbackDecisionLogged ─→ Committer | Rollback
//!                        │
//!                        ▼
//!          CommitCompleted | RollbackCompleted ─→ Completer ─→ TwoPcDone | RollbackDone
//!                                                                  │
//!                                                                  ▼
//!                                                       Manager delivers result
//! ```
//!
//! Transaction-level events carry the shared aggregate; branch-level events
//! carry the branch xid and are routed by whichever service tracks it.

use std::sync::Arc;

use shared_bus::{BusEvent, InMemoryEventBus};
use shared_types::{Decision, XaException, Xid};

use crate::domain::{Phase, Transaction};
use crate::ports::outbound::DanglingTransactions;

/// The bus type every service shares.
pub type EventBus = InMemoryEventBus<TxEvent>;

/// Subscription filter keyed by event kind.
pub type EventFilter = shared_bus::EventFilter<EventKind>;

/// All coordinator events.
#[derive(Debug, Clone)]
pub enum TxEvent {
    // =========================================================================
    // USER REQUESTS
    // =========================================================================
    /// A transaction was begun or joined.
    TransactionCreated { transaction: Arc<Transaction> },
    /// User asked to commit.
    CommitRequested { transaction: Arc<Transaction> },
    /// User asked to roll back.
    RollbackRequested { transaction: Arc<Transaction> },

    // =========================================================================
    // ORDERS FROM A SUPERIOR
    // =========================================================================
    /// `superior` is the server that sent the order and receives the reports.
    PrepareOrder { xid: Xid, superior: String },
    CommitOrder { xid: Xid, superior: String },
    RollbackOrder { xid: Xid, superior: String },

    // =========================================================================
    // PHASE ONE
    // =========================================================================
    /// Local request and superior's prepare order have both arrived.
    SubordinatePrepareRequested { transaction: Arc<Transaction> },
    /// Subordinate finished phase one and told its superior.
    PrepareReported {
        transaction: Arc<Transaction>,
        readied: bool,
    },
    BranchPrepared { xid: Xid, read_only: bool },
    PrepareBranchFailed { xid: Xid, error: XaException },
    /// Peer reported `ready`.
    BranchReadied { xid: Xid },
    /// Peer reported `failed` for `phase`.
    BranchFailed { xid: Xid, phase: Phase },

    // =========================================================================
    // DECISION
    // =========================================================================
    LogCommitDecision { transaction: Arc<Transaction> },
    LogRollbackDecision { transaction: Arc<Transaction> },
    CommitDecisionLogged { transaction: Arc<Transaction> },
    RollbackDecisionLogged { transaction: Arc<Transaction> },

    // =========================================================================
    // PHASE TWO
    // =========================================================================
    BranchCommitted { xid: Xid },
    CommitBranchFailed { xid: Xid, error: XaException },
    BranchRolledBack { xid: Xid },
    RollbackBranchFailed { xid: Xid, error: XaException },
    /// Peer reported `done`.
    BranchDone { xid: Xid },
    CommitCompleted { transaction: Arc<Transaction> },
    RollbackCompleted { transaction: Arc<Transaction> },

    // =========================================================================
    // TERMINAL
    // =========================================================================
    TwoPcDone { transaction: Arc<Transaction> },
    TwoPcFailed {
        transaction: Arc<Transaction>,
        reason: String,
    },
    RollbackDone { transaction: Arc<Transaction> },
    RollbackFailed {
        transaction: Arc<Transaction>,
        reason: String,
    },
    TransactionTimedOut { transaction: Arc<Transaction> },

    // =========================================================================
    // TIMER
    // =========================================================================
    /// Timer stopped tracking after a terminal event.
    TimerCancelled { xid: Xid },
    /// Periodic sweep; `now` in epoch millis.
    TimerTick { now: u64 },

    // =========================================================================
    // RECOVERY
    // =========================================================================
    StartRecovery,
    RecoveryRequested { inflight_cutoff: u64 },
    DanglingTransactionsFound {
        round: u64,
        dangling: DanglingTransactions,
    },
    DanglingQueryFailed { round: u64, error: String },
    ResourceRecovered {
        round: u64,
        resource_name: String,
        xids: Vec<Xid>,
    },
    ResourceRecoveryFailed {
        round: u64,
        resource_name: String,
        error: XaException,
    },
    RecoveredXidCommitted { xid: Xid, resource_name: String },
    RecoveredXidRolledBack { xid: Xid, resource_name: String },
    RecoveredXidFailed {
        xid: Xid,
        resource_name: String,
        decision: Decision,
        error: XaException,
    },
    /// A subordinate asked for its decisions again.
    RetryReceived { server_id: String },
    RedeliverDecisions {
        server_id: String,
        inflight_cutoff: u64,
    },
    RecoveryFinished { round: u64, succeeded: bool },
}

/// Discriminant of [`TxEvent`], used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TransactionCreated,
    CommitRequested,
    RollbackRequested,
    PrepareOrder,
    CommitOrder,
    RollbackOrder,
    SubordinatePrepareRequested,
    PrepareReported,
    BranchPrepared,
    PrepareBranchFailed,
    BranchReadied,
    BranchFailed,
    LogCommitDecision,
    LogRollbackDecision,
    CommitDecisionLogged,
    RollbackDecisionLogged,
    BranchCommitted,
    CommitBranchFailed,
    BranchRolledBack,
    RollbackBranchFailed,
    BranchDone,
    CommitCompleted,
    RollbackCompleted,
    TwoPcDone,
    TwoPcFailed,
    RollbackDone,
    RollbackFailed,
    TransactionTimedOut,
    TimerCancelled,
    TimerTick,
    StartRecovery,
    RecoveryRequested,
    DanglingTransactionsFound,
    DanglingQueryFailed,
    ResourceRecovered,
    ResourceRecoveryFailed,
    RecoveredXidCommitted,
    RecoveredXidRolledBack,
    RecoveredXidFailed,
    RetryReceived,
    RedeliverDecisions,
    RecoveryFinished,
}

impl EventKind {
    /// Events after which nothing more happens to a transaction.
    pub const TERMINAL: [EventKind; 5] = [
        EventKind::TwoPcDone,
        EventKind::TwoPcFailed,
        EventKind::RollbackDone,
        EventKind::RollbackFailed,
        EventKind::TransactionTimedOut,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

impl TxEvent {
    /// Transaction carried by transaction-level events.
    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        match self {
            TxEvent::TransactionCreated { transaction }
            | TxEvent::CommitRequested { transaction }
            | TxEvent::RollbackRequested { transaction }
            | TxEvent::SubordinatePrepareRequested { transaction }
            | TxEvent::PrepareReported { transaction, .. }
            | TxEvent::LogCommitDecision { transaction }
            | TxEvent::LogRollbackDecision { transaction }
            | TxEvent::CommitDecisionLogged { transaction }
            | TxEvent::RollbackDecisionLogged { transaction }
            | TxEvent::CommitCompleted { transaction }
            | TxEvent::RollbackCompleted { transaction }
            | TxEvent::TwoPcDone { transaction }
            | TxEvent::TwoPcFailed { transaction, .. }
            | TxEvent::RollbackDone { transaction }
            | TxEvent::RollbackFailed { transaction, .. }
            | TxEvent::TransactionTimedOut { transaction } => Some(transaction),
            _ => None,
        }
    }
}

impl TxEvent {
    /// Transaction of a terminal event.
    pub fn terminal_transaction(&self) -> Option<&Arc<Transaction>> {
        if self.kind().is_terminal() {
            self.transaction()
        } else {
            None
        }
    }
}

impl BusEvent for TxEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            TxEvent::TransactionCreated { .. } => EventKind::TransactionCreated,
            TxEvent::CommitRequested { .. } => EventKind::CommitRequested,
            TxEvent::RollbackRequested { .. } => EventKind::RollbackRequested,
            TxEvent::PrepareOrder { .. } => EventKind::PrepareOrder,
            TxEvent::CommitOrder { .. } => EventKind::CommitOrder,
            TxEvent::RollbackOrder { .. } => EventKind::RollbackOrder,
            TxEvent::SubordinatePrepareRequested { .. } => EventKind::SubordinatePrepareRequested,
            TxEvent::PrepareReported { .. } => EventKind::PrepareReported,
            TxEvent::BranchPrepared { .. } => EventKind::BranchPrepared,
            TxEvent::PrepareBranchFailed { .. } => EventKind::PrepareBranchFailed,
            TxEvent::BranchReadied { .. } => EventKind::BranchReadied,
            TxEvent::BranchFailed { .. } => EventKind::BranchFailed,
            TxEvent::LogCommitDecision { .. } => EventKind::LogCommitDecision,
            TxEvent::LogRollbackDecision { .. } => EventKind::LogRollbackDecision,
            TxEvent::CommitDecisionLogged { .. } => EventKind::CommitDecisionLogged,
            TxEvent::RollbackDecisionLogged { .. } => EventKind::RollbackDecisionLogged,
            TxEvent::BranchCommitted { .. } => EventKind::BranchCommitted,
            TxEvent::CommitBranchFailed { .. } => EventKind::CommitBranchFailed,
            TxEvent::BranchRolledBack { .. } => EventKind::BranchRolledBack,
            TxEvent::RollbackBranchFailed { .. } => EventKind::RollbackBranchFailed,
            TxEvent::BranchDone { .. } => EventKind::BranchDone,
            TxEvent::CommitCompleted { .. } => EventKind::CommitCompleted,
            TxEvent::RollbackCompleted { .. } => EventKind::RollbackCompleted,
            TxEvent::TwoPcDone { .. } => EventKind::TwoPcDone,
            TxEvent::TwoPcFailed { .. } => EventKind::TwoPcFailed,
            TxEvent::RollbackDone { .. } => EventKind::RollbackDone,
            TxEvent::RollbackFailed { .. } => EventKind::RollbackFailed,
            TxEvent::TransactionTimedOut { .. } => EventKind::TransactionTimedOut,
            TxEvent::TimerCancelled { .. } => EventKind::TimerCancelled,
            TxEvent::TimerTick { .. } => EventKind::TimerTick,
            TxEvent::StartRecovery => EventKind::StartRecovery,
            TxEvent::RecoveryRequested { .. } => EventKind::RecoveryRequested,
            TxEvent::DanglingTransactionsFound { .. } => EventKind::DanglingTransactionsFound,
            TxEvent::DanglingQueryFailed { .. } => EventKind::DanglingQueryFailed,
            TxEvent::ResourceRecovered { .. } => EventKind::ResourceRecovered,
            TxEvent::ResourceRecoveryFailed { .. } => EventKind::ResourceRecoveryFailed,
            TxEvent::RecoveredXidCommitted { .. } => EventKind::RecoveredXidCommitted,
            TxEvent::RecoveredXidRolledBack { .. } => EventKind::RecoveredXidRolledBack,
            TxEvent::RecoveredXidFailed { .. } => EventKind::RecoveredXidFailed,
            TxEvent::RetryReceived { .. } => EventKind::RetryReceived,
            TxEvent::RedeliverDecisions { .. } => EventKind::RedeliverDecisions,
            TxEvent::RecoveryFinished { .. } => EventKind::RecoveryFinished,
        }
    }
}
