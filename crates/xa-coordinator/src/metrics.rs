//! # Coordinator Metrics
//!
//! Prometheus counters, enabled with the `metrics` feature:
//! ```toml
//! xa-coordinator = { path = "...", features = ["metrics"] }
//! ```
//!
//! ## Metrics Exported
//!
//! - `xa_decisions_logged_total` - Decisions written to the journal (by decision)
//! - `xa_transaction_outcomes_total` - Results delivered to callers (by outcome)
//! - `xa_transaction_timeouts_total` - Transactions timed out by the timer
//! - `xa_recovery_rounds_total` - Recovery rounds finished (by result)
//! - `xa_recovered_branches_total` - In-doubt branches resolved by recovery (by decision)

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

use shared_types::Decision;

#[cfg(feature = "metrics")]
lazy_static! {
    /// Decisions logged, labeled by decision
    pub static ref DECISIONS_LOGGED: IntCounterVec = register_int_counter_vec!(
        "xa_decisions_logged_total",
        "Total number of commit/rollback decisions logged",
        &["decision"]
    )
    .expect("Failed to create DECISIONS_LOGGED metric");

    /// Terminal outcomes delivered, labeled by outcome
    pub static ref OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "xa_transaction_outcomes_total",
        "Total number of transaction results delivered",
        &["outcome"]
    )
    .expect("Failed to create OUTCOMES metric");

    /// Transactions timed out
    pub static ref TIMEOUTS: IntCounter = register_int_counter!(
        "xa_transaction_timeouts_total",
        "Total number of transactions timed out"
    )
    .expect("Failed to create TIMEOUTS metric");

    /// Recovery rounds, labeled by result
    pub static ref RECOVERY_ROUNDS: IntCounterVec = register_int_counter_vec!(
        "xa_recovery_rounds_total",
        "Total number of recovery rounds finished",
        &["result"]
    )
    .expect("Failed to create RECOVERY_ROUNDS metric");

    /// Recovered branches resolved, labeled by decision
    pub static ref RECOVERED_BRANCHES: IntCounterVec = register_int_counter_vec!(
        "xa_recovered_branches_total",
        "Total number of in-doubt branches resolved by recovery",
        &["decision"]
    )
    .expect("Failed to create RECOVERED_BRANCHES metric");
}

// =============================================================================
// METRIC RECORDING FUNCTIONS
// =============================================================================

/// Record a decision written to the journal
#[cfg(feature = "metrics")]
pub fn record_decision(decision: Decision) {
    DECISIONS_LOGGED
        .with_label_values(&[&decision.to_string()])
        .inc();
}

/// Record a result delivered to a caller
#[cfg(feature = "metrics")]
pub fn record_outcome(outcome: &str) {
    OUTCOMES.with_label_values(&[outcome]).inc();
}

/// Record a transaction timeout
#[cfg(feature = "metrics")]
pub fn record_timeout() {
    TIMEOUTS.inc();
}

/// Record a finished recovery round
#[cfg(feature = "metrics")]
pub fn record_recovery_round(succeeded: bool) {
    let result = if succeeded { "succeeded" } else { "failed" };
    RECOVERY_ROUNDS.with_label_values(&[result]).inc();
}

/// Record a recovered branch resolved
#[cfg(feature = "metrics")]
pub fn record_recovered(decision: Decision) {
    RECOVERED_BRANCHES
        .with_label_values(&[&decision.to_string()])
        .inc();
}

// =============================================================================
// NO-OP IMPLEMENTATIONS (when metrics feature disabled)
// =============================================================================

#[cfg(not(feature = "metrics"))]
pub fn record_decision(_decision: Decision) {}

#[cfg(not(feature = "metrics"))]
pub fn record_outcome(_outcome: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_timeout() {}

#[cfg(not(feature = "metrics"))]
pub fn record_recovery_round(_succeeded: bool) {}

#[cfg(not(feature = "metrics"))]
pub fn record_recovered(_decision: Decision) {}
