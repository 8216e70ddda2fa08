//! Cross-coordinator flows.

pub mod fixtures;
pub mod nested;
pub mod recovery;
pub mod timeouts;
pub mod two_phase;
