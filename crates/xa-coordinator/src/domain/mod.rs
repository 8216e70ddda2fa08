//! Domain model: transactions, their branches, per-stage trackers and the
//! caller-visible result handle.

pub mod branch;
pub mod result;
pub mod tracker;
pub mod transaction;

pub use branch::{BranchFlags, BranchOutcome, Phase, XaBranch, XaPlusBranch};
pub use result::{TransactionFuture, TransactionResult};
pub use tracker::Tracker;
pub use transaction::{PeerTarget, Role, Transaction, XaTarget};
