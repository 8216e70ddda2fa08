//! Ports module for the coordinator
//!
//! Inbound: the user-facing transaction API. Outbound: resource managers,
//! peer coordinators and the journal.

pub mod inbound;
pub mod outbound;

pub use inbound::TransactionManagerApi;
pub use outbound::{
    BranchRecord, DanglingTransactions, Journal, PeerFactory, TransactionStatus, XaPlusResource,
    XaResource,
};
