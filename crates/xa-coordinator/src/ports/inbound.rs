//! Driving Ports (API - Inbound)
//!
//! What the embedding application calls. Commit and rollback only hand the
//! transaction to the pipeline; the outcome arrives through the returned
//! [`TransactionFuture`].

use std::sync::Arc;

use async_trait::async_trait;
use shared_types::Xid;

use crate::domain::TransactionFuture;
use crate::error::CoordinatorResult;
use crate::ports::outbound::XaResource;

/// User-facing transaction API.
#[async_trait]
pub trait TransactionManagerApi: Send + Sync {
    /// Begin a transaction with this coordinator as superior.
    async fn begin(&self) -> CoordinatorResult<Xid>;

    /// Take part in a transaction owned by a remote superior.
    ///
    /// `xid` is the branch the superior created for this server.
    async fn join(&self, xid: &Xid) -> CoordinatorResult<()>;

    /// Start a new branch on a registered resource and return its handle.
    ///
    /// Enlisting the same resource twice returns the first handle.
    async fn enlist(&self, xid: &Xid, resource_name: &str)
        -> CoordinatorResult<Arc<dyn XaResource>>;

    /// Delegate part of the transaction to the coordinator `server_id`.
    async fn create_peer_branch(&self, xid: &Xid, server_id: &str) -> CoordinatorResult<Xid>;

    /// Commit every transaction in `xids`.
    async fn commit(&self, xids: &[Xid]) -> CoordinatorResult<Vec<TransactionFuture>>;

    /// Roll back every transaction in `xids`.
    async fn rollback(&self, xids: &[Xid]) -> CoordinatorResult<Vec<TransactionFuture>>;
}
