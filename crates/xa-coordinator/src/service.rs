//! Transaction Manager Service
//!
//! Implements [`TransactionManagerApi`]. Owns the set of active transactions
//! (begun or joined, not yet handed to commit or rollback) and turns user
//! calls into bus events. Everything after `commit`/`rollback` happens in the
//! services; the caller only holds the returned futures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_bus::EventPublisher;
use shared_types::{UidGenerator, Xid, TMNOFLAGS};
use tracing::{debug, info, warn};

use crate::domain::{Transaction, TransactionFuture, XaBranch, XaPlusBranch};
use crate::error::{CoordinatorError, CoordinatorResult, TransactionError};
use crate::events::{EventBus, TxEvent};
use crate::metrics;
use crate::ports::inbound::TransactionManagerApi;
use crate::ports::outbound::{PeerFactory, XaResource};
use crate::resources::ResourceRegistry;

/// User-facing entry point of a coordinator.
///
/// Cheap to clone; all clones share the same active set.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    generator: UidGenerator,
    transaction_timeout: Duration,
    bus: Arc<EventBus>,
    resources: Arc<ResourceRegistry>,
    peers: Arc<dyn PeerFactory>,
    active: Mutex<HashMap<Xid, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(
        generator: UidGenerator,
        transaction_timeout: Duration,
        bus: Arc<EventBus>,
        resources: Arc<ResourceRegistry>,
        peers: Arc<dyn PeerFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                generator,
                transaction_timeout,
                bus,
                resources,
                peers,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn server_id(&self) -> &str {
        self.inner.generator.server_id()
    }

    /// Transactions begun or joined and not yet completed by the user.
    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    pub fn is_active(&self, xid: &Xid) -> bool {
        self.inner.active.lock().contains_key(xid)
    }

    fn active(&self, xid: &Xid) -> CoordinatorResult<Arc<Transaction>> {
        let transaction = self
            .inner
            .active
            .lock()
            .get(xid)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnknownTransaction(xid.clone()))?;
        if transaction.is_closed() {
            return Err(CoordinatorError::TransactionClosed(xid.clone()));
        }
        Ok(transaction)
    }

    async fn register(&self, xid: Xid) -> CoordinatorResult<()> {
        let transaction = Arc::new(Transaction::new(
            xid.clone(),
            self.server_id(),
            self.inner.transaction_timeout,
        ));
        {
            let mut active = self.inner.active.lock();
            if active.contains_key(&xid) {
                return Err(CoordinatorError::DuplicateTransaction(xid));
            }
            active.insert(xid, transaction.clone());
        }
        self.inner
            .bus
            .publish(TxEvent::TransactionCreated { transaction })
            .await;
        Ok(())
    }

    /// Drop transactions that expired before the user committed or rolled
    /// them back.
    ///
    /// Each one is closed and announced as timed out, so services that
    /// picked it up on creation forget it. Branches already started are left
    /// to the resources' own timeouts. Returns how many were dropped.
    pub async fn evict_expired(&self, now: u64) -> usize {
        let expired: Vec<Arc<Transaction>> = {
            let mut active = self.inner.active.lock();
            let xids: Vec<Xid> = active
                .iter()
                .filter(|(_, transaction)| transaction.is_expired(now))
                .map(|(xid, _)| xid.clone())
                .collect();
            xids.iter().filter_map(|xid| active.remove(xid)).collect()
        };

        let count = expired.len();
        for transaction in expired {
            warn!(xid = %transaction.xid(), "Abandoned transaction expired");
            transaction.close();
            transaction.deliver(Err(TransactionError::Timeout));
            metrics::record_timeout();
            self.inner
                .bus
                .publish(TxEvent::TransactionTimedOut { transaction })
                .await;
        }
        count
    }

    /// Remove every transaction in `xids` from the active set, or none of them.
    fn detach(&self, xids: &[Xid]) -> CoordinatorResult<Vec<(Arc<Transaction>, TransactionFuture)>> {
        let mut active = self.inner.active.lock();
        let mut seen = Vec::with_capacity(xids.len());
        for xid in xids {
            if seen.contains(&xid) {
                return Err(CoordinatorError::DuplicateTransaction(xid.clone()));
            }
            if !active.contains_key(xid) {
                return Err(CoordinatorError::UnknownTransaction(xid.clone()));
            }
            seen.push(xid);
        }

        let mut detached = Vec::with_capacity(xids.len());
        for xid in xids {
            if let Some(transaction) = active.remove(xid) {
                match transaction.take_future() {
                    Some(future) => detached.push((transaction, future)),
                    None => warn!(xid = %xid, "Result already handed out"),
                }
            }
        }
        Ok(detached)
    }
}

#[async_trait]
impl TransactionManagerApi for TransactionManager {
    async fn begin(&self) -> CoordinatorResult<Xid> {
        let generator = &self.inner.generator;
        let xid = Xid::new(generator.generate(), generator.generate());
        self.register(xid.clone()).await?;
        debug!(xid = %xid, "Transaction begun");
        Ok(xid)
    }

    async fn join(&self, xid: &Xid) -> CoordinatorResult<()> {
        let local = self.server_id();
        if xid.branch_server_id() != local {
            return Err(CoordinatorError::InvalidRole(format!(
                "branch {xid} belongs to {}",
                xid.branch_server_id()
            )));
        }
        if xid.superior_server_id() == local {
            return Err(CoordinatorError::InvalidRole(format!(
                "{xid} is superior here; join needs a remote superior"
            )));
        }
        self.register(xid.clone()).await?;
        debug!(xid = %xid, superior = xid.superior_server_id(), "Transaction joined");
        Ok(())
    }

    async fn enlist(
        &self,
        xid: &Xid,
        resource_name: &str,
    ) -> CoordinatorResult<Arc<dyn XaResource>> {
        let transaction = self.active(xid)?;
        if let Some(resource) = transaction.enlisted_resource(resource_name) {
            return Ok(resource);
        }
        let resource = self
            .inner
            .resources
            .get(resource_name)
            .ok_or_else(|| CoordinatorError::UnknownResource(resource_name.to_string()))?;

        let branch = transaction.xid().with_branch(self.inner.generator.generate());
        resource
            .start(&branch, TMNOFLAGS)
            .await
            .map_err(|source| CoordinatorError::ResourceStart {
                resource: resource_name.to_string(),
                source,
            })?;

        if !transaction.add_xa_branch(XaBranch::new(branch.clone(), resource_name, resource.clone())) {
            return Err(CoordinatorError::TransactionClosed(xid.clone()));
        }
        debug!(xid = %xid, branch = %branch, resource = resource_name, "Resource enlisted");
        Ok(resource)
    }

    async fn create_peer_branch(&self, xid: &Xid, server_id: &str) -> CoordinatorResult<Xid> {
        let transaction = self.active(xid)?;
        if server_id == self.server_id() {
            return Err(CoordinatorError::InvalidRole(
                "cannot delegate a branch to this server".to_string(),
            ));
        }
        let qualifier = self.inner.generator.generate_for(server_id)?;
        let peer = self
            .inner
            .peers
            .connect(server_id)
            .await
            .map_err(|source| CoordinatorError::PeerUnavailable {
                server_id: server_id.to_string(),
                source,
            })?;

        let branch = transaction.xid().with_branch(qualifier);
        if !transaction.add_xaplus_branch(XaPlusBranch::new(branch.clone(), server_id, peer)) {
            return Err(CoordinatorError::TransactionClosed(xid.clone()));
        }
        debug!(xid = %xid, branch = %branch, peer = server_id, "Peer branch created");
        Ok(branch)
    }

    async fn commit(&self, xids: &[Xid]) -> CoordinatorResult<Vec<TransactionFuture>> {
        let detached = self.detach(xids)?;
        let mut futures = Vec::with_capacity(detached.len());
        for (transaction, future) in detached {
            info!(
                xid = %transaction.xid(),
                branches = transaction.branch_count(),
                "Commit requested"
            );
            self.inner
                .bus
                .publish(TxEvent::CommitRequested { transaction })
                .await;
            futures.push(future);
        }
        Ok(futures)
    }

    async fn rollback(&self, xids: &[Xid]) -> CoordinatorResult<Vec<TransactionFuture>> {
        let detached = self.detach(xids)?;
        let mut futures = Vec::with_capacity(detached.len());
        for (transaction, future) in detached {
            if transaction.is_subordinate() {
                transaction.set_rollback_only();
            }
            info!(xid = %transaction.xid(), "Rollback requested");
            self.inner
                .bus
                .publish(TxEvent::RollbackRequested { transaction })
                .await;
            futures.push(future);
        }
        Ok(futures)
    }
}
