//! In-process XA+ transport.
//!
//! Several coordinators in one process register their [`PeerEndpoint`]s here
//! and use the network as their [`PeerFactory`]. Every call is logged so
//! tests can count orders and status reports per peer.
//!
//! [`PeerEndpoint`]: super::PeerEndpoint

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use shared_types::{XaException, Xid};

use crate::domain::Phase;

use crate::ports::outbound::{PeerFactory, XaPlusResource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerVerb {
    Prepare,
    Commit,
    Rollback,
    Ready,
    Failed,
    Done,
    Retry,
}

/// One call delivered through the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCall {
    /// Server that received the call
    pub target: String,
    pub verb: PeerVerb,
    pub xid: Option<Xid>,
    /// Server named in the call: the superior of an order, or the asker of
    /// `retry`
    pub named_server: Option<String>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: RwLock<HashMap<String, Arc<dyn XaPlusResource>>>,
    calls: Mutex<Vec<PeerCall>>,
}

impl NetworkInner {
    fn endpoint(&self, server_id: &str) -> Option<Arc<dyn XaPlusResource>> {
        self.endpoints.read().get(server_id).cloned()
    }
}

/// Shared switchboard; clones see the same registrations and call log.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `server_id` reachable.
    pub fn register(&self, server_id: &str, endpoint: Arc<dyn XaPlusResource>) {
        self.inner
            .endpoints
            .write()
            .insert(server_id.to_string(), endpoint);
    }

    /// Make `server_id` unreachable; existing handles fail from now on.
    pub fn unregister(&self, server_id: &str) {
        self.inner.endpoints.write().remove(server_id);
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.inner.calls.lock().clone()
    }

    /// Calls of `verb` delivered to `target`.
    pub fn calls_to(&self, target: &str, verb: PeerVerb) -> Vec<PeerCall> {
        self.inner
            .calls
            .lock()
            .iter()
            .filter(|c| c.target == target && c.verb == verb)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PeerFactory for LoopbackNetwork {
    async fn connect(&self, server_id: &str) -> Result<Arc<dyn XaPlusResource>, XaException> {
        if self.inner.endpoint(server_id).is_none() {
            return Err(XaException::unavailable(format!(
                "peer {server_id} is not registered"
            )));
        }
        Ok(Arc::new(LoopbackPeer {
            target: server_id.to_string(),
            network: self.inner.clone(),
        }))
    }
}

/// Handle on one remote endpoint, resolved at call time.
struct LoopbackPeer {
    target: String,
    network: Arc<NetworkInner>,
}

impl LoopbackPeer {
    fn resolve(
        &self,
        verb: PeerVerb,
        xid: Option<&Xid>,
        named_server: Option<&str>,
    ) -> Result<Arc<dyn XaPlusResource>, XaException> {
        let endpoint = self.network.endpoint(&self.target).ok_or_else(|| {
            XaException::unavailable(format!("peer {} is not reachable", self.target))
        })?;
        self.network.calls.lock().push(PeerCall {
            target: self.target.clone(),
            verb,
            xid: xid.cloned(),
            named_server: named_server.map(str::to_string),
        });
        Ok(endpoint)
    }
}

#[async_trait]
impl XaPlusResource for LoopbackPeer {
    async fn prepare(&self, xid: &Xid, superior_server_id: &str) -> Result<(), XaException> {
        self.resolve(PeerVerb::Prepare, Some(xid), Some(superior_server_id))?
            .prepare(xid, superior_server_id)
            .await
    }

    async fn commit(&self, xid: &Xid, superior_server_id: &str) -> Result<(), XaException> {
        self.resolve(PeerVerb::Commit, Some(xid), Some(superior_server_id))?
            .commit(xid, superior_server_id)
            .await
    }

    async fn rollback(&self, xid: &Xid, superior_server_id: &str) -> Result<(), XaException> {
        self.resolve(PeerVerb::Rollback, Some(xid), Some(superior_server_id))?
            .rollback(xid, superior_server_id)
            .await
    }

    async fn ready(&self, xid: &Xid) -> Result<(), XaException> {
        self.resolve(PeerVerb::Ready, Some(xid), None)?
            .ready(xid)
            .await
    }

    async fn failed(&self, xid: &Xid, phase: Phase) -> Result<(), XaException> {
        self.resolve(PeerVerb::Failed, Some(xid), None)?
            .failed(xid, phase)
            .await
    }

    async fn done(&self, xid: &Xid) -> Result<(), XaException> {
        self.resolve(PeerVerb::Done, Some(xid), None)?
            .done(xid)
            .await
    }

    async fn retry(&self, server_id: &str) -> Result<(), XaException> {
        self.resolve(PeerVerb::Retry, None, Some(server_id))?
            .retry(server_id)
            .await
    }
}
