//! Inbound side of the XA+ protocol.
//!
//! Each call from a peer becomes one event on the local bus. The call returns
//! once the event is queued; the outcome travels back as a separate call in
//! the opposite direction.

use std::sync::Arc;

use async_trait::async_trait;
use shared_bus::EventPublisher;
use shared_types::{XaException, Xid};
use tracing::debug;

use crate::domain::Phase;
use crate::events::{EventBus, TxEvent};
use crate::ports::outbound::XaPlusResource;

/// Local coordinator as seen by its peers.
#[derive(Clone)]
pub struct PeerEndpoint {
    server_id: String,
    bus: Arc<EventBus>,
}

impl PeerEndpoint {
    pub fn new(server_id: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            server_id: server_id.into(),
            bus,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn deliver(&self, event: TxEvent) -> Result<(), XaException> {
        debug!(server = %self.server_id, event = ?shared_bus::BusEvent::kind(&event), "Inbound peer call");
        self.bus.publish(event).await;
        Ok(())
    }
}

#[async_trait]
impl XaPlusResource for PeerEndpoint {
    async fn prepare(&self, xid: &Xid, superior_server_id: &str) -> Result<(), XaException> {
        self.deliver(TxEvent::PrepareOrder {
            xid: xid.clone(),
            superior: superior_server_id.to_string(),
        })
        .await
    }

    async fn commit(&self, xid: &Xid, superior_server_id: &str) -> Result<(), XaException> {
        self.deliver(TxEvent::CommitOrder {
            xid: xid.clone(),
            superior: superior_server_id.to_string(),
        })
        .await
    }

    async fn rollback(&self, xid: &Xid, superior_server_id: &str) -> Result<(), XaException> {
        self.deliver(TxEvent::RollbackOrder {
            xid: xid.clone(),
            superior: superior_server_id.to_string(),
        })
        .await
    }

    async fn ready(&self, xid: &Xid) -> Result<(), XaException> {
        self.deliver(TxEvent::BranchReadied { xid: xid.clone() }).await
    }

    async fn failed(&self, xid: &Xid, phase: Phase) -> Result<(), XaException> {
        self.deliver(TxEvent::BranchFailed {
            xid: xid.clone(),
            phase,
        })
        .await
    }

    async fn done(&self, xid: &Xid) -> Result<(), XaException> {
        self.deliver(TxEvent::BranchDone { xid: xid.clone() }).await
    }

    async fn retry(&self, server_id: &str) -> Result<(), XaException> {
        self.deliver(TxEvent::RetryReceived {
            server_id: server_id.to_string(),
        })
        .await
    }
}
