//! # Test Fixtures
//!
//! A [`Node`] is one running coordinator with its journal and resources,
//! registered on a shared [`LoopbackNetwork`] under its server id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use shared_bus::Subscription;
use shared_types::{current_time_millis, Uid, Xid};
use tokio::time::{sleep, timeout};
use xa_coordinator::events::EventFilter;
use xa_coordinator::{
    Coordinator, CoordinatorConfig, EventKind, InMemoryJournal, LoopbackNetwork, MockXaResource,
    ResourceRegistry, TransactionFuture, TransactionManager, TransactionResult, TxEvent,
};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// How long "nothing else happens" is observed.
pub const QUIET: Duration = Duration::from_millis(300);

pub struct Node {
    pub coordinator: Coordinator,
    pub journal: Arc<InMemoryJournal>,
    resources: HashMap<String, Arc<MockXaResource>>,
}

impl Node {
    /// Start a coordinator with the test profile and one mock per name.
    pub async fn start(network: &LoopbackNetwork, server_id: &str, resources: &[&str]) -> Self {
        Self::start_with(network, CoordinatorConfig::for_testing(server_id), resources).await
    }

    pub async fn start_with(
        network: &LoopbackNetwork,
        config: CoordinatorConfig,
        resources: &[&str],
    ) -> Self {
        let registry = Arc::new(ResourceRegistry::new());
        let mut mocks = HashMap::new();
        for name in resources {
            let mock = Arc::new(MockXaResource::new(name));
            registry.register(*name, mock.clone());
            mocks.insert(name.to_string(), mock);
        }
        let journal = Arc::new(InMemoryJournal::new());
        let server_id = config.server_id.clone();

        let coordinator = Coordinator::start(
            config,
            journal.clone(),
            registry,
            Arc::new(network.clone()),
        )
        .await
        .expect("coordinator should start");
        network.register(&server_id, Arc::new(coordinator.endpoint()));

        Self {
            coordinator,
            journal,
            resources: mocks,
        }
    }

    pub fn tm(&self) -> TransactionManager {
        self.coordinator.transaction_manager()
    }

    pub fn resource(&self, name: &str) -> Arc<MockXaResource> {
        self.resources
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("no resource {name}"))
    }

    pub fn watch(&self, kinds: Vec<EventKind>) -> Subscription<TxEvent> {
        self.coordinator.bus().subscribe(EventFilter::kinds(kinds))
    }
}

/// Await a transaction result.
pub async fn outcome(future: TransactionFuture) -> TransactionResult {
    timeout(WAIT, future.get())
        .await
        .expect("timeout waiting for transaction result")
}

/// Await the single future of a one-xid commit or rollback.
pub async fn single(futures: Vec<TransactionFuture>) -> TransactionResult {
    assert_eq!(futures.len(), 1);
    let future = futures.into_iter().next().expect("one future");
    outcome(future).await
}

/// Poll `condition` until it holds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let polled = async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    };
    if timeout(WAIT, polled).await.is_err() {
        panic!("timeout waiting for {what}");
    }
}

/// Next event on `sub`.
pub async fn next(sub: &mut Subscription<TxEvent>) -> TxEvent {
    timeout(WAIT, sub.recv())
        .await
        .expect("timeout waiting for event")
        .expect("bus closed")
}

/// True if no event arrives on `sub` for [`QUIET`].
pub async fn stays_quiet(sub: &mut Subscription<TxEvent>) -> bool {
    timeout(QUIET, sub.recv()).await.is_err()
}

/// Branch `sequence` of a transaction superior at `superior`, owned by
/// `branch_server`, created a minute ago.
pub fn aged_xid(superior: &str, branch_server: &str, sequence: u32) -> Xid {
    let created = current_time_millis() - 60_000;
    Xid::new(
        Uid::new(superior, created, sequence).expect("valid superior id"),
        Uid::new(branch_server, created, sequence).expect("valid branch id"),
    )
}
