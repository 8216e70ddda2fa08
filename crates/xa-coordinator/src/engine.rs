//! Coordinator assembly.
//!
//! Builds the bus, spawns one task per service plus the periodic tickers, and
//! hands out the two faces of a running coordinator: the user API
//! ([`TransactionManager`]) and the XA+ endpoint peers call into
//! ([`PeerEndpoint`]).

use std::sync::Arc;

use shared_bus::EventPublisher;
use shared_types::{current_time_millis, UidGenerator};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::adapters::PeerEndpoint;
use crate::config::CoordinatorConfig;
use crate::error::CoordinatorResult;
use crate::events::{EventBus, TxEvent};
use crate::ports::outbound::{Journal, PeerFactory};
use crate::resources::ResourceRegistry;
use crate::service::TransactionManager;
use crate::services::{
    spawn_service, BranchExecutor, CommitOrderWaiter, Committer, Completer, DecisionLogger,
    ManagerService, PrepareOrderWaiter, RecoveryService, Rollback, SubordinatePreparer,
    SuperiorPreparer, TimerService,
};

/// A running coordinator. Dropping it stops every task.
pub struct Coordinator {
    config: CoordinatorConfig,
    bus: Arc<EventBus>,
    manager: TransactionManager,
    endpoint: PeerEndpoint,
    resources: Arc<ResourceRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Validate `config`, start all services and, if configured, a first
    /// recovery round.
    pub async fn start(
        config: CoordinatorConfig,
        journal: Arc<dyn Journal>,
        resources: Arc<ResourceRegistry>,
        peers: Arc<dyn PeerFactory>,
    ) -> CoordinatorResult<Self> {
        config.validate()?;
        let generator = UidGenerator::new(&config.server_id)?;
        let bus = Arc::new(EventBus::with_capacity(config.queue_size));
        let executor = BranchExecutor::new(bus.clone(), peers.clone(), &config.server_id);

        let tasks = vec![
            spawn_service(&bus, SuperiorPreparer::new(bus.clone(), executor.clone())),
            spawn_service(
                &bus,
                SubordinatePreparer::new(bus.clone(), journal.clone(), executor.clone()),
            ),
            spawn_service(
                &bus,
                PrepareOrderWaiter::new(bus.clone(), config.transaction_timeout),
            ),
            spawn_service(
                &bus,
                CommitOrderWaiter::new(bus.clone(), config.transaction_timeout),
            ),
            spawn_service(
                &bus,
                DecisionLogger::new(bus.clone(), journal.clone(), executor.clone()),
            ),
            spawn_service(&bus, Committer::superior(bus.clone(), executor.clone())),
            spawn_service(&bus, Committer::subordinate(bus.clone(), executor.clone())),
            spawn_service(&bus, Rollback::new(bus.clone(), executor.clone())),
            spawn_service(
                &bus,
                Completer::new(bus.clone(), journal.clone(), executor.clone()),
            ),
            spawn_service(&bus, TimerService::new(bus.clone())),
            spawn_service(&bus, ManagerService::new(bus.clone())),
            spawn_service(
                &bus,
                RecoveryService::new(
                    bus.clone(),
                    journal,
                    resources.clone(),
                    executor,
                    config.recovery_timeout,
                ),
            ),
        ];

        let manager = TransactionManager::new(
            generator,
            config.transaction_timeout,
            bus.clone(),
            resources.clone(),
            peers,
        );
        let endpoint = PeerEndpoint::new(config.server_id.clone(), bus.clone());

        let mut coordinator = Self {
            config,
            bus,
            manager,
            endpoint,
            resources,
            tasks,
        };
        coordinator.spawn_tickers();

        info!(
            server = %coordinator.config.server_id,
            services = coordinator.tasks.len(),
            resources = coordinator.resources.len(),
            "Coordinator started"
        );

        if coordinator.config.recover_on_start {
            coordinator.recover().await;
        }
        Ok(coordinator)
    }

    fn spawn_tickers(&mut self) {
        let bus = self.bus.clone();
        let manager = self.manager.clone();
        let period = self.config.timer_interval;
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = current_time_millis();
                manager.evict_expired(now).await;
                bus.publish(TxEvent::TimerTick { now }).await;
            }
        }));

        if self.config.periodic_recovery() {
            let bus = self.bus.clone();
            let period = self.config.recovery_period;
            self.tasks.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // first tick completes immediately
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    debug!("Periodic recovery");
                    bus.publish(TxEvent::StartRecovery).await;
                }
            }));
        }
    }

    /// User-facing API handle.
    pub fn transaction_manager(&self) -> TransactionManager {
        self.manager.clone()
    }

    /// Handle peers use to reach this coordinator.
    pub fn endpoint(&self) -> PeerEndpoint {
        self.endpoint.clone()
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn resources(&self) -> Arc<ResourceRegistry> {
        self.resources.clone()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    /// Ask for a recovery round. Ignored while one is running.
    pub async fn recover(&self) {
        self.bus.publish(TxEvent::StartRecovery).await;
    }

    /// Stop every service and ticker.
    pub fn shutdown(self) {
        info!(server = %self.config.server_id, "Coordinator stopping");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
