//! # Coordination Services
//!
//! Each service owns its state (usually a [`Tracker`](crate::domain::Tracker)),
//! declares the event kinds it handles, and processes its inbox one event at a
//! time on its own task. Services never call each other; every reply is a new
//! event.
//!
//! | Service | Consumes | Produces |
//! |---------|----------|----------|
//! | [`SuperiorPreparer`] | user requests, branch prepare outcomes | decision requests |
//! | [`SubordinatePreparer`] | rendezvous result, branch prepare outcomes | `PrepareReported`, rollback decision |
//! | [`PrepareOrderWaiter`] | local request + `PrepareOrder` | `SubordinatePrepareRequested` |
//! | [`CommitOrderWaiter`] | `PrepareReported` + commit/rollback order | decision requests |
//! | [`DecisionLogger`] | decision requests | `*DecisionLogged` or failure |
//! | [`Committer`] | `CommitDecisionLogged`, commit outcomes | `CommitCompleted` / `TwoPcFailed` |
//! | [`Rollback`] | `RollbackDecisionLogged`, rollback outcomes | `RollbackCompleted` / `RollbackFailed` |
//! | [`Completer`] | `*Completed` | `TwoPcDone` / `RollbackDone` |
//! | [`TimerService`] | requests, ticks, terminal events | `TransactionTimedOut`, `TimerCancelled` |
//! | [`ManagerService`] | requests, terminal events, recovery triggers | caller results |
//! | [`RecoveryService`] | recovery events, orders | recovered xid resolution |

pub mod branch_executor;
pub mod committer;
pub mod completer;
pub mod decision_logger;
pub mod manager;
pub mod order_waiters;
pub mod preparer;
pub mod recovery;
pub mod rollback;
pub mod subordinate_preparer;
pub mod timer;

pub use branch_executor::BranchExecutor;
pub use committer::Committer;
pub use completer::Completer;
pub use decision_logger::DecisionLogger;
pub use manager::ManagerService;
pub use order_waiters::{CommitOrderWaiter, PrepareOrderWaiter};
pub use preparer::SuperiorPreparer;
pub use recovery::{RecoveryService, RecoveryStatus};
pub use rollback::Rollback;
pub use subordinate_preparer::SubordinatePreparer;
pub use timer::TimerService;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::events::{EventBus, EventFilter, EventKind, TxEvent};

/// A single-threaded event handler.
#[async_trait]
pub trait Service: Send + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Event kinds delivered to this service.
    fn interests(&self) -> Vec<EventKind>;

    /// Handle one event. Never called concurrently.
    async fn handle(&mut self, event: TxEvent);
}

/// Subscribe `service` and run it on its own task.
///
/// The subscription exists before this returns, so no event published
/// afterwards can be missed.
pub fn spawn_service<S: Service>(bus: &EventBus, mut service: S) -> JoinHandle<()> {
    let mut inbox = bus.subscribe(EventFilter::kinds(service.interests()));
    tokio::spawn(async move {
        debug!(service = service.name(), "Service started");
        while let Some(event) = inbox.recv().await {
            service.handle(event).await;
        }
        debug!(service = service.name(), "Service stopped");
    })
}

/// Interest list extended with every terminal kind.
pub(crate) fn with_terminal(mut kinds: Vec<EventKind>) -> Vec<EventKind> {
    kinds.extend_from_slice(&EventKind::TERMINAL);
    kinds
}
