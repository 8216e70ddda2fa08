//! # xa-coordinator
//!
//! Two-phase-commit coordinator for XA resource managers and XA+ peer
//! coordinators.
//!
//! ## Overview
//!
//! This crate provides:
//! - **Superior role**: drives prepare and commit/rollback across local XA
//!   branches and delegated XA+ branches
//! - **Subordinate role**: prepares on a superior's order, reports `ready`,
//!   `failed` or `done` back
//! - **Recovery**: resolves in-doubt branches from the decision journal, with
//!   presumed rollback when nothing was logged
//!
//! ## Architecture
//!
//! Independent services talk only through the event bus. A transaction is
//! shared between them; each service tracks its own view of it.
//!
//! ```text
//! user ──begin/enlist/commit──→ TransactionManager ──CommitRequested──→ bus
//!                                                                        │
//!     Preparer ─→ DecisionLogger ─→ Committer / Rollback ─→ Completer ───┤
//!                                                                        │
//!     Timer · Manager (delivers results) · Recovery ←────────────────────┘
//!
//! peer ──prepare/commit/rollback/ready/failed/done/retry──→ PeerEndpoint ──→ bus
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use xa_coordinator::{Coordinator, CoordinatorConfig, InMemoryJournal, LoopbackNetwork};
//! use xa_coordinator::ports::inbound::TransactionManagerApi;
//!
//! let coordinator = Coordinator::start(config, journal, resources, network).await?;
//! let tm = coordinator.transaction_manager();
//!
//! let xid = tm.begin().await?;
//! let db = tm.enlist(&xid, "orders-db").await?;
//! // ... do work against `db` ...
//! let committed = tm.commit(&[xid]).await?.remove(0).get().await?;
//! ```

pub mod adapters;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod ports;
pub mod resources;
pub mod service;
pub mod services;
pub mod telemetry;

pub use adapters::{
    InMemoryJournal, LoopbackNetwork, MockXaResource, PeerCall, PeerEndpoint, PeerVerb, XaVerb,
};
pub use config::{ConfigError, CoordinatorConfig};
pub use domain::{Role, Transaction, TransactionFuture, TransactionResult};
pub use engine::Coordinator;
pub use error::{CoordinatorError, CoordinatorResult, JournalError, TransactionError};
pub use events::{EventBus, EventKind, TxEvent};
pub use ports::{
    BranchRecord, DanglingTransactions, Journal, PeerFactory, TransactionManagerApi,
    TransactionStatus, XaPlusResource, XaResource,
};
pub use resources::ResourceRegistry;
pub use service::TransactionManager;
pub use telemetry::{init_tracing, TelemetryConfig, TelemetryError};
