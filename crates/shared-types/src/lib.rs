//! # Shared Types Crate
//!
//! Identifier primitives and the XA vocabulary used across the coordinator.
//!
//! ## Contents
//!
//! - **Identifiers**: [`Uid`] (server id + monotonic timestamp + sequence) and
//!   [`Xid`] (global transaction id + branch qualifier).
//! - **XA vocabulary**: flag and return-code constants, [`Vote`], [`Decision`].
//! - **Errors**: [`XaException`] raised by resource managers, [`IdError`].
//!
//! ## Design Principles
//!
//! - **Byte-comparable ids**: every `Uid` has a fixed 64-byte encoding; ordering
//!   and equality agree with that encoding.
//! - **Role from identity**: the server id inside an `Xid`'s global part names
//!   the superior of the whole transaction, the one inside the branch qualifier
//!   names the server that owns the branch.

pub mod errors;
pub mod ids;
pub mod xa;

pub use errors::*;
pub use ids::*;
pub use xa::*;
