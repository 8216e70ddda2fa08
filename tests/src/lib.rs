//! # XA+ Coordinator Test Suite
//!
//! Several coordinators in one process, connected through the loopback
//! network, each with its own in-memory journal and scripted resources.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── fixtures.rs    # Node setup, waiting helpers, aged xids
//!     ├── two_phase.rs   # Superior + subordinate commit and rollback
//!     ├── timeouts.rs    # Result delivery on expiry
//!     └── recovery.rs    # In-doubt resolution after a crash
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p xa-tests
//! cargo test -p xa-tests integration::recovery::
//! ```

#![allow(dead_code)]

pub mod integration;
