//! # Adapters Layer (Hexagonal Architecture)
//!
//! In-process implementations of the outbound ports plus the inbound XA+
//! endpoint.
//!
//! | Adapter | Port | Use |
//! |---------|------|-----|
//! | [`PeerEndpoint`] | `XaPlusResource` (inbound) | turns peer calls into bus events |
//! | [`LoopbackNetwork`] | `PeerFactory` | in-process transport between coordinators |
//! | [`InMemoryJournal`] | `Journal` | volatile decision log |
//! | [`MockXaResource`] | `XaResource` | scriptable resource manager |

pub mod journal;
pub mod loopback;
pub mod mock_resource;
pub mod peer_endpoint;

pub use journal::{InMemoryJournal, JournalWrite, WriteKind};
pub use loopback::{LoopbackNetwork, PeerCall, PeerVerb};
pub use mock_resource::{MockXaResource, XaCall, XaVerb};
pub use peer_endpoint::PeerEndpoint;
