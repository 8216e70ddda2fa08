//! # Transaction Identifiers
//!
//! `Uid` and `Xid` value types.
//!
//! ## Encoding
//!
//! ```text
//! Uid (64 bytes)
//! ┌─────┬──────────────────────────────┬───────────────┬──────────────┐
//! │ len │ server id (zero padded, 51)  │ timestamp BE  │ sequence BE  │
//! │ 1 B │ 51 B                         │ 8 B           │ 4 B          │
//! └─────┴──────────────────────────────┴───────────────┴──────────────┘
//!
//! Xid (128 bytes) = global transaction id Uid ++ branch qualifier Uid
//! ```
//!
//! Equality, hashing and ordering agree with the byte encoding.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::IdError;

/// Maximum length of a server id in bytes.
pub const MAX_SERVER_ID_LENGTH: usize = 51;

/// Encoded length of a [`Uid`].
pub const UID_LENGTH: usize = 1 + MAX_SERVER_ID_LENGTH + 8 + 4;

/// Encoded length of an [`Xid`].
pub const XID_LENGTH: usize = 2 * UID_LENGTH;

/// Format id reported for every [`Xid`] minted by this coordinator ("XA+\0").
pub const XID_FORMAT_ID: i32 = 0x5841_2B00;

const TIMESTAMP_OFFSET: usize = 1 + MAX_SERVER_ID_LENGTH;
const SEQUENCE_OFFSET: usize = TIMESTAMP_OFFSET + 8;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Check that a server id fits the encoding.
///
/// Server ids are non-empty ASCII, at most [`MAX_SERVER_ID_LENGTH`] bytes,
/// and may not contain `:` or `/` (the textual separators).
pub fn validate_server_id(server_id: &str) -> Result<(), IdError> {
    if server_id.is_empty() {
        return Err(IdError::EmptyServerId);
    }
    if server_id.len() > MAX_SERVER_ID_LENGTH {
        return Err(IdError::ServerIdTooLong {
            length: server_id.len(),
            max: MAX_SERVER_ID_LENGTH,
        });
    }
    if !server_id.is_ascii() || server_id.contains(':') || server_id.contains('/') {
        return Err(IdError::InvalidServerId(server_id.to_string()));
    }
    Ok(())
}

/// Unique identifier: `(server id, timestamp millis, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid {
    server_id: String,
    timestamp: u64,
    sequence: u32,
}

impl Uid {
    /// Build a uid from its parts.
    pub fn new(server_id: &str, timestamp: u64, sequence: u32) -> Result<Self, IdError> {
        validate_server_id(server_id)?;
        Ok(Self {
            server_id: server_id.to_string(),
            timestamp,
            sequence,
        })
    }

    /// Server that minted this uid.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Sequence number within the millisecond.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Fixed-layout encoding.
    pub fn to_bytes(&self) -> [u8; UID_LENGTH] {
        let mut bytes = [0u8; UID_LENGTH];
        let server = self.server_id.as_bytes();
        bytes[0] = server.len() as u8;
        bytes[1..1 + server.len()].copy_from_slice(server);
        bytes[TIMESTAMP_OFFSET..SEQUENCE_OFFSET].copy_from_slice(&self.timestamp.to_be_bytes());
        bytes[SEQUENCE_OFFSET..].copy_from_slice(&self.sequence.to_be_bytes());
        bytes
    }

    /// Decode a uid produced by [`Uid::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        if bytes.len() != UID_LENGTH {
            return Err(IdError::InvalidLength {
                expected: UID_LENGTH,
                actual: bytes.len(),
            });
        }

        let len = bytes[0] as usize;
        if len == 0 || len > MAX_SERVER_ID_LENGTH {
            return Err(IdError::Malformed(format!("server id length {len}")));
        }
        if bytes[1 + len..TIMESTAMP_OFFSET].iter().any(|b| *b != 0) {
            return Err(IdError::Malformed("non-zero server id padding".to_string()));
        }

        let server_id = std::str::from_utf8(&bytes[1..1 + len])
            .map_err(|_| IdError::Malformed("server id is not utf-8".to_string()))?;

        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&bytes[TIMESTAMP_OFFSET..SEQUENCE_OFFSET]);
        let mut sequence = [0u8; 4];
        sequence.copy_from_slice(&bytes[SEQUENCE_OFFSET..]);

        Self::new(
            server_id,
            u64::from_be_bytes(timestamp),
            u32::from_be_bytes(sequence),
        )
    }
}

impl Ord for Uid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl PartialOrd for Uid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.server_id, self.timestamp, self.sequence)
    }
}

impl FromStr for Uid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let (Some(server_id), Some(timestamp), Some(sequence), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(IdError::Malformed(s.to_string()));
        };

        let timestamp = timestamp
            .parse()
            .map_err(|_| IdError::Malformed(s.to_string()))?;
        let sequence = sequence
            .parse()
            .map_err(|_| IdError::Malformed(s.to_string()))?;
        Self::new(server_id, timestamp, sequence)
    }
}

/// Monotonic uid source for one server.
///
/// Timestamps never go backwards within a generator: if the wall clock stalls
/// or steps back, the last timestamp is reused with an increasing sequence.
pub struct UidGenerator {
    server_id: String,
    last: Mutex<(u64, u32)>,
}

impl UidGenerator {
    /// Create a generator for `server_id`.
    pub fn new(server_id: &str) -> Result<Self, IdError> {
        validate_server_id(server_id)?;
        Ok(Self {
            server_id: server_id.to_string(),
            last: Mutex::new((0, 0)),
        })
    }

    /// The local server id.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Next uid owned by the local server.
    pub fn generate(&self) -> Uid {
        let (timestamp, sequence) = self.next_stamp();
        Uid {
            server_id: self.server_id.clone(),
            timestamp,
            sequence,
        }
    }

    /// Next uid attributed to another server (used for peer branch qualifiers).
    pub fn generate_for(&self, server_id: &str) -> Result<Uid, IdError> {
        validate_server_id(server_id)?;
        let (timestamp, sequence) = self.next_stamp();
        Ok(Uid {
            server_id: server_id.to_string(),
            timestamp,
            sequence,
        })
    }

    fn next_stamp(&self) -> (u64, u32) {
        let now = current_time_millis();
        let mut last = self.last.lock();
        if now > last.0 {
            *last = (now, 0);
        } else if last.1 == u32::MAX {
            *last = (last.0 + 1, 0);
        } else {
            last.1 += 1;
        }
        *last
    }
}

/// Global transaction id plus branch qualifier.
///
/// The global part's server id is the superior of the whole transaction; the
/// branch qualifier's server id is the server owning the branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid {
    global_transaction_id: Uid,
    branch_qualifier: Uid,
}

impl Xid {
    /// Build an xid from its two halves.
    pub fn new(global_transaction_id: Uid, branch_qualifier: Uid) -> Self {
        Self {
            global_transaction_id,
            branch_qualifier,
        }
    }

    /// XA format id.
    pub fn format_id(&self) -> i32 {
        XID_FORMAT_ID
    }

    /// Global transaction id.
    pub fn global_transaction_id(&self) -> &Uid {
        &self.global_transaction_id
    }

    /// Branch qualifier.
    pub fn branch_qualifier(&self) -> &Uid {
        &self.branch_qualifier
    }

    /// Server owning the global decision.
    pub fn superior_server_id(&self) -> &str {
        self.global_transaction_id.server_id()
    }

    /// Server owning this branch.
    pub fn branch_server_id(&self) -> &str {
        self.branch_qualifier.server_id()
    }

    /// Same global transaction, different branch.
    pub fn with_branch(&self, branch_qualifier: Uid) -> Self {
        Self::new(self.global_transaction_id.clone(), branch_qualifier)
    }

    /// True if both xids belong to the same global transaction.
    pub fn is_same_global(&self, other: &Xid) -> bool {
        self.global_transaction_id == other.global_transaction_id
    }

    /// Fixed-layout encoding.
    pub fn to_bytes(&self) -> [u8; XID_LENGTH] {
        let mut bytes = [0u8; XID_LENGTH];
        bytes[..UID_LENGTH].copy_from_slice(&self.global_transaction_id.to_bytes());
        bytes[UID_LENGTH..].copy_from_slice(&self.branch_qualifier.to_bytes());
        bytes
    }

    /// Decode an xid produced by [`Xid::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        if bytes.len() != XID_LENGTH {
            return Err(IdError::InvalidLength {
                expected: XID_LENGTH,
                actual: bytes.len(),
            });
        }
        Ok(Self::new(
            Uid::from_bytes(&bytes[..UID_LENGTH])?,
            Uid::from_bytes(&bytes[UID_LENGTH..])?,
        ))
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.global_transaction_id, self.branch_qualifier)
    }
}

impl FromStr for Xid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (global, branch) = s
            .split_once('/')
            .ok_or_else(|| IdError::Malformed(s.to_string()))?;
        Ok(Self::new(global.parse()?, branch.parse()?))
    }
}
