//! # Error Types
//!
//! Errors shared by the coordinator, its resources and its peers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::xa::{
    xa_code_name, XAER_INVAL, XAER_NOTA, XAER_PROTO, XAER_RMERR, XAER_RMFAIL, XA_HEURCOM,
    XA_HEURHAZ, XA_HEURMIX, XA_HEURRB, XA_RBBASE, XA_RBEND,
};

/// Errors building or decoding identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// Server id is empty.
    #[error("Server id must not be empty")]
    EmptyServerId,

    /// Server id exceeds the encoded field.
    #[error("Server id is {length} bytes, maximum is {max}")]
    ServerIdTooLong { length: usize, max: usize },

    /// Server id contains a reserved or non-ASCII character.
    #[error("Invalid server id: {0:?}")]
    InvalidServerId(String),

    /// Encoded input has the wrong length.
    #[error("Invalid encoded length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Encoded or textual input could not be parsed.
    #[error("Malformed identifier: {0}")]
    Malformed(String),
}

/// Failure reported by an XA or XA+ resource.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message} (XA code {code})")]
pub struct XaException {
    /// XA return code.
    pub code: i32,
    /// Human readable detail.
    pub message: String,
}

impl XaException {
    /// Create an exception with an explicit code.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Unknown xid.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(XAER_NOTA, message)
    }

    /// Resource unavailable.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(XAER_RMFAIL, message)
    }

    /// Resource-side error.
    pub fn resource_error(message: impl Into<String>) -> Self {
        Self::new(XAER_RMERR, message)
    }

    /// Call made in the wrong state.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(XAER_PROTO, message)
    }

    /// Bad arguments.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(XAER_INVAL, message)
    }

    /// Branch completed heuristically.
    pub fn is_heuristic(&self) -> bool {
        matches!(self.code, XA_HEURMIX | XA_HEURRB | XA_HEURCOM | XA_HEURHAZ)
    }

    /// Branch was rolled back by the resource.
    pub fn is_rollback(&self) -> bool {
        (XA_RBBASE..=XA_RBEND).contains(&self.code)
    }

    /// Symbolic name of the code.
    pub fn code_name(&self) -> &'static str {
        xa_code_name(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xa::XA_RBDEADLOCK;

    #[test]
    fn test_xa_exception_display() {
        let err = XaException::not_found("no such branch");
        assert_eq!(err.to_string(), "no such branch (XA code -4)");
    }

    #[test]
    fn test_xa_exception_classification() {
        assert!(XaException::new(XA_HEURCOM, "").is_heuristic());
        assert!(!XaException::resource_error("").is_heuristic());
        assert!(XaException::new(XA_RBDEADLOCK, "").is_rollback());
        assert!(!XaException::unavailable("").is_rollback());
    }
}
