//! Error types for kvpool
//!
//! This module defines the common error type used throughout the system.
//! Every public master operation returns `Result<T>`; no panics escape
//! the core.

use crate::types::SegmentId;
use thiserror::Error;

/// Common result type for kvpool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for kvpool
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Request validation
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    // Object existence preconditions
    #[error("object not found: {key}")]
    ObjectNotFound { key: String },

    #[error("object already exists: {key}")]
    ObjectAlreadyExists { key: String },

    // Object state preconditions
    #[error("replica is not ready: {key}")]
    ReplicaNotReady { key: String },

    #[error("invalid write: {key}")]
    InvalidWrite { key: String },

    #[error("object has a live lease: {key}")]
    ObjectHasLease { key: String },

    // Allocation
    #[error("no segment can satisfy the allocation")]
    NoAvailableHandle,

    // Segment state
    #[error("segment not found: {0}")]
    SegmentNotFound(String),

    #[error("segment already exists: {0}")]
    SegmentAlreadyExists(SegmentId),

    // Mode
    #[error("operation unavailable in current mode: {0}")]
    UnavailableInCurrentMode(&'static str),

    // Internal (retriable)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid parameters error
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable wire code for this error
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParams(_) => "INVALID_PARAMS",
            Self::ObjectNotFound { .. } => "OBJECT_NOT_FOUND",
            Self::ObjectAlreadyExists { .. } => "OBJECT_ALREADY_EXISTS",
            Self::ReplicaNotReady { .. } => "REPLICA_IS_NOT_READY",
            Self::InvalidWrite { .. } => "INVALID_WRITE",
            Self::ObjectHasLease { .. } => "OBJECT_HAS_LEASE",
            Self::NoAvailableHandle => "NO_AVAILABLE_HANDLE",
            Self::SegmentNotFound(_) => "SEGMENT_NOT_FOUND",
            Self::SegmentAlreadyExists(_) => "SEGMENT_ALREADY_EXISTS",
            Self::UnavailableInCurrentMode(_) => "UNAVAILABLE_IN_CURRENT_MODE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Check if this error is retriable by the client
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Internal(_) | Self::NoAvailableHandle)
    }

    /// Get HTTP status code for the boundary layer
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidParams(_) => 400,
            Self::ObjectNotFound { .. } | Self::SegmentNotFound(_) => 404,
            Self::ObjectAlreadyExists { .. }
            | Self::SegmentAlreadyExists(_)
            | Self::ObjectHasLease { .. }
            | Self::ReplicaNotReady { .. }
            | Self::InvalidWrite { .. } => 409,
            Self::UnavailableInCurrentMode(_) => 405,
            Self::NoAvailableHandle => 507,
            Self::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::NoAvailableHandle.code(), "NO_AVAILABLE_HANDLE");
        assert_eq!(
            Error::ObjectNotFound { key: "k".into() }.code(),
            "OBJECT_NOT_FOUND"
        );
        assert_eq!(Error::internal("queue full").code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::internal("queue full").is_retryable());
        assert!(Error::NoAvailableHandle.is_retryable());
        assert!(!Error::invalid_params("bad").is_retryable());
    }

    #[test]
    fn test_error_http_status() {
        assert_eq!(Error::invalid_params("bad").http_status(), 400);
        assert_eq!(Error::ObjectNotFound { key: "k".into() }.http_status(), 404);
        assert_eq!(
            Error::ObjectHasLease { key: "k".into() }.http_status(),
            409
        );
    }
}
