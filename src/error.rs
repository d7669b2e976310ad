//! Error types for realtime-sync
//!
//! Transport and cache failures are handled inside the subsystem (retries,
//! logging). Only request and configuration errors reach callers.

use thiserror::Error;

/// Main error type for realtime-sync operations
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Invalid subscription request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Subscription manager has been shut down")]
    ShutDown,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a change-feed transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Channel bind rejected for {topic}: {reason}")]
    BindRejected { topic: String, reason: String },

    #[error("Backend unreachable: {message}")]
    Unreachable { message: String },

    #[error("Failed to close channel {topic}: {reason}")]
    CloseFailed { topic: String, reason: String },
}

/// Errors reported by the external cache layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Invalidation rejected for {keys}: {reason}")]
    Rejected { keys: String, reason: String },
}

impl RealtimeError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }
}

/// Result type alias for realtime-sync operations
pub type Result<T> = std::result::Result<T, RealtimeError>;
