//! Error types and result aliases for sluice.
//!
//! This module defines the shared error taxonomy used across all sluice
//! components. Errors are structured for programmatic handling and include
//! context for debugging.

use std::fmt;

/// The result type used throughout sluice.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in sluice operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A request carried a missing or server-controlled field.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of what made the argument invalid.
        message: String,
    },

    /// The requested record was not found.
    #[error("not found: {resource_type} {id}")]
    NotFound {
        /// The type of record that was looked up.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A record with the same primary key already exists.
    #[error("conflict: {resource_type} {id} already exists")]
    Conflict {
        /// The type of record that collided.
        resource_type: &'static str,
        /// The colliding primary key.
        id: String,
    },

    /// The backing store could not serve the request.
    #[error("store unavailable: {message}")]
    StoreUnavailable {
        /// Description of the store failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A change-feed delivered an event that violates the feed contract.
    #[error("protocol violation: {message}")]
    ProtocolViolation {
        /// Description of the violation.
        message: String,
    },

    /// A blocking operation was cut short before it could complete.
    #[error("canceled: {operation}")]
    Canceled {
        /// The operation that was interrupted.
        operation: &'static str,
    },

    /// A record could not be encoded or decoded.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new invalid-argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new conflict error.
    #[must_use]
    pub fn conflict(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::Conflict {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new store-unavailable error with the given message.
    #[must_use]
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new store-unavailable error with a source cause.
    #[must_use]
    pub fn store_unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new protocol-violation error.
    #[must_use]
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Creates a new canceled error for the named operation.
    #[must_use]
    pub const fn canceled(operation: &'static str) -> Self {
        Self::Canceled { operation }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error is a not-found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this error is a primary-key conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
