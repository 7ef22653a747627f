//! Error types for CDC operations
//!
//! Includes error classification so that monitors can tell a transient poll
//! failure from a configuration mistake, and so logs carry a stable code.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for logging and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Change source errors (query, protocol, metadata)
    Source,
    /// Durable cursor storage errors
    Checkpoint,
    /// Downstream delivery errors
    Delivery,
    /// Configuration errors (invalid settings)
    Configuration,
    /// Network errors (connection, timeout)
    Network,
    /// Serialization errors (JSON)
    Serialization,
    /// Internal invariant violations
    Internal,
}

/// CDC-specific errors
#[derive(Error, Debug)]
pub enum CdcError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Could not open a session to the source
    #[error("Connection error: {0}")]
    Connection(String),

    /// Change source query failed
    #[error("Source error: {0}")]
    Source(String),

    /// Column metadata could not be resolved
    #[error("Schema error: {0}")]
    Schema(String),

    /// Cursor could not be made durable
    #[error("Checkpoint error for table '{table}': {message}")]
    Checkpoint { table: String, message: String },

    /// Publisher rejected an event
    #[error("Publish error: {0}")]
    Publish(String),

    /// Delivery channel closed while a monitor was still emitting
    #[error("Delivery channel closed")]
    ChannelClosed,

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid state (e.g. a cursor moving backwards)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CdcError {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a new source error
    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    /// Create a new schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a checkpoint error for a table
    pub fn checkpoint(table: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Checkpoint {
            table: table.into(),
            message: msg.into(),
        }
    }

    /// Create a new publish error
    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient errors that may succeed on the next poll.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) | Self::Source(_) | Self::Schema(_) => true,
            Self::Checkpoint { .. } | Self::Publish(_) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                        | ErrorKind::WouldBlock
                )
            }
            Self::Config(_)
            | Self::ChannelClosed
            | Self::InvalidState(_)
            | Self::Serialization(_)
            | Self::Json(_) => false,
        }
    }

    /// Whether this error means the cursor could not be made durable.
    pub fn is_checkpoint_failure(&self) -> bool {
        matches!(self, Self::Checkpoint { .. })
    }

    /// Get the error category for logging and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Source(_) | Self::Schema(_) => ErrorCategory::Source,
            Self::Checkpoint { .. } => ErrorCategory::Checkpoint,
            Self::Publish(_) | Self::ChannelClosed => ErrorCategory::Delivery,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Connection(_) | Self::Timeout(_) | Self::Io(_) => ErrorCategory::Network,
            Self::Serialization(_) | Self::Json(_) => ErrorCategory::Serialization,
            Self::InvalidState(_) => ErrorCategory::Internal,
        }
    }

    /// Get a log-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Connection(_) => "connection_error",
            Self::Source(_) => "source_error",
            Self::Schema(_) => "schema_error",
            Self::Checkpoint { .. } => "checkpoint_error",
            Self::Publish(_) => "publish_error",
            Self::ChannelClosed => "channel_closed",
            Self::Timeout(_) => "timeout",
            Self::InvalidState(_) => "invalid_state",
            Self::Serialization(_) => "serialization_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
        }
    }
}

/// Result type for CDC operations
pub type Result<T> = std::result::Result<T, CdcError>;
