//! Error types for the sync pipeline
//!
//! One error enum for every stage (reader, dispatcher, handlers) with the
//! classification the broker uses to decide whether a job is worth retrying.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for logging and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Relational database errors (queries, pool)
    Database,
    /// Binlog replication errors
    Replication,
    /// Change records whose shape contradicts their action
    Record,
    /// Invalid settings
    Configuration,
    /// Network errors (connection, timeout)
    Network,
    /// Task broker submission errors
    Broker,
    /// Search index errors
    Index,
    /// Checkpoint persistence errors
    Checkpoint,
    /// JSON / YAML errors
    Serialization,
    /// Other/unknown errors
    Other,
}

/// Pipeline errors
#[derive(Error, Debug)]
pub enum SyncError {
    /// MySQL query / pool error
    #[error("MySQL error: {0}")]
    MySql(String),

    /// Replication protocol error
    #[error("Replication error: {0}")]
    Replication(String),

    /// Malformed change record
    #[error("Malformed record: {0}")]
    Shape(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker refused or failed to accept a job
    #[error("Broker error: {0}")]
    Broker(String),

    /// Search index request failed
    #[error("Index error: {0}")]
    Index(String),

    /// Checkpoint could not be read or written
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Create a new MySQL error
    pub fn mysql(msg: impl Into<String>) -> Self {
        Self::MySql(msg.into())
    }

    /// Create a new replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a new malformed-record error
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new broker error
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    /// Create a new index error
    pub fn index(msg: impl Into<String>) -> Self {
        Self::Index(msg.into())
    }

    /// Create a new checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a new serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient errors that may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConnectionClosed | Self::Timeout(_) => true,

            // The index and the broker are remote services; treat their
            // failures as transient and let max_attempts decide.
            Self::Index(_) | Self::Broker(_) => true,

            Self::Replication(msg) => {
                msg.contains("temporarily")
                    || msg.contains("connection reset")
                    || msg.contains("connection lost")
            }

            Self::MySql(msg) => {
                msg.contains("Lost connection")
                    || msg.contains("Deadlock")
                    || msg.contains("Lock wait timeout")
            }

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::Shape(_)
            | Self::Config(_)
            | Self::Checkpoint(_)
            | Self::Serialization(_)
            | Self::Json(_)
            | Self::InvalidState(_)
            | Self::Other(_) => false,
        }
    }

    /// Get the error category for logging and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MySql(_) => ErrorCategory::Database,
            Self::Replication(_) => ErrorCategory::Replication,
            Self::Shape(_) => ErrorCategory::Record,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Broker(_) => ErrorCategory::Broker,
            Self::Index(_) => ErrorCategory::Index,
            Self::Checkpoint(_) => ErrorCategory::Checkpoint,
            Self::Timeout(_) | Self::ConnectionClosed | Self::Io(_) => ErrorCategory::Network,
            Self::Serialization(_) | Self::Json(_) => ErrorCategory::Serialization,
            Self::InvalidState(_) | Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get a stable error code for structured logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MySql(_) => "mysql_error",
            Self::Replication(_) => "replication_error",
            Self::Shape(_) => "malformed_record",
            Self::Config(_) => "config_error",
            Self::Broker(_) => "broker_error",
            Self::Index(_) => "index_error",
            Self::Checkpoint(_) => "checkpoint_error",
            Self::Serialization(_) => "serialization_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Timeout(_) => "timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::InvalidState(_) => "invalid_state",
            Self::Other(_) => "unknown",
        }
    }
}

impl From<mysql_async::Error> for SyncError {
    fn from(e: mysql_async::Error) -> Self {
        Self::MySql(e.to_string())
    }
}

impl From<serde_yaml::Error> for SyncError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::replication("Connection lost");
        assert!(err.to_string().contains("Replication error"));
        assert!(err.to_string().contains("Connection lost"));

        let err = SyncError::shape("insert without after image");
        assert_eq!(
            err.to_string(),
            "Malformed record: insert without after image"
        );
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(SyncError::ConnectionClosed.is_retriable());
        assert!(SyncError::timeout("5s").is_retriable());
        assert!(SyncError::index("503 Service Unavailable").is_retriable());
        assert!(SyncError::broker("connection refused").is_retriable());
        assert!(SyncError::mysql("Lost connection to MySQL server").is_retriable());
        assert!(!SyncError::mysql("Unknown column 'x'").is_retriable());
        assert!(!SyncError::shape("missing id").is_retriable());
        assert!(!SyncError::config("bad config").is_retriable());
        assert!(!SyncError::checkpoint("disk full").is_retriable());
    }

    #[test]
    fn test_io_error_retriable_by_kind() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(SyncError::from(reset).is_retriable());

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(!SyncError::from(missing).is_retriable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            SyncError::replication("x").category(),
            ErrorCategory::Replication
        );
        assert_eq!(SyncError::shape("x").category(), ErrorCategory::Record);
        assert_eq!(
            SyncError::config("x").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(SyncError::broker("x").category(), ErrorCategory::Broker);
        assert_eq!(
            SyncError::ConnectionClosed.category(),
            ErrorCategory::Network
        );
        assert_eq!(SyncError::other("x").category(), ErrorCategory::Other);
    }

    #[test]
    fn test_error_code() {
        assert_eq!(SyncError::checkpoint("x").error_code(), "checkpoint_error");
        assert_eq!(SyncError::ConnectionClosed.error_code(), "connection_closed");
        assert_eq!(SyncError::shape("x").error_code(), "malformed_record");
    }

    #[test]
    fn test_category_serialization() {
        let json = serde_json::to_string(&ErrorCategory::Checkpoint).unwrap();
        assert_eq!(json, "\"checkpoint\"");
    }
}
