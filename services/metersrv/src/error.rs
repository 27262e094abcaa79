//! Error handling for the meter acquisition service
//!
//! Three kinds matter to the pipeline: connection failures are absorbed by the
//! owning connection manager, read failures abort a single cycle, and decode
//! violations are configuration mismatches caught once at startup.

use thiserror::Error;

/// Meter Service Error Type
#[derive(Error, Debug, Clone)]
pub enum MeterSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Transport or storage unreachable/rejected
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Short, empty or malformed response for a sub-range read
    #[error("Read failed at address {address} (count {count}): {reason}")]
    ReadError {
        address: u16,
        count: u16,
        reason: String,
    },

    /// Field layout references words outside the raw block set
    #[error("Decode violation: {0}")]
    DecodeError(String),

    /// Malformed or unexpected protocol frame
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Durable store errors
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),
}

/// Result type alias for the meter service
pub type Result<T> = std::result::Result<T, MeterSrvError>;

impl MeterSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        MeterSrvError::ConfigError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        MeterSrvError::ConnectionError(msg.into())
    }

    pub fn read(address: u16, count: u16, reason: impl Into<String>) -> Self {
        MeterSrvError::ReadError {
            address,
            count,
            reason: reason.into(),
        }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        MeterSrvError::DecodeError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        MeterSrvError::ProtocolError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        MeterSrvError::TimeoutError(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        MeterSrvError::StorageError(msg.into())
    }

    pub fn not_connected() -> Self {
        MeterSrvError::ConnectionError("Not connected".to_string())
    }

    /// Whether this error should abort the current acquisition cycle
    pub fn is_read_failure(&self) -> bool {
        matches!(
            self,
            MeterSrvError::ReadError { .. }
                | MeterSrvError::ProtocolError(_)
                | MeterSrvError::TimeoutError(_)
                | MeterSrvError::IoError(_)
        )
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for MeterSrvError {
    fn from(err: std::io::Error) -> Self {
        MeterSrvError::IoError(err.to_string())
    }
}

impl From<sqlx::Error> for MeterSrvError {
    fn from(err: sqlx::Error) -> Self {
        MeterSrvError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for MeterSrvError {
    fn from(err: serde_json::Error) -> Self {
        MeterSrvError::StorageError(format!("JSON: {}", err))
    }
}

impl From<figment::Error> for MeterSrvError {
    fn from(err: figment::Error) -> Self {
        MeterSrvError::ConfigError(err.to_string())
    }
}
