//! Error types and handling for Wattbench
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for Wattbench operations
pub type Result<T> = std::result::Result<T, BenchError>;

/// Main error type for Wattbench
#[derive(Debug, Error)]
pub enum BenchError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Cannot establish or maintain an instrument socket
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// File or socket I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Malformed or unparseable instrument reply
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// No reply within the configured bound
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Setpoint outside the configured safety range; no command was issued
    #[error("Range violation: {field} - {message}")]
    Range { field: String, message: String },

    /// Calibration run failed
    #[error("Calibration error: {message}")]
    Calibration { message: String },

    /// An instrument never settled within the calibration wait bound
    #[error("Calibration timeout: {message}")]
    CalibrationTimeout { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// HTTP/Web server errors
    #[error("Web server error: {message}")]
    Web { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl BenchError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        BenchError::Config {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        BenchError::Connection {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        BenchError::Io {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        BenchError::Protocol {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        BenchError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new range violation
    pub fn range<S: Into<String>>(field: S, message: S) -> Self {
        BenchError::Range {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new calibration error
    pub fn calibration<S: Into<String>>(message: S) -> Self {
        BenchError::Calibration {
            message: message.into(),
        }
    }

    /// Create a new calibration timeout
    pub fn calibration_timeout<S: Into<String>>(message: S) -> Self {
        BenchError::CalibrationTimeout {
            message: message.into(),
        }
    }

    /// Create a new web error
    pub fn web<S: Into<String>>(message: S) -> Self {
        BenchError::Web {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        BenchError::Generic {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for BenchError {
    fn from(err: std::io::Error) -> Self {
        BenchError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for BenchError {
    fn from(err: serde_yaml::Error) -> Self {
        BenchError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BenchError {
    fn from(err: serde_json::Error) -> Self {
        BenchError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<csv::Error> for BenchError {
    fn from(err: csv::Error) -> Self {
        BenchError::io(err.to_string())
    }
}
