//! Error types for the test runner
//!
//! Messages are meant to be read by whoever is running the suite, so each
//! one says what went wrong and, where there is one, how to fix it.

use std::io;
use thiserror::Error;

use crate::expr::ExprError;
use crate::signal::ValidationError;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the test runner
#[derive(Error, Debug)]
pub enum Error {
    // === Broker/Connection Errors ===
    #[error("Signal broker not running. Start it with 'sdv-test broker' or use '--broker memory'")]
    BrokerNotRunning,

    #[error("Failed to spawn signal broker: timed out waiting for socket after {0} seconds")]
    BrokerSpawnTimeout(u64),

    #[error("Failed to connect to signal broker: {0}")]
    BrokerConnectionFailed(#[source] io::Error),

    #[error("Signal broker communication error: {0}")]
    BrokerCommunication(String),

    // === Signal Errors ===
    #[error("Signal client is not connected. Connect before reading or writing signals")]
    NotConnected,

    #[error("Signal '{0}' not found")]
    SignalNotFound(String),

    #[error("Signal '{0}' has no value yet")]
    NoValue(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    // === Expression Errors ===
    #[error(transparent)]
    Expression(#[from] ExprError),

    // === Suite and Catalogue Errors ===
    #[error("Invalid test suite '{path}': {message}")]
    SuiteParse { path: String, message: String },

    #[error("Invalid vehicle spec '{path}': {message}")]
    SpecParse { path: String, message: String },

    #[error("Invalid step: {0}")]
    InvalidStep(String),

    // === Process Errors ===
    #[error("Failed to start '{command}': {message}")]
    ProcessStart { command: String, message: String },

    #[error("'{0}' not found in PATH")]
    ToolNotFound(String),

    // === Timeout Errors ===
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a process start error
    pub fn process_start(command: &str, message: impl ToString) -> Self {
        Self::ProcessStart {
            command: command.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a file read error
    pub fn file_read(path: &std::path::Path, error: impl ToString) -> Self {
        Self::FileRead {
            path: path.display().to_string(),
            error: error.to_string(),
        }
    }

    /// Create a suite parse error
    pub fn suite_parse(path: &str, message: impl ToString) -> Self {
        Self::SuiteParse {
            path: path.to_string(),
            message: message.to_string(),
        }
    }
}

/// IPC-serializable error for broker responses
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IpcError {
    pub code: String,
    pub message: String,
    /// Signal path the error refers to, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl From<&Error> for IpcError {
    fn from(e: &Error) -> Self {
        let (code, message, path) = match e {
            Error::NotConnected => ("NOT_CONNECTED", e.to_string(), None),
            Error::SignalNotFound(p) => ("SIGNAL_NOT_FOUND", e.to_string(), Some(p.clone())),
            Error::NoValue(p) => ("NO_VALUE", e.to_string(), Some(p.clone())),
            Error::Validation(v) => ("VALIDATION", v.reason.clone(), Some(v.path.clone())),
            Error::Timeout(_) => ("TIMEOUT", e.to_string(), None),
            _ => ("INTERNAL_ERROR", e.to_string(), None),
        };

        Self {
            code: code.to_string(),
            message,
            path,
        }
    }
}

impl From<IpcError> for Error {
    fn from(e: IpcError) -> Self {
        // Map IPC errors back to our error types where possible
        match (e.code.as_str(), e.path) {
            ("NOT_CONNECTED", _) => Error::NotConnected,
            ("SIGNAL_NOT_FOUND", Some(path)) => Error::SignalNotFound(path),
            ("NO_VALUE", Some(path)) => Error::NoValue(path),
            ("VALIDATION", Some(path)) => Error::Validation(ValidationError {
                path,
                reason: e.message,
            }),
            ("TIMEOUT", _) => Error::Timeout(0),
            _ => Error::BrokerCommunication(e.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_error_round_trip_keeps_kind() {
        let original = Error::SignalNotFound("Vehicle.Speed".to_string());
        let ipc = IpcError::from(&original);
        assert_eq!(ipc.code, "SIGNAL_NOT_FOUND");
        assert!(matches!(Error::from(ipc), Error::SignalNotFound(p) if p == "Vehicle.Speed"));

        let original = Error::Validation(ValidationError {
            path: "Vehicle.Speed".to_string(),
            reason: "value 300 above max 250".to_string(),
        });
        match Error::from(IpcError::from(&original)) {
            Error::Validation(v) => assert_eq!(v.reason, "value 300 above max 250"),
            other => panic!("Expected Validation, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_ipc_code_is_communication_error() {
        let ipc = IpcError {
            code: "SOMETHING_ELSE".to_string(),
            message: "boom".to_string(),
            path: None,
        };
        assert!(matches!(Error::from(ipc), Error::BrokerCommunication(m) if m == "boom"));
    }
}
