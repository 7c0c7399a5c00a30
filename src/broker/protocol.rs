//! Broker protocol message types
//!
//! Defines the request/response format between signal clients and the broker
//! daemon. Messages are JSON, framed by the length prefix in
//! [`super::transport`].

use serde::{Deserialize, Serialize};

use crate::common::error::IpcError;
use crate::expr::Value;
use crate::signal::{ActuatorMode, SignalWrite};

/// Request from a client to the broker
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for matching responses
    pub id: u64,
    /// The command to execute
    pub command: Command,
}

/// Response from the broker
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    /// Request ID this response corresponds to
    pub id: u64,
    /// Whether the command succeeded
    pub success: bool,
    /// Result data on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error information on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
}

impl Response {
    /// Create a success response
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: u64, error: IpcError) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error),
        }
    }

    /// Create a success response with no data
    pub fn ok(id: u64) -> Self {
        Self::success(id, serde_json::json!({}))
    }
}

/// Commands understood by the broker
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Read one signal
    Get {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<ActuatorMode>,
    },

    /// Read several signals; fails if any of them fails
    GetMany {
        paths: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<ActuatorMode>,
    },

    /// Write one signal
    Set {
        path: String,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<ActuatorMode>,
    },

    /// Write several signals at once
    SetMany { writes: Vec<SignalWrite> },

    /// Broker status
    Status,

    /// Stop the broker
    Shutdown,
}

/// Result of [`Command::Status`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub version: String,
    pub pid: u32,
    pub uptime_secs: u64,
    /// Signals with a current value
    pub current_signals: usize,
    /// Signals with a target value
    pub target_signals: usize,
    pub clients: usize,
}
