//! Command handler for broker requests
//!
//! Translates protocol commands into operations on the shared
//! [`MemoryBroker`].

use serde_json::json;

use crate::common::{error::IpcError, Result};
use crate::signal::{MemoryBroker, SignalClient, SignalWrite};

use super::protocol::{Command, Response, StatusInfo};
use super::server::Shared;

/// Handle one request
pub async fn handle_command(shared: &Shared, id: u64, command: Command) -> Response {
    match handle_command_inner(shared, command).await {
        Ok(result) => Response::success(id, result),
        Err(e) => Response::error(id, IpcError::from(&e)),
    }
}

async fn handle_command_inner(shared: &Shared, command: Command) -> Result<serde_json::Value> {
    let broker: &MemoryBroker = &shared.broker;

    match command {
        Command::Get { path, mode } => {
            let value = broker.get(&path, mode).await?;
            Ok(serde_json::to_value(value)?)
        }

        Command::GetMany { paths, mode } => {
            let values = broker.get_many(&paths, mode).await?;
            Ok(serde_json::to_value(values)?)
        }

        Command::Set { path, value, mode } => {
            broker.set_many(&[SignalWrite { path, value, mode }]).await?;
            Ok(json!({ "written": 1 }))
        }

        Command::SetMany { writes } => {
            broker.set_many(&writes).await?;
            Ok(json!({ "written": writes.len() }))
        }

        Command::Status => {
            let (current, target) = broker.snapshot();
            let status = StatusInfo {
                version: env!("CARGO_PKG_VERSION").to_string(),
                pid: std::process::id(),
                uptime_secs: shared.started.elapsed().as_secs(),
                current_signals: current.len(),
                target_signals: target.len(),
                clients: shared.client_count(),
            };
            Ok(serde_json::to_value(status)?)
        }

        // Intercepted by the server before dispatch
        Command::Shutdown => Ok(json!({})),
    }
}
