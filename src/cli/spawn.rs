//! Broker spawning logic
//!
//! Automatically spawns the broker daemon when needed, using the same binary
//! with the hidden `broker` subcommand.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::broker::BrokerClient;
use crate::common::{paths, Error, Result};

/// Timeout for the broker to start up
const SPAWN_TIMEOUT_SECS: u64 = 5;

/// Interval between connection attempts while the broker starts
const SPAWN_POLL: Duration = Duration::from_millis(50);

/// Ensure a broker is answering on `socket`, spawning one if necessary
pub async fn ensure_broker_running(socket: &Path) -> Result<()> {
    if BrokerClient::ping(socket).await {
        return Ok(());
    }
    spawn_broker(socket).await
}

async fn spawn_broker(socket: &Path) -> Result<()> {
    tracing::debug!("Spawning broker process for {}", socket.display());

    let exe_path = std::env::current_exe()
        .map_err(|e| Error::Internal(format!("Failed to get current executable path: {}", e)))?;

    paths::ensure_socket_dir(socket)?;
    paths::remove_socket(socket)?;

    let mut command = std::process::Command::new(&exe_path);
    command
        .arg("broker")
        .env(paths::SOCKET_ENV, socket)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    // The broker logs to its own file and must outlive this process
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x00000008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    command
        .spawn()
        .map_err(|e| Error::process_start(&format!("{} broker", exe_path.display()), e))?;

    let deadline = Instant::now() + Duration::from_secs(SPAWN_TIMEOUT_SECS);
    loop {
        if Instant::now() >= deadline {
            return Err(Error::BrokerSpawnTimeout(SPAWN_TIMEOUT_SECS));
        }

        tokio::time::sleep(SPAWN_POLL).await;

        #[cfg(unix)]
        if !socket.exists() {
            continue;
        }

        if BrokerClient::ping(socket).await {
            tracing::debug!("Broker started successfully");
            return Ok(());
        }
    }
}
