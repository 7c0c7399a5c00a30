//! Socket, configuration and log locations
//!
//! Unix/macOS: the broker listens on a Unix domain socket under
//! `$XDG_RUNTIME_DIR` or `/tmp`. Windows: a named pipe per user.
//! `SDV_TEST_SOCKET` overrides the location on every platform.

use std::io;
use std::path::{Path, PathBuf};

/// Application name used for directories and the socket
const APP_NAME: &str = "sdv-test";

/// Environment variable overriding the broker socket location
pub const SOCKET_ENV: &str = "SDV_TEST_SOCKET";

/// Get the socket/pipe path for the signal broker
///
/// - `$SDV_TEST_SOCKET` when set
/// - Unix: `$XDG_RUNTIME_DIR/sdv-test/broker.sock` or `/tmp/sdv-test-<uid>/broker.sock`
/// - Windows: pipe name (handled by interprocess crate)
pub fn socket_path() -> PathBuf {
    if let Some(path) = std::env::var_os(SOCKET_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    default_socket_path()
}

#[cfg(unix)]
fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_NAME).join("broker.sock");
    }

    // Fallback to /tmp with uid so users do not share a broker
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid)).join("broker.sock")
}

#[cfg(windows)]
fn default_socket_path() -> PathBuf {
    let username = std::env::var("USERNAME").unwrap_or_else(|_| "default".to_string());
    PathBuf::from(format!("{}-{}", APP_NAME, username))
}

/// Ensure the directory holding `socket` exists with owner-only permissions
#[cfg(unix)]
pub fn ensure_socket_dir(socket: &Path) -> io::Result<()> {
    let dir = socket
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Invalid socket path"))?;

    if !dir.as_os_str().is_empty() && !dir.exists() {
        std::fs::create_dir_all(dir)?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(windows)]
pub fn ensure_socket_dir(_socket: &Path) -> io::Result<()> {
    Ok(())
}

/// Remove a stale socket file
#[cfg(unix)]
pub fn remove_socket(socket: &Path) -> io::Result<()> {
    if socket.exists() {
        std::fs::remove_file(socket)?;
    }
    Ok(())
}

#[cfg(windows)]
pub fn remove_socket(_socket: &Path) -> io::Result<()> {
    Ok(())
}

/// Get the configuration directory path
///
/// - Linux: `~/.config/sdv-test/`
/// - macOS: `~/Library/Application Support/sdv-test/`
/// - Windows: `%APPDATA%\sdv-test\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the log directory used by the broker daemon
pub fn log_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.data_dir().join("logs"))
}
