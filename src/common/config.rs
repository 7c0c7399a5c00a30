//! Configuration file handling

use serde::Deserialize;
use std::time::Duration;

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Default settings
    #[serde(default)]
    pub defaults: Defaults,

    /// Timeout and polling settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Captured log buffer settings
    #[serde(default)]
    pub logs: LogConfig,

    /// Signal broker daemon settings
    #[serde(default)]
    pub broker: BrokerConfig,
}

/// Default settings
#[derive(Debug, Deserialize, Clone)]
pub struct Defaults {
    /// Signal broker to use: `local` (daemon) or `memory` (in-process)
    #[serde(default = "default_broker")]
    pub broker: String,

    /// Shell used for `run` steps
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            shell: default_shell(),
        }
    }
}

fn default_broker() -> String {
    "local".to_string()
}

fn default_shell() -> String {
    "sh".to_string()
}

/// Timeouts and poll intervals
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Timeout for steps that do not set one
    #[serde(default = "default_step_secs")]
    pub step_default_secs: f64,

    /// Interval between polls for signal and state expectations
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Interval between scans of the captured log buffer
    #[serde(default = "default_log_poll_interval")]
    pub log_poll_interval_ms: u64,

    /// How long to wait for a log reader to stop before aborting it
    #[serde(default = "default_log_reader_join")]
    pub log_reader_join_ms: u64,

    /// Grace period after spawning the process under test
    #[serde(default = "default_process_startup")]
    pub process_startup_ms: u64,

    /// How long to wait for the process under test to exit after SIGTERM
    #[serde(default = "default_process_stop")]
    pub process_stop_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            step_default_secs: default_step_secs(),
            poll_interval_ms: default_poll_interval(),
            log_poll_interval_ms: default_log_poll_interval(),
            log_reader_join_ms: default_log_reader_join(),
            process_startup_ms: default_process_startup(),
            process_stop_secs: default_process_stop(),
        }
    }
}

impl Timeouts {
    pub fn step_default(&self) -> Duration {
        Duration::try_from_secs_f64(self.step_default_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_step_secs()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_interval_ms.max(1))
    }

    pub fn log_reader_join(&self) -> Duration {
        Duration::from_millis(self.log_reader_join_ms)
    }

    pub fn process_startup(&self) -> Duration {
        Duration::from_millis(self.process_startup_ms)
    }

    pub fn process_stop(&self) -> Duration {
        Duration::from_secs(self.process_stop_secs)
    }
}

fn default_step_secs() -> f64 {
    5.0
}
fn default_poll_interval() -> u64 {
    100
}
fn default_log_poll_interval() -> u64 {
    500
}
fn default_log_reader_join() -> u64 {
    2000
}
fn default_process_startup() -> u64 {
    1000
}
fn default_process_stop() -> u64 {
    5
}

/// Captured log buffer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// Maximum number of lines kept for `expect_log`
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,

    /// Maximum total bytes kept for `expect_log`
    #[serde(default = "default_max_bytes")]
    pub max_bytes_mb: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_lines: default_max_lines(),
            max_bytes_mb: default_max_bytes(),
        }
    }
}

impl LogConfig {
    pub fn max_bytes(&self) -> usize {
        self.max_bytes_mb.saturating_mul(1024 * 1024)
    }
}

fn default_max_lines() -> usize {
    10_000
}
fn default_max_bytes() -> usize {
    10
}

/// Broker daemon configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    /// Auto-exit after this many minutes without a client; 0 disables
    #[serde(default)]
    pub idle_timeout_minutes: u64,

    /// Poll interval backing `subscribe` on the broker client
    #[serde(default = "default_subscribe_poll")]
    pub subscribe_poll_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: 0,
            subscribe_poll_ms: default_subscribe_poll(),
        }
    }
}

fn default_subscribe_poll() -> u64 {
    100
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| super::Error::file_read(&path, e))?;
                return Self::from_toml(&content);
            }
        }
        Ok(Self::default())
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.timeouts.step_default(), Duration::from_secs(5));
        assert_eq!(config.timeouts.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.logs.max_bytes(), 10 * 1024 * 1024);
        assert_eq!(config.defaults.broker, "local");
        assert_eq!(config.broker.idle_timeout_minutes, 0);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [timeouts]
            poll_interval_ms = 20

            [defaults]
            shell = "bash"
            "#,
        )
        .unwrap();
        assert_eq!(config.timeouts.poll_interval_ms, 20);
        assert_eq!(config.timeouts.log_poll_interval_ms, 500);
        assert_eq!(config.defaults.shell, "bash");
        assert_eq!(config.defaults.broker, "local");
    }

    #[test]
    fn test_out_of_range_step_timeout_falls_back() {
        let config = Config::from_toml("[timeouts]\nstep_default_secs = 1e30\n").unwrap();
        assert_eq!(config.timeouts.step_default(), Duration::from_secs(5));
        let config = Config::from_toml("[timeouts]\nstep_default_secs = -1.0\n").unwrap();
        assert_eq!(config.timeouts.step_default(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            Config::from_toml("[timeouts\n"),
            Err(crate::common::Error::ConfigParse(_))
        ));
    }
}
