//! Test environment lifecycle
//!
//! Owns everything that lives for the length of one suite run: the signal
//! client connection, the process under test, log captures and fixtures.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::common::config::Config;
use crate::common::Result;
use crate::signal::SignalClient;
use crate::target::{follow_container, tail_file, LogCapture, TargetProcess};
use crate::tracker::{LineSink, LogBuffer, StateTracker};

use super::fixtures::{self, RunningFixture};
use super::model::FixtureDef;

/// What to start around a suite
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Program and arguments of the process under test
    pub process: Option<Vec<String>>,
    /// Log file to tail
    pub log_file: Option<PathBuf>,
    /// Containers whose logs are followed
    pub containers: Vec<String>,
    /// Re-emit captured lines through tracing
    pub echo: bool,
    pub process_startup: Duration,
    pub process_stop: Duration,
    pub join_timeout: Duration,
    pub log_poll_interval: Duration,
}

impl EnvironmentConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            process: None,
            log_file: None,
            containers: Vec::new(),
            echo: true,
            process_startup: config.timeouts.process_startup(),
            process_stop: config.timeouts.process_stop(),
            join_timeout: config.timeouts.log_reader_join(),
            log_poll_interval: config.timeouts.log_poll_interval(),
        }
    }

    /// Whether any log source is configured
    pub fn has_log_source(&self) -> bool {
        self.process.is_some() || self.log_file.is_some() || !self.containers.is_empty()
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A started environment
pub struct Environment {
    client: Arc<dyn SignalClient>,
    process: Option<TargetProcess>,
    captures: Vec<LogCapture>,
    fixtures: Vec<RunningFixture>,
    config: EnvironmentConfig,
}

impl Environment {
    /// Connect the client, then start the process, log captures and fixtures
    ///
    /// Anything already started is torn down again when a later part fails.
    #[tracing::instrument(skip_all)]
    pub async fn start(
        client: Arc<dyn SignalClient>,
        tracker: &StateTracker,
        buffer: Option<&LogBuffer>,
        config: EnvironmentConfig,
        fixtures: &[FixtureDef],
    ) -> Result<Self> {
        client.connect().await?;
        tracing::info!("Connected to signal broker");

        let mut sink = LineSink::new(tracker.clone()).echo(config.echo);
        if let Some(buffer) = buffer {
            sink = sink.with_buffer(buffer.clone());
        }

        let mut env = Self {
            client,
            process: None,
            captures: Vec::new(),
            fixtures: Vec::new(),
            config,
        };

        if let Err(e) = env.start_sources(&sink, fixtures).await {
            env.shutdown().await;
            return Err(e);
        }
        Ok(env)
    }

    async fn start_sources(&mut self, sink: &LineSink, fixtures: &[FixtureDef]) -> Result<()> {
        if let Some(argv) = &self.config.process {
            let process = TargetProcess::spawn(argv, sink)?;
            tracing::info!(
                pid = ?process.id(),
                "Started process under test: {}",
                process.command()
            );
            self.process = Some(process);
        }

        for container in &self.config.containers {
            self.captures.push(follow_container(container, sink)?);
        }

        if let Some(path) = &self.config.log_file {
            self.captures
                .push(tail_file(path, sink, self.config.log_poll_interval).await?);
        }

        self.fixtures =
            fixtures::start_all(fixtures, &self.client, self.config.join_timeout).await?;

        if let Some(process) = &mut self.process {
            tokio::time::sleep(self.config.process_startup).await;
            if let Some(status) = process.try_status() {
                tracing::warn!("Process under test exited during startup: {}", status);
            }
        }
        Ok(())
    }

    pub fn client(&self) -> &Arc<dyn SignalClient> {
        &self.client
    }

    /// Stop fixtures, captures and the process, then disconnect
    ///
    /// Problems are logged; shutdown always runs to the end.
    #[tracing::instrument(skip_all)]
    pub async fn shutdown(mut self) {
        fixtures::stop_all(std::mem::take(&mut self.fixtures), self.config.join_timeout).await;

        for capture in self.captures.drain(..) {
            capture.stop(self.config.join_timeout).await;
        }

        if let Some(process) = self.process.take() {
            match process.stop(self.config.process_stop, self.config.join_timeout).await {
                Ok(Some(status)) => tracing::info!("Process under test exited: {}", status),
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to stop process under test: {}", e),
            }
        }

        if let Err(e) = self.client.disconnect().await {
            tracing::warn!("Failed to disconnect from signal broker: {}", e);
        }
        tracing::debug!("Environment shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;
    use crate::signal::MemoryBroker;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_output_reaches_tracker() {
        let broker = Arc::new(MemoryBroker::new());
        let tracker = StateTracker::new().with_poll_interval(Duration::from_millis(10));
        let buffer = LogBuffer::new(100, 4096);
        let config = EnvironmentConfig {
            process: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo '[SM:Door] INIT: state=CLOSED'; sleep 5".to_string(),
            ]),
            process_startup: Duration::from_millis(10),
            process_stop: Duration::from_secs(1),
            echo: false,
            ..EnvironmentConfig::default()
        };

        let env = Environment::start(broker.clone(), &tracker, Some(&buffer), config, &[])
            .await
            .unwrap();
        assert!(broker.is_connected());
        assert!(tracker.wait_for_state("Door", "CLOSED", Duration::from_secs(2)).await);
        assert!(buffer.has_source("sh"));

        env.shutdown().await;
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn test_failed_source_disconnects() {
        let broker = Arc::new(MemoryBroker::new());
        let config = EnvironmentConfig {
            log_file: Some(PathBuf::from("/nonexistent/sdv/app.log")),
            ..EnvironmentConfig::default()
        };

        let result =
            Environment::start(broker.clone(), &StateTracker::new(), None, config, &[]).await;
        assert!(matches!(result, Err(Error::FileRead { .. })));
        assert!(!broker.is_connected());
    }
}
