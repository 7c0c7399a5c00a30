//! Target process under test
//!
//! The process is started with piped stdout and stderr; both are pumped into
//! the tracker under the program's file name.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::{Child, Command};

use crate::common::{Error, Result};
use crate::tracker::{LineSink, LogPump};

/// A running application under test
pub struct TargetProcess {
    child: Child,
    command: String,
    pumps: Vec<LogPump>,
}

impl TargetProcess {
    /// Spawn `argv` and start pumping its output into `sink`
    pub fn spawn(argv: &[String], sink: &LineSink) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Config("Process command is empty".to_string()))?;
        let command = argv.join(" ");

        tracing::info!("Starting process: {}", command);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::process_start(&command, e))?;

        let source = Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.clone());

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(LogPump::spawn(source.as_str(), BufReader::new(stdout), sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(LogPump::spawn(source.as_str(), BufReader::new(stderr), sink.clone()));
        }

        Ok(Self {
            child,
            command,
            pumps,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Exit status if the process already exited
    pub fn try_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Terminate the process, then stop its pumps
    ///
    /// Sends SIGTERM (a kill on non-Unix platforms) and escalates to a kill
    /// when the process is still running after `grace`.
    pub async fn stop(
        mut self,
        grace: Duration,
        join_timeout: Duration,
    ) -> Result<Option<ExitStatus>> {
        let status = match self.child.try_wait()? {
            Some(status) => Some(status),
            None => {
                self.terminate();
                match tokio::time::timeout(grace, self.child.wait()).await {
                    Ok(status) => Some(status?),
                    Err(_) => {
                        tracing::warn!(
                            "Process '{}' did not exit within {:?}, killing it",
                            self.command,
                            grace
                        );
                        self.child.kill().await?;
                        self.child.try_wait()?
                    }
                }
            }
        };

        for pump in self.pumps.drain(..) {
            pump.stop(join_timeout).await;
        }

        tracing::info!("Process '{}' stopped ({:?})", self.command, status);
        Ok(status)
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            // SAFETY: plain signal delivery to our own child
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        let _ = self.child.start_kill();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::tracker::{LogBuffer, StateTracker};

    #[tokio::test]
    async fn test_output_reaches_tracker() {
        let tracker = StateTracker::new();
        let buffer = LogBuffer::new(100, 4096);
        let sink = LineSink::new(tracker.clone()).with_buffer(buffer.clone());

        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo '[SM:Door] INIT: state=CLOSED'; echo 'oops' >&2".to_string(),
        ];
        let process = TargetProcess::spawn(&argv, &sink).unwrap();

        let reached = tracker
            .wait_for_state("Door", "CLOSED", Duration::from_secs(2))
            .await;
        assert!(reached);

        let status = process
            .stop(Duration::from_secs(2), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(status.is_some());
        assert!(buffer.snapshot().iter().any(|l| l.text == "oops" && &*l.source == "sh"));
    }

    #[tokio::test]
    async fn test_stop_terminates_long_running_process() {
        let sink = LineSink::new(StateTracker::new());
        let argv = vec!["sleep".to_string(), "30".to_string()];
        let process = TargetProcess::spawn(&argv, &sink).unwrap();
        assert!(process.id().is_some());

        let started = std::time::Instant::now();
        let status = process
            .stop(Duration::from_secs(5), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_empty_command_rejected() {
        let sink = LineSink::new(StateTracker::new());
        assert!(matches!(TargetProcess::spawn(&[], &sink), Err(Error::Config(_))));
    }
}
