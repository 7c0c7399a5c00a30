//! Container and file log capture

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::common::{Error, Result};
use crate::tracker::{LineSink, LogPump};

/// Pipe capacity between the file tailer and its pump
const TAIL_PIPE_BYTES: usize = 64 * 1024;

/// Read size for each tail poll
const TAIL_CHUNK_BYTES: usize = 8 * 1024;

/// A running log capture and whatever feeds it
pub struct LogCapture {
    name: String,
    pumps: Vec<LogPump>,
    follower: Option<Child>,
    tailer: Option<JoinHandle<()>>,
}

impl LogCapture {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the feeding side first, then the pumps
    pub async fn stop(mut self, join_timeout: Duration) {
        if let Some(mut child) = self.follower.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!("Log follower for '{}' already gone: {}", self.name, e);
            }
        }
        if let Some(tailer) = self.tailer.take() {
            tailer.abort();
        }
        for pump in self.pumps.drain(..) {
            pump.stop(join_timeout).await;
        }
        tracing::debug!("Stopped log capture for '{}'", self.name);
    }
}

/// Follow `docker logs -f <container>`
///
/// Lines are tagged with the container name so log expectations can select
/// them.
pub fn follow_container(container: &str, sink: &LineSink) -> Result<LogCapture> {
    let docker = which::which("docker").map_err(|_| Error::ToolNotFound("docker".to_string()))?;

    let mut child = Command::new(docker)
        .args(["logs", "-f", container])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::process_start(&format!("docker logs -f {container}"), e))?;

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(LogPump::spawn(container, BufReader::new(stdout), sink.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(LogPump::spawn(container, BufReader::new(stderr), sink.clone()));
    }

    tracing::info!("Started log capture for container: {}", container);
    Ok(LogCapture {
        name: container.to_string(),
        pumps,
        follower: Some(child),
        tailer: None,
    })
}

/// Tail `path` from its beginning, polling for growth every `interval`
///
/// A file that shrinks is assumed rotated and is read again from the start.
pub async fn tail_file(path: &Path, sink: &LineSink, interval: Duration) -> Result<LogCapture> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::file_read(path, e))?;

    let source = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let (reader, writer) = tokio::io::duplex(TAIL_PIPE_BYTES);
    let pump = LogPump::spawn(source.as_str(), BufReader::new(reader), sink.clone());
    let tailer = tokio::spawn(tail_loop(path.to_path_buf(), file, writer, interval));

    tracing::info!("Tailing log file: {}", path.display());
    Ok(LogCapture {
        name: source,
        pumps: vec![pump],
        follower: None,
        tailer: Some(tailer),
    })
}

async fn tail_loop(
    path: PathBuf,
    mut file: tokio::fs::File,
    mut out: tokio::io::DuplexStream,
    interval: Duration,
) {
    let mut offset = 0u64;
    let mut buf = vec![0u8; TAIL_CHUNK_BYTES];

    loop {
        match file.read(&mut buf).await {
            Ok(0) => {
                let len = match tokio::fs::metadata(&path).await {
                    Ok(meta) => meta.len(),
                    Err(e) => {
                        tracing::warn!("Log file {} unavailable: {}", path.display(), e);
                        return;
                    }
                };
                if len < offset {
                    tracing::debug!("Log file {} truncated, rereading", path.display());
                    if file.seek(SeekFrom::Start(0)).await.is_err() {
                        return;
                    }
                    offset = 0;
                    continue;
                }
                tokio::time::sleep(interval).await;
            }
            Ok(n) => {
                offset += n as u64;
                if out.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("Reading {} failed: {}", path.display(), e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{LogBuffer, StateTracker};
    use std::io::Write;

    #[tokio::test]
    async fn test_tail_reads_existing_and_appended_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[SM:Seat] INIT: state=IDLE").unwrap();
        file.flush().unwrap();

        let tracker = StateTracker::new().with_poll_interval(Duration::from_millis(10));
        let buffer = LogBuffer::new(100, 4096);
        let sink = LineSink::new(tracker.clone()).with_buffer(buffer.clone());

        let capture = tail_file(file.path(), &sink, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(tracker.wait_for_state("Seat", "IDLE", Duration::from_secs(2)).await);

        writeln!(file, "[SM:Seat] TRANSITION: IDLE -> MOVING | trigger=move").unwrap();
        file.flush().unwrap();
        assert!(
            tracker
                .wait_for_transition("Seat", "IDLE", "MOVING", Some("move"), Duration::from_secs(2))
                .await
        );

        capture.stop(Duration::from_secs(1)).await;
        assert_eq!(buffer.len(), 2);
    }

    #[tokio::test]
    async fn test_tail_missing_file() {
        let sink = LineSink::new(StateTracker::new());
        let result = tail_file(
            Path::new("/nonexistent/app.log"),
            &sink,
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(Error::FileRead { .. })));
    }
}
