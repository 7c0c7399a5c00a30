//! Feeding log streams into the tracker
//!
//! A [`LogPump`] is a background task that reads lines from a process pipe,
//! a container log follower or a tailed file, hands each line to the
//! [`StateTracker`] and keeps a bounded copy in a [`LogBuffer`] for log
//! pattern expectations.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::StateTracker;
use crate::common::logging::TARGET_LOG;

/// One captured line and the source it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub source: Arc<str>,
    pub text: String,
}

#[derive(Debug)]
struct BufferState {
    lines: VecDeque<LogLine>,
    bytes: usize,
    max_lines: usize,
    max_bytes: usize,
}

/// Bounded buffer of recent log lines, shared between pumps and the runner
///
/// Oldest lines are dropped first once either the line count or the byte
/// limit would be exceeded.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<BufferState>>,
}

impl LogBuffer {
    pub fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BufferState {
                lines: VecDeque::new(),
                bytes: 0,
                max_lines: max_lines.max(1),
                max_bytes: max_bytes.max(1),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, source: &Arc<str>, line: &str) {
        let mut state = self.lock();

        let text: String = if line.len() > state.max_bytes {
            let mut end = state.max_bytes;
            while !line.is_char_boundary(end) {
                end -= 1;
            }
            line[..end].to_string()
        } else {
            line.to_string()
        };

        while state.bytes + text.len() > state.max_bytes || state.lines.len() >= state.max_lines {
            match state.lines.pop_front() {
                Some(removed) => state.bytes = state.bytes.saturating_sub(removed.text.len()),
                None => break,
            }
        }

        state.bytes += text.len();
        state.lines.push_back(LogLine {
            source: Arc::clone(source),
            text,
        });
    }

    /// First buffered line matching `pattern`, optionally from one source
    pub fn find(&self, pattern: &Regex, source: Option<&str>) -> Option<LogLine> {
        self.lock()
            .lines
            .iter()
            .filter(|l| source.is_none_or(|s| &*l.source == s))
            .find(|l| pattern.is_match(&l.text))
            .cloned()
    }

    /// Whether any line has been captured from `source`
    pub fn has_source(&self, source: &str) -> bool {
        self.lock().lines.iter().any(|l| &*l.source == source)
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lock().lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.lines.clear();
        state.bytes = 0;
    }
}

/// Where a pump delivers its lines
#[derive(Debug, Clone)]
pub struct LineSink {
    pub tracker: StateTracker,
    pub buffer: Option<LogBuffer>,
    /// Re-emit each line through tracing under the `sdv_test::target` target
    pub echo: bool,
}

impl LineSink {
    pub fn new(tracker: StateTracker) -> Self {
        Self {
            tracker,
            buffer: None,
            echo: false,
        }
    }

    pub fn with_buffer(mut self, buffer: LogBuffer) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    fn accept(&self, source: &Arc<str>, line: &str) {
        if self.echo {
            tracing::info!(target: TARGET_LOG, source = %source, "{}", line);
        }
        self.tracker.process_line(line, None);
        if let Some(buffer) = &self.buffer {
            buffer.push(source, line);
        }
    }
}

/// Background task pumping lines from a reader into a [`LineSink`]
#[derive(Debug)]
pub struct LogPump {
    source: Arc<str>,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

impl LogPump {
    /// Start reading `reader` until EOF, a read error, or [`LogPump::stop`]
    pub fn spawn<R>(source: impl Into<Arc<str>>, reader: R, sink: LineSink) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let source: Arc<str> = source.into();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task_source = Arc::clone(&source);

        let handle = tokio::spawn(async move {
            let mut reader = reader;
            let mut buf = Vec::new();
            let mut count = 0u64;

            loop {
                buf.clear();
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    read = reader.read_until(b'\n', &mut buf) => match read {
                        Ok(0) => break,
                        Ok(_) => {
                            let line = String::from_utf8_lossy(&buf);
                            let line = line.trim();
                            if !line.is_empty() {
                                sink.accept(&task_source, line);
                                count += 1;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(source = %task_source, "Log stream read failed: {}", e);
                            break;
                        }
                    }
                }
            }

            tracing::debug!(source = %task_source, lines = count, "Log pump finished");
            count
        });

        Self {
            source,
            stop_tx,
            handle,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the reader reached EOF or failed
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the pump, waiting at most `join_timeout` before aborting it
    ///
    /// Returns the number of lines processed, or `None` if the task had to
    /// be aborted or panicked.
    pub async fn stop(mut self, join_timeout: Duration) -> Option<u64> {
        let _ = self.stop_tx.send(true);
        match tokio::time::timeout(join_timeout, &mut self.handle).await {
            Ok(Ok(count)) => Some(count),
            Ok(Err(e)) => {
                tracing::warn!(source = %self.source, "Log pump task failed: {}", e);
                None
            }
            Err(_) => {
                tracing::warn!(
                    source = %self.source,
                    "Log pump did not stop within {:?}, aborting",
                    join_timeout
                );
                self.handle.abort();
                None
            }
        }
    }
}
