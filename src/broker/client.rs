//! Signal client talking to the broker daemon

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::common::error::IpcError;
use crate::common::{Error, Result};
use crate::expr::Value;
use crate::signal::{ActuatorMode, SignalClient, SignalStream, SignalValue, SignalWrite};

use super::protocol::{Command, Request, Response, StatusInfo};
use super::transport::{self, Stream};

const DEFAULT_SUBSCRIBE_POLL: Duration = Duration::from_millis(100);

/// Upper bound on one request/response round trip
const REQUEST_TIMEOUT_SECS: u64 = 30;

struct Connection {
    reader: ReadHalf<Stream>,
    writer: WriteHalf<Stream>,
    next_id: u64,
    /// Set once the stream failed and may be out of sync
    broken: bool,
}

impl Connection {
    async fn open(socket: &Path) -> Result<Self> {
        let stream = transport::connect(socket).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound
                || e.kind() == std::io::ErrorKind::ConnectionRefused
            {
                Error::BrokerNotRunning
            } else {
                Error::BrokerConnectionFailed(e)
            }
        })?;

        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            reader,
            writer,
            next_id: 1,
            broken: false,
        })
    }

    async fn send_command(&mut self, command: Command) -> Result<serde_json::Value> {
        let id = self.next_id;
        self.next_id += 1;

        let request = Request { id, command };
        let json = serde_json::to_vec(&request)?;

        let exchange = self.exchange(&json);
        let response_data =
            match tokio::time::timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS), exchange).await {
                Ok(Ok(data)) => data,
                Ok(Err(e)) => {
                    self.broken = true;
                    return Err(Error::BrokerCommunication(e.to_string()));
                }
                Err(_) => {
                    self.broken = true;
                    return Err(Error::Timeout(REQUEST_TIMEOUT_SECS));
                }
            };

        let response: Response = serde_json::from_slice(&response_data)?;

        if response.id != id {
            self.broken = true;
            return Err(Error::BrokerCommunication(format!(
                "Response ID mismatch: expected {}, got {}",
                id, response.id
            )));
        }

        if response.success {
            Ok(response.result.unwrap_or(serde_json::json!({})))
        } else {
            let error = response.error.unwrap_or_else(|| IpcError {
                code: "UNKNOWN".to_string(),
                message: "Unknown error".to_string(),
                path: None,
            });
            Err(error.into())
        }
    }

    async fn exchange(&mut self, request: &[u8]) -> std::io::Result<Vec<u8>> {
        transport::send_message(&mut self.writer, request).await?;
        transport::recv_message(&mut self.reader).await
    }
}

struct ClientInner {
    socket: PathBuf,
    conn: Mutex<Option<Connection>>,
    subscribe_poll: Duration,
}

/// [`SignalClient`] backed by the broker daemon
///
/// Requests on one client are serialized over a single connection. Clones
/// share that connection.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<ClientInner>,
}

impl BrokerClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self::with_subscribe_poll(socket, DEFAULT_SUBSCRIBE_POLL)
    }

    /// Client whose subscriptions poll the broker every `interval`
    pub fn with_subscribe_poll(socket: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                socket: socket.into(),
                conn: Mutex::new(None),
                subscribe_poll: interval.max(Duration::from_millis(1)),
            }),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.inner.socket
    }

    /// Send a command and wait for the response
    pub async fn send_command(&self, command: Command) -> Result<serde_json::Value> {
        let mut guard = self.inner.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::NotConnected)?;
        let result = conn.send_command(command).await;
        if conn.broken {
            *guard = None;
        }
        result
    }

    pub async fn status(&self) -> Result<StatusInfo> {
        let result = self.send_command(Command::Status).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Ask the broker to exit
    pub async fn shutdown(&self) -> Result<()> {
        self.send_command(Command::Shutdown).await?;
        *self.inner.conn.lock().await = None;
        Ok(())
    }

    /// Whether a broker is answering on `socket`
    pub async fn ping(socket: &Path) -> bool {
        match Connection::open(socket).await {
            Ok(mut conn) => conn.send_command(Command::Status).await.is_ok(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl SignalClient for BrokerClient {
    async fn connect(&self) -> Result<()> {
        let mut guard = self.inner.conn.lock().await;
        if guard.is_none() {
            *guard = Some(Connection::open(&self.inner.socket).await?);
            tracing::debug!("Connected to broker at {}", self.inner.socket.display());
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.inner.conn.lock().await = None;
        Ok(())
    }

    async fn get(&self, path: &str, mode: Option<ActuatorMode>) -> Result<SignalValue> {
        let result = self
            .send_command(Command::Get {
                path: path.to_string(),
                mode,
            })
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn get_many(
        &self,
        paths: &[String],
        mode: Option<ActuatorMode>,
    ) -> Result<Vec<SignalValue>> {
        let result = self
            .send_command(Command::GetMany {
                paths: paths.to_vec(),
                mode,
            })
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn set(&self, path: &str, value: Value, mode: Option<ActuatorMode>) -> Result<()> {
        self.send_command(Command::Set {
            path: path.to_string(),
            value,
            mode,
        })
        .await?;
        Ok(())
    }

    async fn set_many(&self, writes: &[SignalWrite]) -> Result<()> {
        self.send_command(Command::SetMany {
            writes: writes.to_vec(),
        })
        .await?;
        Ok(())
    }

    /// Poll-based subscription
    ///
    /// Values present when subscribing are the baseline and are not yielded.
    /// A later write shows up as a new timestamp even when the value repeats.
    /// The stream ends when the connection to the broker is lost.
    async fn subscribe(
        &self,
        paths: &[String],
        mode: Option<ActuatorMode>,
    ) -> Result<SignalStream> {
        let mut seen: HashMap<String, SignalValue> = HashMap::new();
        for path in paths {
            match self.get(path, mode).await {
                Ok(value) => {
                    seen.insert(path.clone(), value);
                }
                Err(Error::NoValue(_)) | Err(Error::SignalNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let state = PollState {
            client: self.clone(),
            paths: paths.to_vec(),
            mode,
            seen,
            pending: Vec::new(),
        };

        let stream = futures_util::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(update) = state.pending.pop() {
                    return Some((update, state));
                }
                tokio::time::sleep(state.client.inner.subscribe_poll).await;
                if !state.poll().await {
                    return None;
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

struct PollState {
    client: BrokerClient,
    paths: Vec<String>,
    mode: Option<ActuatorMode>,
    seen: HashMap<String, SignalValue>,
    /// Changes not yet yielded, in reverse order
    pending: Vec<SignalValue>,
}

impl PollState {
    /// Fetch every path once; false once the broker is unreachable
    async fn poll(&mut self) -> bool {
        let mut changes = Vec::new();
        for path in &self.paths {
            match self.client.get(path, self.mode).await {
                Ok(value) => {
                    let changed = self.seen.get(path).is_none_or(|prev| {
                        prev.value != value.value || prev.timestamp != value.timestamp
                    });
                    if changed {
                        self.seen.insert(path.clone(), value.clone());
                        changes.push(value);
                    }
                }
                Err(Error::NoValue(_)) | Err(Error::SignalNotFound(_)) => {}
                Err(e) => {
                    tracing::warn!("Signal subscription ended: {}", e);
                    return false;
                }
            }
        }
        changes.reverse();
        self.pending = changes;
        true
    }
}
