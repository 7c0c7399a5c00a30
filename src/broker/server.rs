//! Broker server - socket listener and main event loop

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use interprocess::local_socket::traits::tokio::Listener as ListenerTrait;
use tokio::io::BufReader;
use tokio::sync::Notify;

use crate::common::{config::Config, error::IpcError, paths, Result};
use crate::signal::{MemoryBroker, SignalClient};

use super::handler;
use super::protocol::{Command, Request, Response};
use super::transport::{self, Listener, Stream};

/// Clients silent for this long are dropped
const CLIENT_TIMEOUT: Duration = Duration::from_secs(300);

/// State shared between the accept loop and client tasks
pub struct Shared {
    pub broker: MemoryBroker,
    pub started: Instant,
    clients: AtomicUsize,
    last_activity: Mutex<Instant>,
    shutdown: Notify,
}

impl Shared {
    fn new(broker: MemoryBroker) -> Self {
        let now = Instant::now();
        Self {
            broker,
            started: now,
            clients: AtomicUsize::new(0),
            last_activity: Mutex::new(now),
            shutdown: Notify::new(),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }
}

/// Signal broker daemon
pub struct BrokerServer {
    shared: Arc<Shared>,
    socket: PathBuf,
    /// `None` disables the idle shutdown
    idle_timeout: Option<Duration>,
}

impl BrokerServer {
    pub fn new(socket: PathBuf, config: &Config) -> Self {
        let idle_timeout = match config.broker.idle_timeout_minutes {
            0 => None,
            minutes => Some(Duration::from_secs(minutes * 60)),
        };
        Self::with_broker(socket, MemoryBroker::new(), idle_timeout)
    }

    pub fn with_broker(
        socket: PathBuf,
        broker: MemoryBroker,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(broker)),
            socket,
            idle_timeout,
        }
    }

    /// Serve until a shutdown request, a termination signal or the idle timeout
    pub async fn run(self) -> Result<()> {
        let listener = transport::create_listener(&self.socket).await?;
        self.shared.broker.connect().await?;
        tracing::info!("Signal broker listening on {}", self.socket.display());

        let mut signals = Signals::new()?;

        loop {
            if let Some(idle) = self.idle_timeout {
                if self.shared.client_count() == 0 && self.shared.idle_for() > idle {
                    tracing::info!("Idle timeout reached, shutting down broker");
                    break;
                }
            }

            if self.run_select_loop(&listener, &mut signals).await {
                break;
            }
        }

        tracing::info!("Cleaning up broker resources");
        drop(listener);
        paths::remove_socket(&self.socket)?;
        tracing::info!("Broker shutdown complete");

        Ok(())
    }

    /// Run one iteration of the select loop, returns true if should break
    async fn run_select_loop(&self, listener: &Listener, signals: &mut Signals) -> bool {
        tokio::select! {
            name = signals.recv() => {
                tracing::info!("Received {}, shutting down gracefully", name);
                true
            }
            _ = self.shared.shutdown.notified() => {
                tracing::info!("Shutdown requested, exiting");
                true
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok(stream) => {
                        self.shared.touch();
                        self.shared.clients.fetch_add(1, Ordering::SeqCst);
                        let shared = Arc::clone(&self.shared);
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(&shared, stream).await {
                                tracing::error!("Error handling client: {}", e);
                            }
                            shared.clients.fetch_sub(1, Ordering::SeqCst);
                            shared.touch();
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
                false
            }
            // Periodic wakeup to check idle timeout
            _ = tokio::time::sleep(Duration::from_secs(1)) => false,
        }
    }
}

/// Handle a single client connection until it disconnects
async fn handle_client(shared: &Shared, stream: Stream) -> Result<()> {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    loop {
        let request_data = tokio::select! {
            result = transport::recv_message(&mut reader) => {
                match result {
                    Ok(data) => data,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        tracing::debug!("Client disconnected");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Error reading request: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(CLIENT_TIMEOUT) => {
                tracing::debug!("Client timeout");
                break;
            }
        };

        let request: Request = match serde_json::from_slice(&request_data) {
            Ok(req) => req,
            Err(e) => {
                tracing::error!("Invalid request: {}", e);
                let response = Response::error(
                    0,
                    IpcError {
                        code: "INVALID_REQUEST".to_string(),
                        message: e.to_string(),
                        path: None,
                    },
                );
                let json = serde_json::to_vec(&response)?;
                transport::send_message(&mut writer, &json).await?;
                continue;
            }
        };

        tracing::debug!("Received command: {:?}", request.command);

        if matches!(request.command, Command::Shutdown) {
            let json = serde_json::to_vec(&Response::ok(request.id))?;
            transport::send_message(&mut writer, &json).await?;
            shared.shutdown.notify_one();
            break;
        }

        let response = handler::handle_command(shared, request.id, request.command).await;
        let json = serde_json::to_vec(&response)?;
        transport::send_message(&mut writer, &json).await?;

        shared.touch();
    }

    Ok(())
}

/// Termination signals the broker reacts to
#[cfg(unix)]
struct Signals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Signals)
    }

    async fn recv(&mut self) -> &'static str {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        "Ctrl+C"
    }
}
