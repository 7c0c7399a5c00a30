//! Signal broker daemon
//!
//! A background process holding vehicle signals in a [`MemoryBroker`] and
//! serving them over a local socket, so that several `sdv-test` invocations
//! (and the fixtures they start) share one signal space. It is spawned on
//! demand by `sdv-test run --broker local` through the hidden `broker`
//! subcommand.
//!
//! [`MemoryBroker`]: crate::signal::MemoryBroker

mod client;
mod handler;
pub mod protocol;
mod server;
pub mod transport;

use std::path::PathBuf;

use crate::common::{config::Config, Result};

pub use client::BrokerClient;
pub use server::BrokerServer;

/// Run in broker mode until shut down
pub async fn run(socket: PathBuf) -> Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "Starting signal broker"
    );

    let config = Config::load()?;
    BrokerServer::new(socket, &config).run().await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::common::Error;
    use crate::expr::Value;
    use crate::signal::{ActuatorMode, MemoryBroker, SignalClient, SignalWrite};
    use futures_util::StreamExt;
    use std::time::Duration;

    async fn start(dir: &tempfile::TempDir) -> (PathBuf, tokio::task::JoinHandle<Result<()>>) {
        let socket = dir.path().join("broker.sock");
        let server = BrokerServer::with_broker(socket.clone(), MemoryBroker::new(), None);
        let handle = tokio::spawn(server.run());

        for _ in 0..100 {
            if BrokerClient::ping(&socket).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        (socket, handle)
    }

    #[tokio::test]
    async fn test_get_set_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, handle) = start(&dir).await;

        let client = BrokerClient::new(&socket);
        assert!(matches!(
            client.get("Vehicle.Speed", None).await,
            Err(Error::NotConnected)
        ));
        client.connect().await.unwrap();

        client
            .set_many(&[
                SignalWrite::new("Vehicle.Speed", 42.5, None),
                SignalWrite::new(
                    "Vehicle.Cabin.HVAC.TargetTemperature",
                    22i64,
                    Some(ActuatorMode::Target),
                ),
            ])
            .await
            .unwrap();

        let speed = client.get("Vehicle.Speed", None).await.unwrap();
        assert_eq!(speed.value, Value::Float(42.5));
        let target = client
            .get("Vehicle.Cabin.HVAC.TargetTemperature", Some(ActuatorMode::Target))
            .await
            .unwrap();
        assert_eq!(target.value, Value::Int(22));

        assert!(matches!(
            client.get("Vehicle.Nope", None).await,
            Err(Error::SignalNotFound(p)) if p == "Vehicle.Nope"
        ));

        let status = client.status().await.unwrap();
        assert_eq!(status.current_signals, 1);
        assert_eq!(status.target_signals, 1);

        client.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_polling_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, handle) = start(&dir).await;

        let writer = BrokerClient::new(&socket);
        writer.connect().await.unwrap();
        writer.set("Vehicle.A", Value::Int(1), None).await.unwrap();

        let reader = BrokerClient::with_subscribe_poll(&socket, Duration::from_millis(10));
        reader.connect().await.unwrap();
        let mut stream = reader.subscribe(&["Vehicle.A".to_string()], None).await.unwrap();

        writer.set("Vehicle.A", Value::Int(2), None).await.unwrap();
        let update = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.value, Value::Int(2));

        writer.shutdown().await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
}
