//! In-process signal broker
//!
//! Holds target and current values in memory and publishes every write on a
//! broadcast channel. Used directly with `--broker memory`, in tests, and as
//! the backing store of the broker daemon.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Local;
use tokio::sync::broadcast;

use super::{ActuatorMode, SignalClient, SignalStream, SignalValue, SignalWrite};
use crate::common::{Error, Result};
use crate::expr::Value;

const UPDATE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct BrokerState {
    connected: bool,
    /// Paths accepted for writes; empty means any path
    declared: BTreeSet<String>,
    current: BTreeMap<String, SignalValue>,
    target: BTreeMap<String, SignalValue>,
}

/// Signal store shared by everyone holding a reference
#[derive(Debug)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    updates: broadcast::Sender<SignalValue>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Broker accepting any path
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(BrokerState::default()),
            updates,
        }
    }

    /// Broker that only knows the given paths
    pub fn with_signals<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let broker = Self::new();
        broker.lock().declared = paths.into_iter().map(Into::into).collect();
        broker
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current and target values, sorted by path
    pub fn snapshot(&self) -> (Vec<SignalValue>, Vec<SignalValue>) {
        let state = self.lock();
        (
            state.current.values().cloned().collect(),
            state.target.values().cloned().collect(),
        )
    }

    /// Current-channel value of `path`, if any
    pub fn current(&self, path: &str) -> Option<Value> {
        self.lock().current.get(path).map(|v| v.value.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn read(&self, path: &str, mode: Option<ActuatorMode>) -> Result<SignalValue> {
        let state = self.lock();
        if !state.connected {
            return Err(Error::NotConnected);
        }

        let channel = if ActuatorMode::is_target(mode) {
            &state.target
        } else {
            &state.current
        };
        if let Some(value) = channel.get(path) {
            return Ok(value.clone());
        }

        let known = state.declared.contains(path)
            || state.current.contains_key(path)
            || state.target.contains_key(path);
        if known {
            Err(Error::NoValue(path.to_string()))
        } else {
            Err(Error::SignalNotFound(path.to_string()))
        }
    }
}

#[async_trait]
impl SignalClient for MemoryBroker {
    async fn connect(&self) -> Result<()> {
        self.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.lock().connected = false;
        Ok(())
    }

    async fn get(&self, path: &str, mode: Option<ActuatorMode>) -> Result<SignalValue> {
        self.read(path, mode)
    }

    /// All writes are checked before any is applied
    async fn set_many(&self, writes: &[SignalWrite]) -> Result<()> {
        let published = {
            let mut state = self.lock();
            if !state.connected {
                return Err(Error::NotConnected);
            }
            if !state.declared.is_empty() {
                if let Some(unknown) = writes.iter().find(|w| !state.declared.contains(&w.path)) {
                    return Err(Error::SignalNotFound(unknown.path.clone()));
                }
            }

            let now = Local::now();
            let mut published = Vec::with_capacity(writes.len());
            for write in writes {
                let value = SignalValue {
                    path: write.path.clone(),
                    value: write.value.clone(),
                    mode: write.mode,
                    timestamp: Some(now),
                };
                let channel = if ActuatorMode::is_target(write.mode) {
                    &mut state.target
                } else {
                    &mut state.current
                };
                channel.insert(write.path.clone(), value.clone());
                published.push(value);
            }
            published
        };

        for value in published {
            tracing::debug!(
                path = %value.path,
                mode = ?value.mode,
                "Signal set to {}",
                value.value
            );
            // No subscribers is fine
            let _ = self.updates.send(value);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        paths: &[String],
        mode: Option<ActuatorMode>,
    ) -> Result<SignalStream> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let paths: BTreeSet<String> = paths.iter().cloned().collect();
        let want_target = ActuatorMode::is_target(mode);
        let rx = self.updates.subscribe();

        let stream = futures_util::stream::unfold(rx, move |mut rx| {
            let paths = paths.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(update) => {
                            if ActuatorMode::is_target(update.mode) == want_target
                                && paths.contains(&update.path)
                            {
                                return Some((update, rx));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("Signal subscriber lagged, {} updates dropped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_requires_connect() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.get("Vehicle.Speed", None).await,
            Err(Error::NotConnected)
        ));
        broker.connect().await.unwrap();
        assert!(matches!(
            broker.get("Vehicle.Speed", None).await,
            Err(Error::SignalNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_target_and_current_are_separate() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();

        let path = "Vehicle.Cabin.HVAC.TargetTemperature";
        broker
            .set(path, Value::Float(22.0), Some(ActuatorMode::Target))
            .await
            .unwrap();

        let target = broker.get(path, Some(ActuatorMode::Target)).await.unwrap();
        assert_eq!(target.value, Value::Float(22.0));
        assert!(matches!(
            broker.get(path, Some(ActuatorMode::Actual)).await,
            Err(Error::NoValue(_))
        ));

        broker
            .set(path, Value::Float(21.0), Some(ActuatorMode::Actual))
            .await
            .unwrap();
        assert_eq!(broker.get(path, None).await.unwrap().value, Value::Float(21.0));
        assert_eq!(broker.current(path), Some(Value::Float(21.0)));
    }

    #[tokio::test]
    async fn test_declared_paths_reject_unknown_writes_atomically() {
        let broker = MemoryBroker::with_signals(["Vehicle.Speed"]);
        broker.connect().await.unwrap();

        let writes = [
            SignalWrite::new("Vehicle.Speed", 50i64, None),
            SignalWrite::new("Vehicle.Bogus", 1i64, None),
        ];
        assert!(matches!(
            broker.set_many(&writes).await,
            Err(Error::SignalNotFound(p)) if p == "Vehicle.Bogus"
        ));
        assert!(matches!(
            broker.get("Vehicle.Speed", None).await,
            Err(Error::NoValue(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_filters_channel_and_path() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();

        let mut stream = broker
            .subscribe(&["Vehicle.A".to_string()], Some(ActuatorMode::Target))
            .await
            .unwrap();

        broker.set("Vehicle.A", Value::Int(1), None).await.unwrap();
        broker
            .set("Vehicle.B", Value::Int(2), Some(ActuatorMode::Target))
            .await
            .unwrap();
        broker
            .set("Vehicle.A", Value::Int(3), Some(ActuatorMode::Target))
            .await
            .unwrap();

        let update = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.path, "Vehicle.A");
        assert_eq!(update.value, Value::Int(3));
    }
}
