//! Suite fixtures
//!
//! Fixtures are background helpers that stand in for parts of the vehicle
//! while a suite runs. They are started before suite setup and stopped after
//! suite teardown.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::common::Result;
use crate::signal::{ActuatorMode, SignalClient, SignalStream};

use super::model::{FixtureDef, FixtureKind};

/// A started fixture
pub struct RunningFixture {
    name: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<u64>,
}

impl RunningFixture {
    /// Subscribe and spawn the fixture task
    ///
    /// Fails when the subscription cannot be set up, so a broken fixture is
    /// reported before any case runs.
    pub async fn start(def: &FixtureDef, client: Arc<dyn SignalClient>) -> Result<Self> {
        let (stop, stopped) = watch::channel(false);

        let task = match &def.kind {
            FixtureKind::ActuatorMirror {
                target_signal,
                actual_signal,
                delay,
            } => {
                let updates = client
                    .subscribe(std::slice::from_ref(target_signal), Some(ActuatorMode::Target))
                    .await?;
                tracing::info!(
                    "Fixture '{}' mirroring {} -> {} after {:?}",
                    def.name,
                    target_signal,
                    actual_signal,
                    delay
                );
                tokio::spawn(mirror(
                    client,
                    updates,
                    actual_signal.clone(),
                    *delay,
                    stopped,
                ))
            }
        };

        Ok(Self {
            name: def.name.clone(),
            stop,
            task,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the fixture, returning how many values it mirrored
    pub async fn stop(self, join_timeout: Duration) -> u64 {
        let _ = self.stop.send(true);
        let abort = self.task.abort_handle();
        match tokio::time::timeout(join_timeout, self.task).await {
            Ok(Ok(mirrored)) => {
                tracing::debug!("Fixture '{}' stopped after {} update(s)", self.name, mirrored);
                mirrored
            }
            Ok(Err(e)) => {
                tracing::warn!("Fixture '{}' task failed: {}", self.name, e);
                0
            }
            Err(_) => {
                tracing::warn!("Fixture '{}' did not stop in time, aborting", self.name);
                abort.abort();
                0
            }
        }
    }
}

/// Start every fixture of a suite, stopping the ones already started on failure
pub async fn start_all(
    defs: &[FixtureDef],
    client: &Arc<dyn SignalClient>,
    join_timeout: Duration,
) -> Result<Vec<RunningFixture>> {
    let mut running = Vec::with_capacity(defs.len());
    for def in defs {
        match RunningFixture::start(def, client.clone()).await {
            Ok(fixture) => running.push(fixture),
            Err(e) => {
                tracing::error!("Failed to start fixture '{}': {}", def.name, e);
                stop_all(running, join_timeout).await;
                return Err(e);
            }
        }
    }
    Ok(running)
}

pub async fn stop_all(fixtures: Vec<RunningFixture>, join_timeout: Duration) {
    for fixture in fixtures {
        fixture.stop(join_timeout).await;
    }
}

async fn mirror(
    client: Arc<dyn SignalClient>,
    mut updates: SignalStream,
    actual_signal: String,
    delay: Duration,
    mut stopped: watch::Receiver<bool>,
) -> u64 {
    let mut mirrored = 0;

    loop {
        let update = tokio::select! {
            _ = stopped.changed() => break,
            update = updates.next() => match update {
                Some(update) => update,
                None => break,
            },
        };

        tokio::select! {
            _ = stopped.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        tracing::debug!("Mirroring {} = {} to {}", update.path, update.value, actual_signal);
        match client
            .set(&actual_signal, update.value, Some(ActuatorMode::Actual))
            .await
        {
            Ok(()) => mirrored += 1,
            Err(e) => tracing::warn!("Mirroring to {} failed: {}", actual_signal, e),
        }
    }

    mirrored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Value;
    use crate::signal::MemoryBroker;

    fn mirror_def() -> FixtureDef {
        FixtureDef {
            name: "hvac".to_string(),
            kind: FixtureKind::ActuatorMirror {
                target_signal: "Vehicle.Cabin.HVAC.TargetTemperature".to_string(),
                actual_signal: "Vehicle.Cabin.HVAC.TargetTemperature".to_string(),
                delay: Duration::from_millis(20),
            },
        }
    }

    #[tokio::test]
    async fn test_actuator_mirror_copies_target_to_actual() {
        let broker = Arc::new(MemoryBroker::new());
        broker.connect().await.unwrap();
        let client: Arc<dyn SignalClient> = broker.clone();

        let fixture = RunningFixture::start(&mirror_def(), client).await.unwrap();
        broker
            .set(
                "Vehicle.Cabin.HVAC.TargetTemperature",
                Value::Int(22),
                Some(ActuatorMode::Target),
            )
            .await
            .unwrap();

        let mut mirrored = None;
        for _ in 0..100 {
            mirrored = broker.current("Vehicle.Cabin.HVAC.TargetTemperature");
            if mirrored.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mirrored, Some(Value::Int(22)));
        assert_eq!(fixture.stop(Duration::from_secs(1)).await, 1);
    }

    #[tokio::test]
    async fn test_start_fails_when_disconnected() {
        let client: Arc<dyn SignalClient> = Arc::new(MemoryBroker::new());
        let result = start_all(&[mirror_def()], &client, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
