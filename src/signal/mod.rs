//! Vehicle signal access
//!
//! The runner talks to the vehicle through [`SignalClient`]. Actuators have
//! two channels: the commanded *target* value and the observed *current*
//! value. Every read and write names its channel explicitly through
//! `Option<ActuatorMode>`: `Some(Target)` addresses the target channel,
//! `Some(Actual)` and `None` the current-value channel.

mod catalogue;
mod memory;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};
use crate::expr::Value;

pub use catalogue::{
    Requirement, Signal, SignalKind, StateMachineDef, TransitionDef, ValidationError, VehicleSpec,
};
pub use memory::MemoryBroker;

/// Which channel of an actuator a read or write addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorMode {
    /// Commanded value
    Target,
    /// Observed value
    Actual,
}

impl ActuatorMode {
    /// Whether this mode addresses the target channel
    pub fn is_target(mode: Option<ActuatorMode>) -> bool {
        mode == Some(ActuatorMode::Target)
    }
}

impl fmt::Display for ActuatorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuatorMode::Target => f.write_str("target"),
            ActuatorMode::Actual => f.write_str("actual"),
        }
    }
}

impl FromStr for ActuatorMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "target" => Ok(ActuatorMode::Target),
            "actual" | "current" | "value" => Ok(ActuatorMode::Actual),
            other => Err(Error::InvalidStep(format!(
                "unknown actuator mode '{other}', expected 'target' or 'actual'"
            ))),
        }
    }
}

/// A signal value read from (or published by) the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalValue {
    pub path: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ActuatorMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Local>>,
}

/// One value to write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalWrite {
    pub path: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ActuatorMode>,
}

impl SignalWrite {
    pub fn new(
        path: impl Into<String>,
        value: impl Into<Value>,
        mode: Option<ActuatorMode>,
    ) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
            mode,
        }
    }
}

impl fmt::Display for SignalWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            Some(mode) => write!(f, "{} = {} [{}]", self.path, self.value, mode),
            None => write!(f, "{} = {}", self.path, self.value),
        }
    }
}

/// Stream of value changes produced by [`SignalClient::subscribe`]
pub type SignalStream = BoxStream<'static, SignalValue>;

/// Access to vehicle signals
///
/// Reads and writes fail with [`Error::NotConnected`] before `connect` and
/// with [`Error::SignalNotFound`] for unknown paths.
#[async_trait]
pub trait SignalClient: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn get(&self, path: &str, mode: Option<ActuatorMode>) -> Result<SignalValue>;

    async fn get_many(
        &self,
        paths: &[String],
        mode: Option<ActuatorMode>,
    ) -> Result<Vec<SignalValue>> {
        let mut values = Vec::with_capacity(paths.len());
        for path in paths {
            values.push(self.get(path, mode).await?);
        }
        Ok(values)
    }

    async fn set(&self, path: &str, value: Value, mode: Option<ActuatorMode>) -> Result<()> {
        self.set_many(&[SignalWrite {
            path: path.to_string(),
            value,
            mode,
        }])
        .await
    }

    /// Apply several writes; target and current writes may be mixed
    async fn set_many(&self, writes: &[SignalWrite]) -> Result<()>;

    /// Stream of changes to `paths` on the addressed channel
    async fn subscribe(&self, paths: &[String], mode: Option<ActuatorMode>) -> Result<SignalStream>;
}
