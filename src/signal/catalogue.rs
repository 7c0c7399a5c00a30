//! Vehicle function spec: declared signals, requirements and state machines
//!
//! ```yaml
//! version: "1.0"
//! signals:
//!   - path: Vehicle.Cabin.HVAC.TargetTemperature
//!     type: actuator
//!     datatype: float
//!     min: 16
//!     max: 30
//!     mode: [target, actual]
//! requirements:
//!   - id: REQ-001
//!     text: WHEN the cabin is too warm THEN cooling starts
//!     type: event_driven
//! state_machines:
//!   - name: ClimateControl
//!     states: [OFF, IDLE, COOLING]
//!     transitions:
//!       - { from: OFF, to: IDLE, trigger: power_on }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use super::ActuatorMode;
use crate::common::{Error, Result};
use crate::expr::Value;

/// A value rejected by its signal declaration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid value for signal '{path}': {reason}")]
pub struct ValidationError {
    pub path: String,
    pub reason: String,
}

/// Role of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    #[serde(alias = "signal")]
    Sensor,
    Actuator,
    Attribute,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(v)) => vec![v],
        Some(OneOrMany::Many(v)) => v,
    })
}

/// Declared vehicle signal
#[derive(Debug, Clone, Deserialize)]
pub struct Signal {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// `bool`, `float`, `double`, `int8`..`uint64`, `string`, `enum`; `[]` suffix for arrays
    pub datatype: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default, alias = "mode", deserialize_with = "one_or_many")]
    pub modes: Vec<ActuatorMode>,
    #[serde(default)]
    pub enum_values: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Signal {
    pub fn is_actuator(&self) -> bool {
        self.kind == SignalKind::Actuator
    }

    /// Check `value` against the declared type, range and allowed values
    pub fn validate(&self, value: &Value) -> std::result::Result<(), ValidationError> {
        let fail = |reason: String| ValidationError {
            path: self.path.clone(),
            reason,
        };

        let datatype = self.datatype.trim().to_ascii_lowercase();
        if let Some(element_type) = datatype.strip_suffix("[]") {
            let Value::List(items) = value else {
                return Err(fail(format!(
                    "expected {}, got {}",
                    self.datatype,
                    value.type_name()
                )));
            };
            for item in items {
                self.validate_scalar(element_type, item).map_err(fail)?;
            }
            return Ok(());
        }

        self.validate_scalar(&datatype, value).map_err(fail)
    }

    fn validate_scalar(&self, datatype: &str, value: &Value) -> std::result::Result<(), String> {
        let mismatch = || format!("expected {}, got {} {}", datatype, value.type_name(), value);

        match datatype {
            "bool" | "boolean" => {
                if !matches!(value, Value::Bool(_)) {
                    return Err(mismatch());
                }
            }
            "float" | "double" => {
                if !matches!(value, Value::Int(_) | Value::Float(_)) {
                    return Err(mismatch());
                }
            }
            "string" | "enum" => {
                if !matches!(value, Value::Str(_)) {
                    return Err(mismatch());
                }
            }
            t if t.starts_with("int") || t.starts_with("uint") => {
                let Value::Int(i) = value else {
                    return Err(mismatch());
                };
                if let Some((lo, hi)) = integer_bounds(t) {
                    if i128::from(*i) < lo || i128::from(*i) > hi {
                        return Err(format!("value {i} out of range for {t}"));
                    }
                }
            }
            _ => {}
        }

        if let Some(x) = value.as_f64().filter(|_| !matches!(value, Value::Bool(_))) {
            if let Some(min) = self.min {
                if x < min {
                    return Err(format!("value {value} below minimum {min}"));
                }
            }
            if let Some(max) = self.max {
                if x > max {
                    return Err(format!("value {value} above maximum {max}"));
                }
            }
        }

        if !self.enum_values.is_empty()
            && !self.enum_values.iter().any(|e| Value::Str(e.clone()) == *value)
        {
            return Err(format!(
                "value {value} not one of [{}]",
                self.enum_values.join(", ")
            ));
        }

        Ok(())
    }
}

fn integer_bounds(datatype: &str) -> Option<(i128, i128)> {
    let (unsigned, bits) = match datatype.strip_prefix("uint") {
        Some(bits) => (true, bits),
        None => (false, datatype.strip_prefix("int")?),
    };
    if bits.is_empty() {
        return Some(if unsigned { (0, i128::MAX) } else { (i128::MIN, i128::MAX) });
    }
    let bits: u32 = bits.parse().ok().filter(|b| matches!(b, 8 | 16 | 32 | 64))?;
    Some(if unsigned {
        (0, (1i128 << bits) - 1)
    } else {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    })
}

/// Requirement text, typically in EARS form
#[derive(Debug, Clone, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub text: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub verification: Option<String>,
}

/// Declared state machine transition
#[derive(Debug, Clone, Deserialize)]
pub struct TransitionDef {
    pub from: String,
    pub to: String,
    pub trigger: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

/// Declared state machine
#[derive(Debug, Clone, Deserialize)]
pub struct StateMachineDef {
    pub name: String,
    pub states: Vec<String>,
    #[serde(default)]
    pub initial_state: Option<String>,
    #[serde(default)]
    pub transitions: Vec<TransitionDef>,
}

impl StateMachineDef {
    /// Declared initial state, else the first state
    pub fn initial(&self) -> Option<&str> {
        self.initial_state
            .as_deref()
            .or_else(|| self.states.first().map(String::as_str))
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }
}

#[derive(Deserialize)]
struct SpecFile {
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    metadata: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    signals: Vec<Signal>,
    #[serde(default)]
    requirements: Vec<Requirement>,
    #[serde(default)]
    state_machines: Vec<StateMachineDef>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Loaded vehicle function spec, indexed for lookup
#[derive(Debug, Clone, Default)]
pub struct VehicleSpec {
    pub version: String,
    pub metadata: BTreeMap<String, serde_yaml::Value>,
    pub signals: BTreeMap<String, Signal>,
    pub requirements: BTreeMap<String, Requirement>,
    pub state_machines: BTreeMap<String, StateMachineDef>,
}

impl VehicleSpec {
    /// Load a spec from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::file_read(path, e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            Error::Yaml(inner) => Error::SpecParse {
                path: path.display().to_string(),
                message: inner.to_string(),
            },
            other => other,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: SpecFile = serde_yaml::from_str(content)?;
        Ok(Self {
            version: file.version,
            metadata: file.metadata,
            signals: file
                .signals
                .into_iter()
                .map(|s| (s.path.clone(), s))
                .collect(),
            requirements: file
                .requirements
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            state_machines: file
                .state_machines
                .into_iter()
                .map(|m| (m.name.clone(), m))
                .collect(),
        })
    }

    pub fn signal(&self, path: &str) -> Option<&Signal> {
        self.signals.get(path)
    }

    pub fn requirement(&self, id: &str) -> Option<&Requirement> {
        self.requirements.get(id)
    }

    pub fn state_machine(&self, name: &str) -> Option<&StateMachineDef> {
        self.state_machines.get(name)
    }

    /// Validate a value for a declared signal; undeclared paths pass
    pub fn validate_value(
        &self,
        path: &str,
        value: &Value,
    ) -> std::result::Result<(), ValidationError> {
        match self.signal(path) {
            Some(signal) => signal.validate(value),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"
version: "2.0"
signals:
  - path: Vehicle.Cabin.HVAC.TargetTemperature
    type: actuator
    datatype: float
    min: 16
    max: 30
    mode: [target, actual]
  - path: Vehicle.Speed
    type: signal
    datatype: uint16
  - path: Vehicle.Cabin.HVAC.Mode
    type: actuator
    datatype: string
    mode: target
    enum_values: [OFF, AUTO, COOL]
  - path: Vehicle.Cabin.Door.IsOpen
    type: sensor
    datatype: bool
requirements:
  - id: REQ-001
    text: WHEN cabin is warm THEN cooling starts
    type: event_driven
    tags: [hvac]
state_machines:
  - name: ClimateControl
    states: [OFF, IDLE, COOLING]
    transitions:
      - { from: OFF, to: IDLE, trigger: power_on }
"#;

    fn spec() -> VehicleSpec {
        VehicleSpec::from_yaml(SPEC).unwrap()
    }

    #[test]
    fn test_load_indexes_everything() {
        let spec = spec();
        assert_eq!(spec.version, "2.0");
        assert_eq!(spec.signals.len(), 4);
        let hvac = spec.signal("Vehicle.Cabin.HVAC.TargetTemperature").unwrap();
        assert!(hvac.is_actuator());
        assert_eq!(hvac.modes, vec![ActuatorMode::Target, ActuatorMode::Actual]);
        assert_eq!(
            spec.signal("Vehicle.Cabin.HVAC.Mode").unwrap().modes,
            vec![ActuatorMode::Target]
        );
        assert_eq!(spec.signal("Vehicle.Speed").unwrap().kind, SignalKind::Sensor);
        assert!(spec.requirement("REQ-001").is_some());

        let machine = spec.state_machine("ClimateControl").unwrap();
        assert_eq!(machine.initial(), Some("OFF"));
        assert!(machine.has_state("COOLING"));
    }

    #[test]
    fn test_validate_type_range_enum() {
        let spec = spec();
        let temp = "Vehicle.Cabin.HVAC.TargetTemperature";

        assert!(spec.validate_value(temp, &Value::Float(22.5)).is_ok());
        assert!(spec.validate_value(temp, &Value::Int(22)).is_ok());
        assert!(spec.validate_value(temp, &Value::Float(35.0)).is_err());
        assert!(spec.validate_value(temp, &Value::from("warm")).is_err());

        assert!(spec.validate_value("Vehicle.Cabin.HVAC.Mode", &Value::from("AUTO")).is_ok());
        let err = spec
            .validate_value("Vehicle.Cabin.HVAC.Mode", &Value::from("HEAT"))
            .unwrap_err();
        assert_eq!(err.path, "Vehicle.Cabin.HVAC.Mode");
        assert!(err.reason.contains("not one of"));

        assert!(spec.validate_value("Vehicle.Cabin.Door.IsOpen", &Value::Bool(true)).is_ok());
        assert!(spec.validate_value("Vehicle.Cabin.Door.IsOpen", &Value::Int(1)).is_err());
    }

    #[test]
    fn test_unsigned_rejects_negative_and_overflow() {
        let spec = spec();
        assert!(spec.validate_value("Vehicle.Speed", &Value::Int(120)).is_ok());
        assert!(spec.validate_value("Vehicle.Speed", &Value::Int(-1)).is_err());
        assert!(spec.validate_value("Vehicle.Speed", &Value::Int(70_000)).is_err());
        assert!(spec.validate_value("Vehicle.Speed", &Value::Float(12.5)).is_err());
    }

    #[test]
    fn test_undeclared_signal_passes() {
        assert!(spec()
            .validate_value("Vehicle.Unknown", &Value::from("anything"))
            .is_ok());
    }

    #[test]
    fn test_array_types() {
        let signal = Signal {
            path: "Vehicle.Trips".into(),
            kind: SignalKind::Attribute,
            datatype: "uint8[]".into(),
            unit: None,
            min: None,
            max: None,
            modes: Vec::new(),
            enum_values: Vec::new(),
            description: None,
        };
        assert!(signal
            .validate(&Value::List(vec![Value::Int(1), Value::Int(2)]))
            .is_ok());
        assert!(signal.validate(&Value::List(vec![Value::Int(300)])).is_err());
        assert!(signal.validate(&Value::Int(1)).is_err());
    }
}
