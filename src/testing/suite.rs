//! Test suite YAML loading
//!
//! Suites are written with a handful of shorthands; everything is normalised
//! into [`TestStep`] payloads here so the runner only ever sees one shape per
//! step kind.
//!
//! ```yaml
//! test_suite:
//!   name: Climate control
//!   system_spec: climate.vff.yaml
//!   metadata: { stop_on_failure: true }
//!   fixtures:
//!     - type: actuator_mirror
//!       target_signal: Vehicle.Cabin.HVAC.TargetTemperature
//!       actual_signal: Vehicle.Cabin.HVAC.TargetTemperature
//!   test_cases:
//!     - name: Cooling starts
//!       steps:
//!         - inject: { Vehicle.Cabin.HVAC.TargetTemperature: 18 }
//!         - expect_state: { machine: ClimateControl, state: COOLING, timeout: 2 }
//!         - expect: { Vehicle.Cabin.Temperature: "< 25" }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_yaml::{Mapping, Value as Yaml};

use crate::common::{Error, Result};
use crate::expr::Value;
use crate::signal::{ActuatorMode, SignalWrite, VehicleSpec};

use super::model::{
    Expectation, FixtureDef, FixtureKind, StepKind, TestCase, TestStep, TestSuite,
    DEFAULT_STEP_TIMEOUT,
};

const STEP_KEYS: [&str; 8] = [
    "inject",
    "expect",
    "expect_state",
    "expect_transition",
    "wait",
    "log",
    "expect_log",
    "run",
];

const DEFAULT_MIRROR_DELAY: Duration = Duration::from_millis(100);

#[derive(Deserialize)]
struct RawSuite {
    #[serde(default = "default_suite_name")]
    name: String,
    #[serde(default)]
    system_spec: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, Yaml>,
    #[serde(default)]
    fixtures: Vec<Mapping>,
    #[serde(default)]
    setup: Vec<Yaml>,
    #[serde(default)]
    test_cases: Vec<RawCase>,
    #[serde(default)]
    teardown: Vec<Yaml>,
}

fn default_suite_name() -> String {
    "Test Suite".to_string()
}

#[derive(Deserialize)]
struct RawCase {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    requirements: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    setup: Vec<Yaml>,
    #[serde(default)]
    steps: Vec<Yaml>,
    #[serde(default)]
    teardown: Vec<Yaml>,
}

impl TestSuite {
    /// Load a suite file; `system_spec` is resolved relative to it
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_timeout(path, DEFAULT_STEP_TIMEOUT)
    }

    /// Like [`load`](Self::load), with the timeout of steps that set none
    pub fn load_with_timeout(path: &Path, default_timeout: Duration) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::file_read(path, e))?;
        let mut suite = Self::parse(&content, default_timeout).map_err(|e| match e {
            Error::Yaml(inner) => Error::suite_parse(&path.display().to_string(), inner),
            Error::InvalidStep(message) => Error::suite_parse(&path.display().to_string(), message),
            other => other,
        })?;

        if let Some(spec) = &suite.system_spec {
            if spec.is_relative() {
                let base = path.parent().unwrap_or(Path::new("."));
                suite.system_spec = Some(base.join(spec));
            }
        }
        Ok(suite)
    }

    /// Parse a suite document; the `test_suite:` wrapper is optional
    pub fn from_yaml(content: &str) -> Result<Self> {
        Self::parse(content, DEFAULT_STEP_TIMEOUT)
    }

    fn parse(content: &str, default_timeout: Duration) -> Result<Self> {
        let mut document: Yaml = serde_yaml::from_str(content)?;
        if let Some(inner) = document.get("test_suite").cloned() {
            document = inner;
        }
        let raw: RawSuite = serde_yaml::from_value(document)?;

        let stop_on_failure = raw
            .metadata
            .get("stop_on_failure")
            .and_then(Yaml::as_bool)
            .unwrap_or(false);
        let metadata = raw
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), yaml_to_text(v)))
            .collect();

        let mut fixtures = Vec::new();
        for (index, fixture) in raw.fixtures.iter().enumerate() {
            if let Some(fixture) = parse_fixture(fixture, index)? {
                fixtures.push(fixture);
            }
        }

        let mut test_cases = Vec::with_capacity(raw.test_cases.len());
        for case in raw.test_cases {
            let owner = format!("test case '{}'", case.name);
            let context = |e: Error| prefix_error(&owner, e);
            test_cases.push(TestCase {
                setup: parse_steps(&case.setup, default_timeout).map_err(context)?,
                steps: parse_steps(&case.steps, default_timeout).map_err(context)?,
                teardown: parse_steps(&case.teardown, default_timeout).map_err(context)?,
                name: case.name,
                description: case.description,
                requirements: case.requirements,
                tags: case.tags,
            });
        }

        Ok(TestSuite {
            name: raw.name,
            system_spec: raw.system_spec.map(Into::into),
            stop_on_failure,
            metadata,
            fixtures,
            setup: parse_steps(&raw.setup, default_timeout)
                .map_err(|e| prefix_error("suite setup", e))?,
            test_cases,
            teardown: parse_steps(&raw.teardown, default_timeout)
                .map_err(|e| prefix_error("suite teardown", e))?,
        })
    }

    /// Problems that do not stop a run: references to machines, states or
    /// signals the vehicle spec does not declare, and injected values it
    /// rejects
    pub fn lint(&self, spec: &VehicleSpec) -> Vec<String> {
        let mut warnings = Vec::new();
        for step in self.setup.iter().chain(&self.teardown) {
            lint_step(spec, "suite", &step.kind, &mut warnings);
        }
        for case in &self.test_cases {
            for step in case.setup.iter().chain(&case.steps).chain(&case.teardown) {
                lint_step(spec, &case.name, &step.kind, &mut warnings);
            }
        }
        warnings
    }
}

fn lint_step(spec: &VehicleSpec, owner: &str, kind: &StepKind, warnings: &mut Vec<String>) {
    let check_state = |machine: &str, state: &str| match spec.state_machine(machine) {
        None => Some(format!("{owner}: state machine '{machine}' is not declared")),
        Some(def) if !def.has_state(state) => {
            Some(format!("{owner}: state '{state}' is not declared for '{machine}'"))
        }
        Some(_) => None,
    };

    match kind {
        StepKind::ExpectState { machine, state } => warnings.extend(check_state(machine, state)),
        StepKind::ExpectTransition {
            machine, from, to, ..
        } => {
            warnings.extend(check_state(machine, from));
            warnings.extend(check_state(machine, to));
        }
        StepKind::Inject { signals } => {
            for write in signals {
                if spec.signal(&write.path).is_none() {
                    warnings.push(format!("{owner}: signal '{}' is not declared", write.path));
                } else if let Err(e) = spec.validate_value(&write.path, &write.value) {
                    warnings.push(format!("{owner}: {e}"));
                }
            }
        }
        StepKind::Expect { expectations } => {
            for e in expectations {
                if spec.signal(&e.path).is_none() {
                    warnings.push(format!("{owner}: signal '{}' is not declared", e.path));
                }
            }
        }
        _ => {}
    }
}

fn prefix_error(context: &str, e: Error) -> Error {
    match e {
        Error::InvalidStep(message) => Error::InvalidStep(format!("{context}: {message}")),
        other => other,
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidStep(message.into())
}

fn parse_fixture(data: &Mapping, index: usize) -> Result<Option<FixtureDef>> {
    let kind = data
        .get("type")
        .and_then(Yaml::as_str)
        .unwrap_or("actuator_mirror");
    let name = data
        .get("name")
        .and_then(Yaml::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Fixture {index}"));

    match kind {
        "actuator_mirror" => {
            let field = |key: &str| {
                data.get(key)
                    .and_then(Yaml::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| invalid(format!("fixture '{name}' needs '{key}'")))
            };
            let delay = match data.get("delay") {
                Some(delay) => parse_duration(delay)?,
                None => DEFAULT_MIRROR_DELAY,
            };
            let fixture = FixtureDef {
                kind: FixtureKind::ActuatorMirror {
                    target_signal: field("target_signal")?,
                    actual_signal: field("actual_signal")?,
                    delay,
                },
                name,
            };
            tracing::debug!("Parsed fixture: {} (actuator_mirror)", fixture.name);
            Ok(Some(fixture))
        }
        other => {
            tracing::warn!("Unknown fixture type: {}, skipping", other);
            Ok(None)
        }
    }
}

/// Flatten a step list, expanding `{description, actions}` groups
fn parse_steps(items: &[Yaml], default_timeout: Duration) -> Result<Vec<TestStep>> {
    let mut steps = Vec::with_capacity(items.len());
    for item in items {
        let map = item
            .as_mapping()
            .ok_or_else(|| invalid(format!("step must be a mapping, got {}", yaml_to_text(item))))?;

        match map.get("actions") {
            Some(actions) => {
                let group_description = map.get("description").and_then(Yaml::as_str);
                let actions = actions
                    .as_sequence()
                    .ok_or_else(|| invalid("'actions' must be a list"))?;
                for action in parse_steps(actions, default_timeout)? {
                    steps.push(match (&action.description, group_description) {
                        (None, Some(d)) => action.with_description(d),
                        _ => action,
                    });
                }
            }
            None => steps.push(parse_step(map, default_timeout)?),
        }
    }
    Ok(steps)
}

fn parse_step(map: &Mapping, default_timeout: Duration) -> Result<TestStep> {
    let Some((key, data)) = STEP_KEYS
        .iter()
        .find_map(|k| map.get(*k).map(|data| (*k, data)))
    else {
        let keys: Vec<String> = map.keys().map(yaml_to_text).collect();
        return Err(invalid(format!(
            "unknown step type with keys [{}]",
            keys.join(", ")
        )));
    };

    let mut timeout = match map.get("timeout") {
        Some(t) => parse_duration(t)?,
        None => default_timeout,
    };
    let description = map.get("description").and_then(Yaml::as_str).map(str::to_string);

    // Step-level timeouts nested in the payload win
    if let Some(nested) = data.as_mapping().and_then(|m| m.get("timeout")) {
        if matches!(key, "expect_state" | "expect_transition" | "expect_log") {
            timeout = parse_duration(nested)?;
        }
    }

    let kind = match key {
        "inject" => StepKind::Inject {
            signals: parse_inject(data)?,
        },
        "expect" => StepKind::Expect {
            expectations: parse_expect(data)?,
        },
        "expect_state" => StepKind::ExpectState {
            machine: required_str(data, "expect_state", "machine")?,
            state: required_str(data, "expect_state", "state")?,
        },
        "expect_transition" => StepKind::ExpectTransition {
            machine: required_str(data, "expect_transition", "machine")?,
            from: required_str(data, "expect_transition", "from")?,
            to: required_str(data, "expect_transition", "to")?,
            trigger: data.get("trigger").map(yaml_to_text),
        },
        "wait" => StepKind::Wait {
            duration: parse_duration(data)?,
        },
        "log" => StepKind::Log {
            message: yaml_to_text(data),
        },
        "expect_log" => parse_expect_log(data)?,
        "run" => StepKind::Run {
            command: data
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| invalid("'run' needs a command string"))?,
        },
        other => return Err(invalid(format!("unknown step type '{other}'"))),
    };

    Ok(TestStep {
        kind,
        timeout,
        description,
    })
}

/// Single form `{path, value, actuator_mode}` or a map of path to value,
/// where a value may itself be `{value, mode}`
fn parse_inject(data: &Yaml) -> Result<Vec<SignalWrite>> {
    let map = data
        .as_mapping()
        .ok_or_else(|| invalid("'inject' must be a mapping"))?;

    if let (Some(path), Some(value)) = (map.get("path"), map.get("value")) {
        let path = path
            .as_str()
            .ok_or_else(|| invalid("inject 'path' must be a string"))?;
        let mode = match map.get("actuator_mode").or_else(|| map.get("mode")) {
            Some(mode) => Some(parse_mode(mode)?),
            None => None,
        };
        return Ok(vec![SignalWrite::new(path, to_value(value)?, mode)]);
    }

    let mut writes = Vec::with_capacity(map.len());
    for (path, entry) in map {
        let path = yaml_to_text(path);
        let write = match entry.as_mapping().and_then(|m| m.get("value").map(|v| (m, v))) {
            Some((m, value)) => {
                let mode = match m.get("mode").or_else(|| m.get("actuator_mode")) {
                    Some(mode) => parse_mode(mode)?,
                    None => ActuatorMode::Target,
                };
                SignalWrite::new(path, to_value(value)?, Some(mode))
            }
            None => SignalWrite::new(path, to_value(entry)?, None),
        };
        writes.push(write);
    }
    if writes.is_empty() {
        return Err(invalid("'inject' names no signals"));
    }
    Ok(writes)
}

fn parse_expect(data: &Yaml) -> Result<Vec<Expectation>> {
    let map = data
        .as_mapping()
        .ok_or_else(|| invalid("'expect' must be a mapping of signal to expected value"))?;

    let mut expectations = Vec::with_capacity(map.len());
    for (path, entry) in map {
        let path = yaml_to_text(path);
        let expectation = match entry.as_mapping().and_then(|m| m.get("value").map(|v| (m, v))) {
            Some((m, value)) => {
                let mode = match m.get("mode") {
                    Some(mode) => parse_mode(mode)?,
                    None => ActuatorMode::Actual,
                };
                Expectation {
                    path,
                    expected: to_value(value)?,
                    mode: Some(mode),
                }
            }
            None => Expectation {
                path,
                expected: to_value(entry)?,
                mode: None,
            },
        };
        expectations.push(expectation);
    }
    if expectations.is_empty() {
        return Err(invalid("'expect' names no signals"));
    }
    Ok(expectations)
}

fn parse_expect_log(data: &Yaml) -> Result<StepKind> {
    if let Some(pattern) = data.as_str() {
        return Ok(StepKind::ExpectLog {
            pattern: pattern.to_string(),
            container: None,
        });
    }
    let pattern = data
        .get("pattern")
        .or_else(|| data.get("contains"))
        .and_then(Yaml::as_str)
        .ok_or_else(|| invalid("'expect_log' needs 'pattern' or 'contains'"))?;
    Ok(StepKind::ExpectLog {
        pattern: pattern.to_string(),
        container: data.get("container").and_then(Yaml::as_str).map(str::to_string),
    })
}

fn required_str(data: &Yaml, step: &str, key: &str) -> Result<String> {
    data.get(key)
        .filter(|v| !v.is_null())
        .map(yaml_to_text)
        .ok_or_else(|| invalid(format!("'{step}' needs '{key}'")))
}

fn parse_mode(mode: &Yaml) -> Result<ActuatorMode> {
    yaml_to_text(mode).parse()
}

/// Seconds as a number, or a string with an `s` or `ms` suffix
fn parse_duration(value: &Yaml) -> Result<Duration> {
    let secs = match value {
        Yaml::Number(n) => n.as_f64(),
        Yaml::String(s) => {
            let s = s.trim();
            match s.strip_suffix("ms") {
                Some(ms) => ms.trim().parse::<f64>().ok().map(|ms| ms / 1000.0),
                None => s.trim_end_matches('s').trim().parse::<f64>().ok(),
            }
        }
        _ => None,
    };
    secs.and_then(|s| Duration::try_from_secs_f64(s).ok())
        .ok_or_else(|| invalid(format!("invalid duration '{}'", yaml_to_text(value))))
}

fn to_value(value: &Yaml) -> Result<Value> {
    serde_yaml::from_value(value.clone())
        .map_err(|e| invalid(format!("unsupported value '{}': {}", yaml_to_text(value), e)))
}

/// Scalar as plain text, anything else as inline YAML
fn yaml_to_text(value: &Yaml) -> String {
    match value {
        Yaml::String(s) => s.clone(),
        Yaml::Bool(b) => b.to_string(),
        Yaml::Number(n) => n.to_string(),
        Yaml::Null => "null".to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUITE: &str = r#"
test_suite:
  name: Climate control
  system_spec: climate.yaml
  metadata:
    stop_on_failure: true
    owner: hvac-team
  fixtures:
    - name: HVAC mirror
      type: actuator_mirror
      target_signal: Vehicle.Cabin.HVAC.TargetTemperature
      actual_signal: Vehicle.Cabin.HVAC.TargetTemperature
      delay: 0.2
    - type: sensor_generator
      signal: Vehicle.Speed
  setup:
    - description: Power on
      actions:
        - inject: { Vehicle.Cabin.HVAC.IsOn: true }
        - wait: 500ms
  test_cases:
    - name: Cooling cycle
      requirements: [REQ-HVAC-001]
      tags: [smoke]
      steps:
        - inject:
            path: Vehicle.Cabin.HVAC.TargetTemperature
            value: 18
            actuator_mode: target
        - expect_state: { machine: ClimateControl, state: COOLING, timeout: 2 }
        - expect_transition: { machine: ClimateControl, from: IDLE, to: COOLING }
        - expect:
            Vehicle.Cabin.Temperature: "< 25"
            Vehicle.Cabin.HVAC.TargetTemperature: { value: 18, mode: target }
          timeout: 3
        - expect_log: "cooling started"
        - expect_log: { contains: compressor, container: hvac, timeout: 1 }
        - log: done
        - run: "true"
        - wait: 2s
"#;

    #[test]
    fn test_parse_full_suite() {
        let suite = TestSuite::from_yaml(SUITE).unwrap();
        assert_eq!(suite.name, "Climate control");
        assert!(suite.stop_on_failure);
        assert_eq!(suite.metadata["owner"], "hvac-team");
        assert_eq!(suite.system_spec.as_deref(), Some(Path::new("climate.yaml")));

        // Unknown fixture types are dropped
        assert_eq!(suite.fixtures.len(), 1);
        assert_eq!(
            suite.fixtures[0].kind,
            FixtureKind::ActuatorMirror {
                target_signal: "Vehicle.Cabin.HVAC.TargetTemperature".to_string(),
                actual_signal: "Vehicle.Cabin.HVAC.TargetTemperature".to_string(),
                delay: Duration::from_millis(200),
            }
        );

        assert_eq!(suite.setup.len(), 2);
        assert_eq!(suite.setup[1].description.as_deref(), Some("Power on"));
        assert_eq!(
            suite.setup[1].kind,
            StepKind::Wait {
                duration: Duration::from_millis(500)
            }
        );

        let case = &suite.test_cases[0];
        assert_eq!(case.requirements, vec!["REQ-HVAC-001"]);
        let steps = &case.steps;
        assert_eq!(steps.len(), 9);
        assert_eq!(
            steps[0].kind,
            StepKind::Inject {
                signals: vec![SignalWrite::new(
                    "Vehicle.Cabin.HVAC.TargetTemperature",
                    18i64,
                    Some(ActuatorMode::Target)
                )]
            }
        );
        assert_eq!(steps[1].timeout, Duration::from_secs(2));
        assert_eq!(
            steps[2].kind,
            StepKind::ExpectTransition {
                machine: "ClimateControl".to_string(),
                from: "IDLE".to_string(),
                to: "COOLING".to_string(),
                trigger: None,
            }
        );
        assert_eq!(steps[2].timeout, DEFAULT_STEP_TIMEOUT);

        match &steps[3].kind {
            StepKind::Expect { expectations } => {
                assert_eq!(expectations[0].expected, Value::Str("< 25".to_string()));
                assert_eq!(expectations[0].mode, None);
                assert_eq!(expectations[1].expected, Value::Int(18));
                assert_eq!(expectations[1].mode, Some(ActuatorMode::Target));
            }
            other => panic!("Expected expect step, got {:?}", other),
        }
        assert_eq!(steps[3].timeout, Duration::from_secs(3));

        assert_eq!(
            steps[5].kind,
            StepKind::ExpectLog {
                pattern: "compressor".to_string(),
                container: Some("hvac".to_string()),
            }
        );
        assert_eq!(steps[5].timeout, Duration::from_secs(1));
        assert_eq!(
            steps[8].kind,
            StepKind::Wait {
                duration: Duration::from_secs(2)
            }
        );
    }

    #[test]
    fn test_inject_map_forms() {
        let yaml = r#"
name: s
test_cases:
  - name: c
    steps:
      - inject:
          Vehicle.Speed: 50
          Vehicle.Cabin.Door.Row1.Left.IsOpen: { value: true }
          Vehicle.Body.Lights.Beam.Low.IsOn: { value: false, mode: actual }
"#;
        let suite = TestSuite::from_yaml(yaml).unwrap();
        let StepKind::Inject { signals } = &suite.test_cases[0].steps[0].kind else {
            panic!("Expected inject");
        };
        assert_eq!(signals[0], SignalWrite::new("Vehicle.Speed", 50i64, None));
        assert_eq!(signals[1].mode, Some(ActuatorMode::Target));
        assert_eq!(signals[2].mode, Some(ActuatorMode::Actual));
    }

    #[test]
    fn test_unknown_step_is_error() {
        let yaml = r#"
name: s
test_cases:
  - name: broken
    steps:
      - frobnicate: 1
        timeout: 2
"#;
        let err = TestSuite::from_yaml(yaml).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("broken"), "{message}");
        assert!(message.contains("frobnicate"), "{message}");
    }

    #[test]
    fn test_invalid_values() {
        let bad_wait = "name: s\ntest_cases:\n  - name: c\n    steps:\n      - wait: soon\n";
        assert!(matches!(TestSuite::from_yaml(bad_wait), Err(Error::InvalidStep(_))));

        for huge in ["wait: 1e30", "wait: 1e30ms", "log: x\n        timeout: 1e300"] {
            let yaml = format!("name: s\ntest_cases:\n  - name: c\n    steps:\n      - {huge}\n");
            assert!(
                matches!(TestSuite::from_yaml(&yaml), Err(Error::InvalidStep(_))),
                "{huge}"
            );
        }
        let huge_delay = r#"
name: s
fixtures:
  - type: actuator_mirror
    target_signal: A
    actual_signal: A
    delay: 1e30
test_cases: []
"#;
        assert!(matches!(TestSuite::from_yaml(huge_delay), Err(Error::InvalidStep(_))));

        let bad_mode = r#"
name: s
test_cases:
  - name: c
    steps:
      - inject: { path: A, value: 1, actuator_mode: sideways }
"#;
        assert!(TestSuite::from_yaml(bad_mode).is_err());

        let missing = r#"
name: s
test_cases:
  - name: c
    steps:
      - expect_state: { machine: M }
"#;
        assert!(TestSuite::from_yaml(missing).unwrap_err().to_string().contains("state"));
    }

    #[test]
    fn test_lint_against_spec() {
        let spec = VehicleSpec::from_yaml(
            r#"
signals:
  - path: Vehicle.Speed
    type: sensor
    datatype: float
    min: 0
    max: 250
state_machines:
  - name: ClimateControl
    states: [OFF, IDLE, COOLING]
"#,
        )
        .unwrap();

        let suite = TestSuite::from_yaml(
            r#"
name: s
test_cases:
  - name: c
    steps:
      - inject: { Vehicle.Speed: 300, Vehicle.Unknown: 1 }
      - expect_state: { machine: ClimateControl, state: HEATING }
      - expect_state: { machine: Wipers, state: ON }
"#,
        )
        .unwrap();

        let warnings = suite.lint(&spec);
        assert_eq!(warnings.len(), 4, "{warnings:?}");
        assert!(warnings.iter().any(|w| w.contains("Vehicle.Unknown")));
        assert!(warnings.iter().any(|w| w.contains("HEATING")));
        assert!(warnings.iter().any(|w| w.contains("Wipers")));
    }

    #[test]
    fn test_load_resolves_spec_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suite.yaml");
        std::fs::write(&path, "name: s\nsystem_spec: spec.yaml\n").unwrap();

        let suite = TestSuite::load(&path).unwrap();
        assert_eq!(suite.system_spec, Some(dir.path().join("spec.yaml")));
    }
}
