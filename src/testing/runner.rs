//! Step execution engine
//!
//! Runs cases one step at a time against a [`SignalClient`], the shared
//! [`StateTracker`] and the captured log buffer. Every step ends in a
//! [`StepResult`]; handler errors and panics become `Error` results instead
//! of escaping the run.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use futures_util::FutureExt;
use regex::RegexBuilder;
use tracing::Instrument;

use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::expr::{Evaluator, Value};
use crate::signal::{ActuatorMode, SignalClient, SignalWrite, VehicleSpec};
use crate::tracker::{LogBuffer, StateTracker};

use super::model::{
    Expectation, Phase, StepKind, StepResult, StepStatus, TestCase, TestReport, TestResult,
    TestStep, TestSuite,
};

/// Knobs for a run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Stop after the first failed case, in addition to the suite's own setting
    pub stop_on_failure: bool,
    /// Case name substring, case-insensitive
    pub filter: Option<String>,
    /// Only cases carrying one of these tags
    pub tags: Vec<String>,
    /// Retry interval of signal expectations
    pub poll_interval: Duration,
    /// Retry interval of log expectations
    pub log_poll_interval: Duration,
    /// Shell used for `run` steps
    pub shell: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stop_on_failure: false,
            filter: None,
            tags: Vec::new(),
            poll_interval: config.timeouts.poll_interval(),
            log_poll_interval: config.timeouts.log_poll_interval(),
            shell: config.defaults.shell.clone(),
        }
    }
}

/// Lifecycle of one case
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CasePhase {
    NotStarted,
    Setup,
    Running,
    Teardown,
    Done,
}

/// What a handler decided, before timing is attached
struct Outcome {
    status: StepStatus,
    message: String,
    actual: Option<Value>,
    expected: Option<Value>,
}

impl Outcome {
    fn new(status: StepStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            actual: None,
            expected: None,
        }
    }

    fn passed(message: impl Into<String>) -> Self {
        Self::new(StepStatus::Passed, message)
    }

    fn failed(message: impl Into<String>) -> Self {
        Self::new(StepStatus::Failed, message)
    }

    fn error(message: impl Into<String>) -> Self {
        Self::new(StepStatus::Error, message)
    }

    fn with_values(mut self, actual: Option<Value>, expected: Option<Value>) -> Self {
        self.actual = actual;
        self.expected = expected;
        self
    }
}

/// Executes test suites
pub struct TestRunner {
    client: Arc<dyn SignalClient>,
    tracker: StateTracker,
    evaluator: Arc<Evaluator>,
    spec: Option<Arc<VehicleSpec>>,
    logs: Option<LogBuffer>,
    options: RunOptions,
}

impl TestRunner {
    /// The client is expected to be connected already
    pub fn new(client: Arc<dyn SignalClient>, tracker: StateTracker) -> Self {
        Self {
            client,
            tracker,
            evaluator: Arc::new(Evaluator::new()),
            spec: None,
            logs: None,
            options: RunOptions::default(),
        }
    }

    /// Validate injected values and pick actuator channels from this spec
    pub fn with_spec(mut self, spec: Arc<VehicleSpec>) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Buffer searched by `expect_log` steps
    pub fn with_log_buffer(mut self, logs: LogBuffer) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    /// Run suite setup, the selected cases and suite teardown
    ///
    /// A failing suite setup step skips every case and tags the report with
    /// an error. Suite teardown always runs.
    #[tracing::instrument(skip_all, fields(suite = %suite.name))]
    pub async fn run_suite(&self, suite: &TestSuite) -> TestReport {
        let mut report = TestReport::new(&suite.name);
        let cases = suite.selected_cases(self.options.filter.as_deref(), &self.options.tags);

        tracing::info!("Starting test suite: {}", suite.name);
        tracing::info!("{} test(s) from {}", cases.len(), suite.name);

        if let Some(spec) = &self.spec {
            for warning in suite.lint(spec) {
                tracing::warn!("{}", warning);
            }
        }

        if !suite.setup.is_empty() {
            tracing::info!("Running suite setup");
        }
        for step in &suite.setup {
            let result = self.execute_step(step, Phase::Setup).await;
            let status = result.status;
            let message = result.message.clone();
            report.setup_results.push(result);
            if status != StepStatus::Passed && status != StepStatus::Skipped {
                tracing::error!("Suite setup step failed: {}", message);
                report.error = Some(format!("Suite setup failed: {message}"));
                break;
            }
        }

        if report.error.is_none() {
            let stop_on_failure = self.options.stop_on_failure || suite.stop_on_failure;
            for case in cases {
                let result = self.run_test_case(case).await;
                let failed = result.status == StepStatus::Failed;
                report.results.push(result);

                if failed && stop_on_failure {
                    tracing::warn!("Stopping suite execution due to test failure");
                    break;
                }
            }
        }

        if !suite.teardown.is_empty() {
            tracing::info!("Running suite teardown");
        }
        for step in &suite.teardown {
            let result = self.execute_step(step, Phase::Teardown).await;
            if result.status != StepStatus::Passed {
                tracing::warn!("Suite teardown step failed: {}", result.message);
            }
            report.teardown_results.push(result);
        }

        report.finish();
        let summary = report.summary();
        tracing::info!(
            passed = summary.passed,
            failed = summary.failed,
            error = summary.error,
            "Suite finished in {:.0} ms",
            report.total_duration_ms
        );
        report
    }

    /// Run one case: setup, steps, then teardown
    ///
    /// A setup step that does not pass ends the case without running its
    /// steps or teardown. The first step that does not pass stops the
    /// remaining steps; teardown still runs and only contributes warnings.
    pub async fn run_test_case(&self, case: &TestCase) -> TestResult {
        let span = tracing::info_span!("test_case", name = %case.name);
        self.run_test_case_inner(case).instrument(span).await
    }

    async fn run_test_case_inner(&self, case: &TestCase) -> TestResult {
        let mut result = TestResult::new(case);
        let mut phase = CasePhase::NotStarted;
        tracing::info!("[ RUN      ] {}", case.name);

        advance(&mut phase, CasePhase::Setup);
        for step in &case.setup {
            let status = result.add_step_result(self.execute_step(step, Phase::Setup).await);
            if status != StepStatus::Passed {
                result.error_message = Some("Setup failed".to_string());
                advance(&mut phase, CasePhase::Done);
                break;
            }
        }

        if phase != CasePhase::Done {
            advance(&mut phase, CasePhase::Running);
            let total = case.steps.len();
            for (index, step) in case.steps.iter().enumerate() {
                tracing::debug!("Running step {}/{}", index + 1, total);
                let status = result.add_step_result(self.execute_step(step, Phase::Step).await);
                if status != StepStatus::Passed {
                    break;
                }
            }

            advance(&mut phase, CasePhase::Teardown);
            for step in &case.teardown {
                result.add_teardown_result(self.execute_step(step, Phase::Teardown).await);
            }
            advance(&mut phase, CasePhase::Done);
        }

        result.finish();
        if result.status == StepStatus::Passed {
            tracing::info!("[       OK ] {} ({:.0} ms)", case.name, result.duration_ms);
        } else {
            tracing::info!("[  FAILED  ] {} ({:.0} ms)", case.name, result.duration_ms);
        }
        result
    }

    /// Execute one step, turning errors and panics into `Error` results
    pub async fn execute_step(&self, step: &TestStep, phase: Phase) -> StepResult {
        let span = tracing::info_span!("step", kind = step.kind.name(), label = %step.label());
        let started = Instant::now();
        let timestamp = Local::now();

        let outcome = AssertUnwindSafe(self.dispatch(step))
            .catch_unwind()
            .instrument(span)
            .await;

        let outcome = match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::error!("Step execution failed: {}", e);
                Outcome::error(e.to_string())
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("Step panicked: {}", message);
                Outcome::error(format!("Step panicked: {message}"))
            }
        };

        match outcome.status {
            StepStatus::Passed => tracing::debug!("{}", outcome.message),
            _ => tracing::info!(status = %outcome.status, "{}", outcome.message),
        }

        StepResult {
            step: step.clone(),
            phase,
            status: outcome.status,
            message: outcome.message,
            actual: outcome.actual,
            expected: outcome.expected,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            timestamp,
        }
    }

    async fn dispatch(&self, step: &TestStep) -> Result<Outcome> {
        match &step.kind {
            StepKind::Inject { signals } => self.inject(signals).await,
            StepKind::Expect { expectations } => self.expect(expectations, step.timeout).await,
            StepKind::ExpectState { machine, state } => {
                Ok(self.expect_state(machine, state, step.timeout).await)
            }
            StepKind::ExpectTransition {
                machine,
                from,
                to,
                trigger,
            } => Ok(self
                .expect_transition(machine, from, to, trigger.as_deref(), step.timeout)
                .await),
            StepKind::Wait { duration } => {
                tokio::time::sleep(*duration).await;
                Ok(Outcome::passed(format!("Waited {}s", duration.as_secs_f64())))
            }
            StepKind::Log { message } => {
                tracing::info!("TEST LOG: {}", message);
                Ok(Outcome::passed(format!("Logged: {message}")))
            }
            StepKind::ExpectLog { pattern, container } => {
                self.expect_log(pattern, container.as_deref(), step.timeout).await
            }
            StepKind::Run { command } => Ok(self.run_command(command, step.timeout).await),
        }
    }

    /// Writes without an explicit mode go to the target channel for declared
    /// actuators and to the current channel otherwise
    async fn inject(&self, signals: &[SignalWrite]) -> Result<Outcome> {
        let mut writes = Vec::with_capacity(signals.len());
        for write in signals {
            let mut mode = write.mode;
            if let Some(spec) = &self.spec {
                if let Err(e) = spec.validate_value(&write.path, &write.value) {
                    return Ok(Outcome::failed(format!(
                        "Invalid value {} for signal {}: {}",
                        write.value, write.path, e.reason
                    )));
                }
                if mode.is_none() && spec.signal(&write.path).is_some_and(|s| s.is_actuator()) {
                    mode = Some(ActuatorMode::Target);
                }
            }
            writes.push(SignalWrite {
                path: write.path.clone(),
                value: write.value.clone(),
                mode,
            });
        }

        match self.client.set_many(&writes).await {
            Ok(()) => Ok(Outcome::passed(format!("Injected {} signal(s)", writes.len()))),
            Err(e) => Ok(Outcome::failed(format!("Failed to inject signals: {e}"))),
        }
    }

    /// Poll until every expectation holds at once or `timeout` elapses
    async fn expect(&self, expectations: &[Expectation], timeout: Duration) -> Result<Outcome> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let mut failures = Vec::new();
            let mut last_actual = None;

            for expectation in expectations {
                match self.client.get(&expectation.path, expectation.mode).await {
                    Ok(signal) => {
                        let (ok, description) =
                            self.evaluator
                                .evaluate_condition(&expectation.expected, &signal.value, None);
                        if !ok {
                            failures.push(format!("{}: {}", expectation.path, description));
                        }
                        last_actual = Some(signal.value);
                    }
                    Err(e) => failures.push(format!("{}: {}", expectation.path, e)),
                }
            }

            // Single expectations carry their values into the report
            let values = |actual: Option<Value>| match expectations {
                [only] => (actual, Some(only.expected.clone())),
                _ => (None, None),
            };

            if failures.is_empty() {
                let (actual, expected) = values(last_actual);
                return Ok(Outcome::passed(format!(
                    "All {} expectation(s) met",
                    expectations.len()
                ))
                .with_values(actual, expected));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                let (actual, expected) = values(last_actual);
                return Ok(Outcome::failed(format!(
                    "Expectations not met within {}s: {}",
                    timeout.as_secs_f64(),
                    failures.join("; ")
                ))
                .with_values(actual, expected));
            }

            tokio::time::sleep(remaining.min(self.options.poll_interval)).await;
        }
    }

    async fn expect_state(&self, machine: &str, expected: &str, timeout: Duration) -> Outcome {
        let reached = self.tracker.wait_for_state(machine, expected, timeout).await;
        let current = self.tracker.current_state(machine);
        let shown = current.as_deref().unwrap_or("unknown");

        if reached {
            Outcome::passed(format!("{machine} is in state {shown}"))
        } else {
            Outcome::failed(format!("{machine} is in state {shown}, expected {expected}"))
                .with_values(
                    Some(current.map(Value::Str).unwrap_or(Value::None)),
                    Some(Value::Str(expected.to_string())),
                )
        }
    }

    async fn expect_transition(
        &self,
        machine: &str,
        from: &str,
        to: &str,
        trigger: Option<&str>,
        timeout: Duration,
    ) -> Outcome {
        let wanted = match trigger {
            Some(trigger) => format!("{from} -> {to} (trigger={trigger})"),
            None => format!("{from} -> {to}"),
        };

        if self
            .tracker
            .wait_for_transition(machine, from, to, trigger, timeout)
            .await
        {
            return Outcome::passed(format!("{machine} transitioned {wanted}"));
        }

        let last = self.tracker.last_transition(machine);
        let observed = last
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "none".to_string());
        Outcome::failed(format!(
            "{machine} did not transition {wanted} within {}s; last transition: {observed}",
            timeout.as_secs_f64()
        ))
        .with_values(
            last.map(|t| Value::Str(t.to_string())),
            Some(Value::Str(wanted)),
        )
    }

    async fn expect_log(
        &self,
        pattern: &str,
        container: Option<&str>,
        timeout: Duration,
    ) -> Result<Outcome> {
        let Some(logs) = &self.logs else {
            return Ok(Outcome::error("No log source configured for log checking"));
        };

        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::InvalidStep(format!("invalid log pattern '{pattern}': {e}")))?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(line) = logs.find(&regex, container) {
                return Ok(Outcome::passed(format!(
                    "Found pattern '{pattern}' in logs from {}",
                    line.source
                )));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                let scope = match container {
                    Some(c) => format!("'{c}'"),
                    None => "captured".to_string(),
                };
                return Ok(Outcome::failed(format!(
                    "Pattern '{pattern}' not found in {scope} logs within {}s",
                    timeout.as_secs_f64()
                )));
            }
            tokio::time::sleep(remaining.min(self.options.log_poll_interval)).await;
        }
    }

    async fn run_command(&self, command: &str, timeout: Duration) -> Outcome {
        let child = tokio::process::Command::new(&self.options.shell)
            .arg("-c")
            .arg(command)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) if output.status.success() => {
                Outcome::passed(format!("Command succeeded: {command}"))
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let detail = match output.status.code() {
                    Some(code) => format!("exit code {code}"),
                    None => "terminated by signal".to_string(),
                };
                Outcome::failed(format!("Command failed ({detail}): {}", stderr.trim()))
            }
            Ok(Err(e)) => Outcome::error(format!("Failed to run command: {e}")),
            Err(_) => Outcome::failed(format!(
                "Command timed out after {}s: {command}",
                timeout.as_secs_f64()
            )),
        }
    }
}

fn advance(phase: &mut CasePhase, next: CasePhase) {
    tracing::trace!("Case phase {:?} -> {:?}", phase, next);
    *phase = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::MemoryBroker;

    fn step(kind: StepKind) -> TestStep {
        TestStep::new(kind).with_timeout(Duration::from_millis(300))
    }

    async fn runner() -> (TestRunner, Arc<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::new());
        broker.connect().await.unwrap();
        let tracker = StateTracker::new().with_poll_interval(Duration::from_millis(10));
        let options = RunOptions {
            poll_interval: Duration::from_millis(10),
            log_poll_interval: Duration::from_millis(10),
            ..RunOptions::default()
        };
        let runner = TestRunner::new(broker.clone(), tracker).with_options(options);
        (runner, broker)
    }

    fn spec() -> Arc<VehicleSpec> {
        Arc::new(
            VehicleSpec::from_yaml(
                r#"
signals:
  - path: Vehicle.Speed
    type: sensor
    datatype: float
    min: 0
    max: 250
  - path: Vehicle.Cabin.HVAC.TargetTemperature
    type: actuator
    datatype: int8
    mode: [target, actual]
"#,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_inject_routes_actuators_to_target() {
        let (runner, broker) = runner().await;
        let runner = runner.with_spec(spec());

        let result = runner
            .execute_step(
                &step(StepKind::Inject {
                    signals: vec![
                        SignalWrite::new("Vehicle.Speed", 50.0, None),
                        SignalWrite::new("Vehicle.Cabin.HVAC.TargetTemperature", 21i64, None),
                    ],
                }),
                Phase::Step,
            )
            .await;
        assert_eq!(result.status, StepStatus::Passed, "{}", result.message);
        assert_eq!(result.message, "Injected 2 signal(s)");

        assert_eq!(broker.current("Vehicle.Speed"), Some(Value::Float(50.0)));
        let target = broker
            .get("Vehicle.Cabin.HVAC.TargetTemperature", Some(ActuatorMode::Target))
            .await
            .unwrap();
        assert_eq!(target.value, Value::Int(21));
        assert_eq!(broker.current("Vehicle.Cabin.HVAC.TargetTemperature"), None);
    }

    #[tokio::test]
    async fn test_inject_validation_failure_skips_write() {
        let (runner, broker) = runner().await;
        let runner = runner.with_spec(spec());

        let result = runner
            .execute_step(
                &step(StepKind::Inject {
                    signals: vec![
                        SignalWrite::new("Vehicle.Cabin.HVAC.TargetTemperature", 20i64, None),
                        SignalWrite::new("Vehicle.Speed", 300.0, None),
                    ],
                }),
                Phase::Step,
            )
            .await;
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.message.starts_with("Invalid value 300"), "{}", result.message);
        assert!(broker.snapshot().1.is_empty());
    }

    #[tokio::test]
    async fn test_inject_client_error_is_failure() {
        let (runner, broker) = runner().await;
        broker.disconnect().await.unwrap();

        let result = runner
            .execute_step(
                &step(StepKind::Inject {
                    signals: vec![SignalWrite::new("Vehicle.Speed", 1i64, None)],
                }),
                Phase::Step,
            )
            .await;
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.message.starts_with("Failed to inject signals"));
    }

    #[tokio::test]
    async fn test_expect_waits_for_value() {
        let (runner, broker) = runner().await;
        let writer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.set("Vehicle.Speed", Value::Int(120), None).await.unwrap();
        });

        let result = runner
            .execute_step(
                &step(StepKind::Expect {
                    expectations: vec![Expectation {
                        path: "Vehicle.Speed".to_string(),
                        expected: Value::Str("> 100".to_string()),
                        mode: None,
                    }],
                }),
                Phase::Step,
            )
            .await;
        assert_eq!(result.status, StepStatus::Passed, "{}", result.message);
        assert_eq!(result.actual, Some(Value::Int(120)));
    }

    #[tokio::test]
    async fn test_expect_lists_every_unmet_expectation() {
        let (runner, broker) = runner().await;
        broker.set("Vehicle.A", Value::Int(1), None).await.unwrap();
        broker.set("Vehicle.B", Value::Int(2), None).await.unwrap();

        let result = runner
            .execute_step(
                &step(StepKind::Expect {
                    expectations: vec![
                        Expectation {
                            path: "Vehicle.A".to_string(),
                            expected: Value::Int(1),
                            mode: None,
                        },
                        Expectation {
                            path: "Vehicle.B".to_string(),
                            expected: Value::Int(3),
                            mode: None,
                        },
                        Expectation {
                            path: "Vehicle.C".to_string(),
                            expected: Value::Int(3),
                            mode: None,
                        },
                    ],
                }),
                Phase::Step,
            )
            .await;
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.message.starts_with("Expectations not met within 0.3s: "));
        assert!(result.message.contains("Vehicle.B: Expected 3, got 2"), "{}", result.message);
        assert!(result.message.contains("Vehicle.C: "));
        assert!(!result.message.contains("Vehicle.A"));
    }

    #[tokio::test]
    async fn test_unsafe_condition_fails_without_crashing() {
        let (runner, broker) = runner().await;
        broker.set("Vehicle.A", Value::Int(1), None).await.unwrap();

        let result = runner
            .execute_step(
                &step(StepKind::Expect {
                    expectations: vec![Expectation {
                        path: "Vehicle.A".to_string(),
                        expected: Value::Str("value == __import__('os')".to_string()),
                        mode: None,
                    }],
                }),
                Phase::Step,
            )
            .await;
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.message.contains("Failed to evaluate"), "{}", result.message);
    }

    #[tokio::test]
    async fn test_expect_log_requires_source() {
        let (runner, _) = runner().await;
        let result = runner
            .execute_step(
                &step(StepKind::ExpectLog {
                    pattern: "ready".to_string(),
                    container: None,
                }),
                Phase::Step,
            )
            .await;
        assert_eq!(result.status, StepStatus::Error);
    }

    #[tokio::test]
    async fn test_expect_log_case_insensitive_and_scoped() {
        let (runner, _) = runner().await;
        let logs = LogBuffer::new(100, 4096);
        logs.push(&Arc::from("hvac"), "Compressor STARTED");
        let runner = runner.with_log_buffer(logs);

        let found = runner
            .execute_step(
                &step(StepKind::ExpectLog {
                    pattern: "compressor started".to_string(),
                    container: Some("hvac".to_string()),
                }),
                Phase::Step,
            )
            .await;
        assert_eq!(found.status, StepStatus::Passed);

        let other = runner
            .execute_step(
                &step(StepKind::ExpectLog {
                    pattern: "compressor".to_string(),
                    container: Some("seat".to_string()),
                }),
                Phase::Step,
            )
            .await;
        assert_eq!(other.status, StepStatus::Failed);
        assert!(other.message.contains("'seat'"));

        let invalid = runner
            .execute_step(
                &step(StepKind::ExpectLog {
                    pattern: "(unclosed".to_string(),
                    container: None,
                }),
                Phase::Step,
            )
            .await;
        assert_eq!(invalid.status, StepStatus::Error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command() {
        let (runner, _) = runner().await;
        let ok = runner
            .execute_step(&step(StepKind::Run { command: "true".to_string() }), Phase::Step)
            .await;
        assert_eq!(ok.status, StepStatus::Passed);
        assert_eq!(ok.message, "Command succeeded: true");

        let failed = runner
            .execute_step(
                &step(StepKind::Run {
                    command: "echo broken >&2; exit 3".to_string(),
                }),
                Phase::Step,
            )
            .await;
        assert_eq!(failed.status, StepStatus::Failed);
        assert_eq!(failed.message, "Command failed (exit code 3): broken");
    }

    #[tokio::test]
    async fn test_setup_failure_skips_steps_and_teardown() {
        let (runner, broker) = runner().await;
        let mut case = TestCase::new("setup fails");
        case.setup = vec![step(StepKind::ExpectState {
            machine: "Door".to_string(),
            state: "OPEN".to_string(),
        })];
        case.steps = vec![step(StepKind::Inject {
            signals: vec![SignalWrite::new("Vehicle.A", 1i64, None)],
        })];
        case.teardown = vec![step(StepKind::Inject {
            signals: vec![SignalWrite::new("Vehicle.B", 1i64, None)],
        })];

        let result = runner.run_test_case(&case).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.error_message.as_deref(), Some("Setup failed"));
        assert_eq!(result.step_results.len(), 1);
        assert!(broker.snapshot().0.is_empty());
    }

    #[tokio::test]
    async fn test_stop_on_failure_and_filter() {
        let (runner, _) = runner().await;
        let failing = |name: &str| {
            let mut case = TestCase::new(name);
            case.steps = vec![step(StepKind::ExpectState {
                machine: "Door".to_string(),
                state: "OPEN".to_string(),
            })];
            case
        };

        let mut suite = TestSuite {
            name: "suite".to_string(),
            test_cases: vec![failing("first"), failing("second")],
            ..Default::default()
        };
        assert_eq!(runner.run_suite(&suite).await.results.len(), 2);

        suite.stop_on_failure = true;
        let report = runner.run_suite(&suite).await;
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].name, "first");

        let runner = runner.with_options(RunOptions {
            filter: Some("SECOND".to_string()),
            ..RunOptions::default()
        });
        let report = runner.run_suite(&suite).await;
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].name, "second");
    }

    #[tokio::test]
    async fn test_suite_setup_failure_aborts_cases_but_runs_teardown() {
        let (runner, broker) = runner().await;
        let suite = TestSuite {
            name: "suite".to_string(),
            setup: vec![step(StepKind::ExpectState {
                machine: "Door".to_string(),
                state: "OPEN".to_string(),
            })],
            test_cases: vec![TestCase::new("never runs")],
            teardown: vec![step(StepKind::Inject {
                signals: vec![SignalWrite::new("Vehicle.Cleanup", true, None)],
            })],
            ..Default::default()
        };

        let report = runner.run_suite(&suite).await;
        assert!(report.results.is_empty());
        assert!(report.error.as_deref().unwrap_or("").starts_with("Suite setup failed"));
        assert_eq!(report.teardown_results.len(), 1);
        assert_eq!(broker.current("Vehicle.Cleanup"), Some(Value::Bool(true)));
        assert!(!report.is_success());
    }

    struct PanickingClient;

    #[async_trait::async_trait]
    impl SignalClient for PanickingClient {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }

        async fn get(
            &self,
            _path: &str,
            _mode: Option<ActuatorMode>,
        ) -> Result<crate::signal::SignalValue> {
            panic!("broker exploded")
        }

        async fn set_many(&self, _writes: &[SignalWrite]) -> Result<()> {
            Err(Error::Internal("unreachable broker".to_string()))
        }

        async fn subscribe(
            &self,
            _paths: &[String],
            _mode: Option<ActuatorMode>,
        ) -> Result<crate::signal::SignalStream> {
            Err(Error::NotConnected)
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_error() {
        let runner = TestRunner::new(Arc::new(PanickingClient), StateTracker::new());
        let mut case = TestCase::new("panics");
        case.steps = vec![step(StepKind::Expect {
            expectations: vec![Expectation {
                path: "Vehicle.A".to_string(),
                expected: Value::Int(1),
                mode: None,
            }],
        })];

        let result = runner.run_test_case(&case).await;
        assert_eq!(result.status, StepStatus::Error);
        assert!(result.step_results[0].message.contains("broker exploded"));
    }
}
