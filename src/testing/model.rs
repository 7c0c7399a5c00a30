//! Test steps, cases, suites and their results

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};

use crate::expr::Value;
use crate::signal::{ActuatorMode, SignalWrite};

/// Default timeout of a step
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Canonical payload of one step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Write signal values
    Inject { signals: Vec<SignalWrite> },
    /// Poll signals until every expectation holds
    Expect { expectations: Vec<Expectation> },
    /// Wait for a state machine to be in a state
    ExpectState { machine: String, state: String },
    /// Wait for a state machine transition to appear in the history
    ExpectTransition {
        machine: String,
        from: String,
        to: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        trigger: Option<String>,
    },
    Wait {
        #[serde(serialize_with = "serialize_secs")]
        duration: Duration,
    },
    Log { message: String },
    /// Wait for a captured log line matching `pattern` (case-insensitive)
    ExpectLog {
        pattern: String,
        /// Restrict the search to one log source
        #[serde(skip_serializing_if = "Option::is_none")]
        container: Option<String>,
    },
    /// Run a shell command; passes on exit code zero
    Run { command: String },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Inject { .. } => "inject",
            StepKind::Expect { .. } => "expect",
            StepKind::ExpectState { .. } => "expect_state",
            StepKind::ExpectTransition { .. } => "expect_transition",
            StepKind::Wait { .. } => "wait",
            StepKind::Log { .. } => "log",
            StepKind::ExpectLog { .. } => "expect_log",
            StepKind::Run { .. } => "run",
        }
    }

    /// Verification steps may never end up skipped
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            StepKind::Expect { .. } | StepKind::ExpectState { .. } | StepKind::ExpectLog { .. }
        )
    }
}

/// One expected signal value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Expectation {
    pub path: String,
    /// Literal, or condition text such as `"> 20"` or `"value in ['ON', 'AUTO']"`
    pub expected: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ActuatorMode>,
}

/// A parsed step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestStep {
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(serialize_with = "serialize_secs")]
    pub timeout: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TestStep {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            timeout: DEFAULT_STEP_TIMEOUT,
            description: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Short human label: the description if any, else a payload summary
    pub fn label(&self) -> String {
        if let Some(description) = &self.description {
            return description.clone();
        }
        match &self.kind {
            StepKind::Inject { signals } => {
                let parts: Vec<String> = signals.iter().map(ToString::to_string).collect();
                format!("inject {}", parts.join(", "))
            }
            StepKind::Expect { expectations } => {
                let parts: Vec<String> = expectations
                    .iter()
                    .map(|e| format!("{} {}", e.path, e.expected))
                    .collect();
                format!("expect {}", parts.join(", "))
            }
            StepKind::ExpectState { machine, state } => format!("expect {machine} in {state}"),
            StepKind::ExpectTransition {
                machine, from, to, ..
            } => format!("expect {machine} {from} -> {to}"),
            StepKind::Wait { duration } => format!("wait {}s", duration.as_secs_f64()),
            StepKind::Log { message } => format!("log {message}"),
            StepKind::ExpectLog { pattern, .. } => format!("expect log '{pattern}'"),
            StepKind::Run { command } => format!("run {command}"),
        }
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Test case definition
#[derive(Debug, Clone, Default, Serialize)]
pub struct TestCase {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub requirements: Vec<String>,
    pub tags: Vec<String>,
    pub setup: Vec<TestStep>,
    pub steps: Vec<TestStep>,
    pub teardown: Vec<TestStep>,
}

impl TestCase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Fixture simulating part of the vehicle during a suite
#[derive(Debug, Clone, PartialEq)]
pub struct FixtureDef {
    pub name: String,
    pub kind: FixtureKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FixtureKind {
    /// Echo every target write of `target_signal` to `actual_signal` after `delay`
    ActuatorMirror {
        target_signal: String,
        actual_signal: String,
        delay: Duration,
    },
}

/// Test suite definition
#[derive(Debug, Clone, Default)]
pub struct TestSuite {
    pub name: String,
    /// Vehicle spec referenced by the suite, relative paths resolved against the suite file
    pub system_spec: Option<PathBuf>,
    pub stop_on_failure: bool,
    pub metadata: BTreeMap<String, String>,
    pub fixtures: Vec<FixtureDef>,
    pub setup: Vec<TestStep>,
    pub test_cases: Vec<TestCase>,
    pub teardown: Vec<TestStep>,
}

impl TestSuite {
    /// Cases whose name contains `filter` (case-insensitive) and that carry
    /// at least one of `tags`; an empty tag list selects everything
    pub fn selected_cases(&self, filter: Option<&str>, tags: &[String]) -> Vec<&TestCase> {
        let filter = filter.map(str::to_lowercase);
        self.test_cases
            .iter()
            .filter(|case| {
                filter
                    .as_deref()
                    .is_none_or(|f| case.name.to_lowercase().contains(f))
            })
            .filter(|case| tags.is_empty() || case.tags.iter().any(|t| tags.contains(t)))
            .collect()
    }
}

/// Outcome of a step or case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Passed => f.write_str("PASSED"),
            StepStatus::Failed => f.write_str("FAILED"),
            StepStatus::Skipped => f.write_str("SKIPPED"),
            StepStatus::Error => f.write_str("ERROR"),
        }
    }
}

/// Which step list a result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Setup,
    Step,
    Teardown,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: TestStep,
    pub phase: Phase,
    pub status: StepStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    pub duration_ms: f64,
    pub timestamp: DateTime<Local>,
}

/// Result of one test case
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub requirements: Vec<String>,
    pub tags: Vec<String>,
    pub status: StepStatus,
    pub step_results: Vec<StepResult>,
    /// Teardown problems; they never change `status`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_ms: f64,
    pub start_time: DateTime<Local>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Local>>,
}

impl TestResult {
    pub fn new(case: &TestCase) -> Self {
        Self {
            name: case.name.clone(),
            description: case.description.clone(),
            requirements: case.requirements.clone(),
            tags: case.tags.clone(),
            status: StepStatus::Passed,
            step_results: Vec::new(),
            warnings: Vec::new(),
            error_message: None,
            duration_ms: 0.0,
            start_time: Local::now(),
            end_time: None,
        }
    }

    /// Record a setup or running step and fold it into the case status
    ///
    /// Skipped verification steps are promoted to failures. Status precedence
    /// is Error over Failed over Passed. Returns the recorded status.
    pub fn add_step_result(&mut self, mut result: StepResult) -> StepStatus {
        if result.step.kind.is_critical() && result.status == StepStatus::Skipped {
            result.status = StepStatus::Failed;
            let reason = if result.message.is_empty() {
                "Not implemented"
            } else {
                result.message.as_str()
            };
            result.message = format!("Critical step skipped: {reason}");
        }

        match result.status {
            StepStatus::Error => self.status = StepStatus::Error,
            StepStatus::Failed if self.status != StepStatus::Error => {
                self.status = StepStatus::Failed
            }
            _ => {}
        }

        let status = result.status;
        self.step_results.push(result);
        status
    }

    /// Record a teardown step; a failure only adds a warning
    pub fn add_teardown_result(&mut self, result: StepResult) {
        if result.status != StepStatus::Passed {
            let warning = format!("Teardown step failed: {}", result.message);
            tracing::warn!("{}", warning);
            self.warnings.push(warning);
        }
        self.step_results.push(result);
    }

    pub fn finish(&mut self) {
        let end = Local::now();
        self.duration_ms = (end - self.start_time).num_microseconds().unwrap_or(0) as f64 / 1000.0;
        self.end_time = Some(end);
    }

    /// Setup and running steps, without teardown
    pub fn verdict_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.step_results.iter().filter(|r| r.phase != Phase::Teardown)
    }
}

/// Case counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub error: usize,
}

/// Result of a suite run
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub suite: String,
    pub results: Vec<TestResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub setup_results: Vec<StepResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub teardown_results: Vec<StepResult>,
    /// Set when the suite could not run its cases
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Local>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Local>>,
    pub total_duration_ms: f64,
}

impl TestReport {
    pub fn new(suite: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            results: Vec::new(),
            setup_results: Vec::new(),
            teardown_results: Vec::new(),
            error: None,
            start_time: Local::now(),
            end_time: None,
            total_duration_ms: 0.0,
        }
    }

    /// Report for a suite that could not start at all
    pub fn aborted(suite: impl Into<String>, error: impl Into<String>) -> Self {
        let mut report = Self::new(suite);
        report.error = Some(error.into());
        report.finish();
        report
    }

    pub fn finish(&mut self) {
        let end = Local::now();
        self.total_duration_ms =
            (end - self.start_time).num_microseconds().unwrap_or(0) as f64 / 1000.0;
        self.end_time = Some(end);
    }

    pub fn summary(&self) -> Summary {
        let count = |status| self.results.iter().filter(|r| r.status == status).count();
        Summary {
            total: self.results.len(),
            passed: count(StepStatus::Passed),
            failed: count(StepStatus::Failed),
            skipped: count(StepStatus::Skipped),
            error: count(StepStatus::Error),
        }
    }

    /// Requirement id to the names of the cases covering it
    pub fn requirements_coverage(&self) -> BTreeMap<String, Vec<String>> {
        let mut coverage: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for result in &self.results {
            for req in &result.requirements {
                coverage.entry(req.clone()).or_default().push(result.name.clone());
            }
        }
        coverage
    }

    /// Whether the run completed with every case passed
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.results.iter().all(|r| r.status == StepStatus::Passed)
    }
}
