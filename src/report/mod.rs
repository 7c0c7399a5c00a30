//! Report rendering
//!
//! A finished [`TestReport`] is rendered to text in one of several formats
//! and optionally written to a file.

use std::fmt::Write as _;
use std::path::Path;

use colored::Colorize;

use crate::common::{Error, Result};
use crate::signal::VehicleSpec;
use crate::testing::{Phase, StepResult, StepStatus, TestReport, TestResult};

/// Every case passed
pub const EXIT_SUCCESS: i32 = 0;
/// At least one case failed or errored
pub const EXIT_FAILURE: i32 = 1;
/// The suite could not run its cases
pub const EXIT_ABORTED: i32 = 2;

const RULE_WIDTH: usize = 60;

/// Output format of a report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportFormat {
    #[default]
    Console,
    Json,
    Markdown,
    Junit,
}

/// Process exit code for a report
pub fn exit_code(report: &TestReport) -> i32 {
    if report.error.is_some() {
        EXIT_ABORTED
    } else if report.is_success() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    }
}

/// Render `report`; with a spec, coverage also lists uncovered requirements
pub fn render(
    report: &TestReport,
    format: ReportFormat,
    spec: Option<&VehicleSpec>,
) -> Result<String> {
    Ok(match format {
        ReportFormat::Console => render_console(report, spec),
        ReportFormat::Json => serde_json::to_string_pretty(report)?,
        ReportFormat::Markdown => render_markdown(report, spec),
        ReportFormat::Junit => render_junit(report),
    })
}

/// Write rendered output, creating parent directories
pub fn write_output(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content).map_err(Error::Io)?;
    tracing::info!("Report written to {}", path.display());
    Ok(())
}

/// Requirements declared in the vehicle spec that no case covers
fn uncovered<'a>(report: &TestReport, spec: Option<&'a VehicleSpec>) -> Vec<&'a str> {
    let Some(spec) = spec else {
        return Vec::new();
    };
    let covered = report.requirements_coverage();
    spec.requirements
        .keys()
        .filter(|id| !covered.contains_key(*id))
        .map(String::as_str)
        .collect()
}

/// Steps that explain a non-passing case
fn problem_steps(result: &TestResult) -> impl Iterator<Item = &StepResult> {
    result
        .step_results
        .iter()
        .filter(|r| r.phase != Phase::Teardown && r.status != StepStatus::Passed)
}

fn seconds(ms: f64) -> String {
    format!("{:.2}s", ms / 1000.0)
}

fn render_console(report: &TestReport, spec: Option<&VehicleSpec>) -> String {
    let mut out = String::new();
    let rule = "=".repeat(RULE_WIDTH);

    let _ = writeln!(out, "\n{}", rule.dimmed());
    let _ = writeln!(out, "{} {}", "Test Report:".blue().bold(), report.suite.white().bold());
    let _ = writeln!(out, "{}", rule.dimmed());

    if let Some(error) = &report.error {
        let _ = writeln!(out, "{} {}", "✗".red().bold(), error.red());
    }

    for result in &report.results {
        let (mark, label) = match result.status {
            StepStatus::Passed => ("✓".green(), "PASSED".green()),
            StepStatus::Failed => ("✗".red(), "FAILED".red()),
            StepStatus::Error => ("✗".red(), "ERROR".red().bold()),
            StepStatus::Skipped => ("-".yellow(), "SKIPPED".yellow()),
        };
        let _ = writeln!(
            out,
            "  {} {:<8} {} {}",
            mark,
            label,
            result.name,
            format!("({:.0} ms)", result.duration_ms).dimmed()
        );

        if let Some(message) = &result.error_message {
            let _ = writeln!(out, "      {}", message.red());
        }
        if result.status != StepStatus::Passed {
            for step in problem_steps(result) {
                let _ = writeln!(out, "      {}: {}", step.step.label().dimmed(), step.message);
            }
        }
        for warning in &result.warnings {
            let _ = writeln!(out, "      {} {}", "warning:".yellow(), warning);
        }
    }

    let summary = report.summary();
    let _ = writeln!(out, "{}", "-".repeat(RULE_WIDTH).dimmed());
    let _ = writeln!(
        out,
        "Total: {}  Passed: {}  Failed: {}  Errors: {}  Skipped: {}",
        summary.total,
        summary.passed.to_string().green(),
        summary.failed.to_string().red(),
        summary.error.to_string().red(),
        summary.skipped.to_string().yellow()
    );
    let _ = writeln!(out, "Duration: {}", seconds(report.total_duration_ms));

    let coverage = report.requirements_coverage();
    if !coverage.is_empty() {
        let _ = writeln!(out, "\n{}", "Requirements coverage:".cyan());
        for (id, cases) in &coverage {
            let _ = writeln!(out, "  {} {}", id, cases.join(", ").dimmed());
        }
    }
    let missing = uncovered(report, spec);
    if !missing.is_empty() {
        let _ = writeln!(out, "  {} {}", "Not covered:".yellow(), missing.join(", "));
    }

    let verdict = if report.is_success() {
        "PASSED".green().bold()
    } else {
        "FAILED".red().bold()
    };
    let _ = writeln!(out, "\nResult: {}", verdict);
    out
}

fn render_markdown(report: &TestReport, spec: Option<&VehicleSpec>) -> String {
    let mut out = String::new();
    let summary = report.summary();

    let _ = writeln!(out, "# Test Report: {}\n", report.suite);
    let _ = writeln!(out, "- Started: {}", report.start_time.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "- Duration: {}", seconds(report.total_duration_ms));
    let verdict = if report.is_success() { "PASSED" } else { "FAILED" };
    let _ = writeln!(out, "- Result: **{verdict}**");
    if let Some(error) = &report.error {
        let _ = writeln!(out, "- Error: {}", md_cell(error));
    }

    let _ = writeln!(out, "\n## Summary\n");
    let _ = writeln!(out, "| Total | Passed | Failed | Errors | Skipped |");
    let _ = writeln!(out, "|---|---|---|---|---|");
    let _ = writeln!(
        out,
        "| {} | {} | {} | {} | {} |",
        summary.total, summary.passed, summary.failed, summary.error, summary.skipped
    );

    if !report.results.is_empty() {
        let _ = writeln!(out, "\n## Results\n");
        let _ = writeln!(out, "| Test | Status | Duration | Requirements |");
        let _ = writeln!(out, "|---|---|---|---|");
        for result in &report.results {
            let _ = writeln!(
                out,
                "| {} | {} | {:.0} ms | {} |",
                md_cell(&result.name),
                result.status,
                result.duration_ms,
                result.requirements.join(", ")
            );
        }
    }

    let failing: Vec<&TestResult> = report
        .results
        .iter()
        .filter(|r| r.status != StepStatus::Passed || !r.warnings.is_empty())
        .collect();
    if !failing.is_empty() {
        let _ = writeln!(out, "\n## Details");
        for result in failing {
            let _ = writeln!(out, "\n### {} ({})\n", result.name, result.status);
            if let Some(message) = &result.error_message {
                let _ = writeln!(out, "- {message}");
            }
            for step in problem_steps(result) {
                let _ = writeln!(out, "- `{}`: {}", step.step.label(), step.message);
                if let (Some(actual), Some(expected)) = (&step.actual, &step.expected) {
                    let _ = writeln!(out, "  - expected `{expected}`, actual `{actual}`");
                }
            }
            for warning in &result.warnings {
                let _ = writeln!(out, "- Warning: {warning}");
            }
        }
    }

    let coverage = report.requirements_coverage();
    let missing = uncovered(report, spec);
    if !coverage.is_empty() || !missing.is_empty() {
        let _ = writeln!(out, "\n## Requirements Coverage\n");
        let _ = writeln!(out, "| Requirement | Covered by |");
        let _ = writeln!(out, "|---|---|");
        for (id, cases) in &coverage {
            let _ = writeln!(out, "| {} | {} |", id, md_cell(&cases.join(", ")));
        }
        for id in missing {
            let _ = writeln!(out, "| {id} | *not covered* |");
        }
    }
    out
}

fn md_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

fn render_junit(report: &TestReport) -> String {
    let summary = report.summary();
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let secs = |ms: f64| format!("{:.3}", ms / 1000.0);

    let _ = writeln!(out, "<testsuites>");
    let _ = writeln!(
        out,
        concat!(
            "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\"",
            " skipped=\"{}\" time=\"{}\" timestamp=\"{}\">"
        ),
        xml_escape(&report.suite),
        summary.total,
        summary.failed,
        summary.error,
        summary.skipped,
        secs(report.total_duration_ms),
        report.start_time.format("%Y-%m-%dT%H:%M:%S")
    );

    for result in &report.results {
        let _ = write!(
            out,
            "    <testcase name=\"{}\" classname=\"{}\" time=\"{}\"",
            xml_escape(&result.name),
            xml_escape(&report.suite),
            secs(result.duration_ms)
        );

        let details: Vec<String> = result
            .error_message
            .iter()
            .cloned()
            .chain(problem_steps(result).map(|s| format!("{}: {}", s.step.label(), s.message)))
            .collect();
        let message = details.first().cloned().unwrap_or_default();

        let body = match result.status {
            StepStatus::Passed => None,
            StepStatus::Failed => Some("failure"),
            StepStatus::Error => Some("error"),
            StepStatus::Skipped => Some("skipped"),
        };
        match body {
            None if result.warnings.is_empty() => {
                let _ = writeln!(out, "/>");
            }
            _ => {
                let _ = writeln!(out, ">");
                if let Some(tag) = body {
                    let _ = writeln!(
                        out,
                        "      <{tag} message=\"{}\">{}</{tag}>",
                        xml_escape(&message),
                        xml_escape(&details.join("\n"))
                    );
                }
                if !result.warnings.is_empty() {
                    let _ = writeln!(
                        out,
                        "      <system-err>{}</system-err>",
                        xml_escape(&result.warnings.join("\n"))
                    );
                }
                let _ = writeln!(out, "    </testcase>");
            }
        }
    }

    if let Some(error) = &report.error {
        let _ = writeln!(out, "    <system-err>{}</system-err>", xml_escape(error));
    }
    let _ = writeln!(out, "  </testsuite>");
    let _ = writeln!(out, "</testsuites>");
    out
}

fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}
