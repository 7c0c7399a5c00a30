//! CLI command definitions
//!
//! Defines the clap commands for the test runner CLI.

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::report::ReportFormat;

#[derive(Subcommand)]
pub enum Commands {
    /// Run a test suite
    Run(RunArgs),

    /// Parse and validate a test suite without running it
    Check {
        /// Suite YAML file
        suite: PathBuf,

        /// Vehicle function spec to validate against (default: the suite's `system_spec`)
        #[arg(long)]
        spec: Option<PathBuf>,
    },

    /// Feed a captured log through the state tracker and print what it saw
    Replay {
        /// Log file to replay
        log: PathBuf,

        /// Only show this state machine
        #[arg(long)]
        machine: Option<String>,
    },

    /// Read a signal from the broker
    Get {
        /// Signal path, e.g. Vehicle.Speed
        path: String,

        /// Read the commanded (target) value of an actuator
        #[arg(long)]
        target: bool,
    },

    /// Write a signal to the broker
    Set {
        /// Signal path, e.g. Vehicle.Speed
        path: String,

        /// Value; numbers, true/false and quoted strings are recognized
        value: String,

        /// Write the commanded (target) value of an actuator
        #[arg(long)]
        target: bool,
    },

    /// Show broker status
    Status,

    /// Stop the broker daemon
    Stop,

    /// [Internal] Run in broker mode - spawned automatically
    #[command(hide = true)]
    Broker,
}

/// Which signal broker a run talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BrokerKind {
    /// Shared broker daemon on the local socket, spawned when needed
    Local,
    /// In-process broker private to this run
    Memory,
}

#[derive(Args)]
pub struct RunArgs {
    /// Suite YAML file
    pub suite: PathBuf,

    /// Vehicle function spec (default: the suite's `system_spec`)
    #[arg(long)]
    pub spec: Option<PathBuf>,

    /// Signal broker to use (default from config)
    #[arg(long, value_enum)]
    pub broker: Option<BrokerKind>,

    /// Start the process under test; its stdout/stderr feed the state tracker.
    /// Arguments run until a lone `;`, e.g. --process ./hvac_service --config hvac.toml ';'
    #[arg(long, num_args = 1.., allow_hyphen_values = true, value_terminator = ";")]
    pub process: Option<Vec<String>>,

    /// Tail a log file of the system under test
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Follow `docker logs` of a container; can be given multiple times
    #[arg(long)]
    pub container: Vec<String>,

    /// Report format
    #[arg(long, value_enum, default_value_t = ReportFormat::Console)]
    pub format: ReportFormat,

    /// Write the report to this file instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Stop after the first failing test case
    #[arg(long)]
    pub stop_on_failure: bool,

    /// Only run test cases whose name contains this text (case-insensitive)
    #[arg(long)]
    pub filter: Option<String>,

    /// Only run test cases with one of these tags; can be given multiple times
    #[arg(long = "tag", short = 't')]
    pub tags: Vec<String>,

    /// Also write logs to <DIR>/<suite>.log
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Do not echo captured target output
    #[arg(long)]
    pub no_target_logs: bool,

    /// Debug logging
    #[arg(long, short)]
    pub verbose: bool,

    /// Timeout for steps that do not set one, in seconds (default from config)
    #[arg(long, value_parser = parse_seconds)]
    pub step_timeout: Option<Duration>,
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|_| format!("'{s}' is not a number of seconds"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("'{s}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(subcommand)]
        command: Commands,
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from([
            "sdv-test",
            "run",
            "suite.yaml",
            "--broker",
            "memory",
            "--process",
            "./hvac",
            "--verbose-mode",
            ";",
            "--tag",
            "smoke",
            "-t",
            "hvac",
            "--format",
            "junit",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.broker, Some(BrokerKind::Memory));
        assert_eq!(
            args.process,
            Some(vec!["./hvac".to_string(), "--verbose-mode".to_string()])
        );
        assert_eq!(args.tags, vec!["smoke", "hvac"]);
        assert_eq!(args.format, ReportFormat::Junit);
    }

    #[test]
    fn test_step_timeout_bounds() {
        let parse = |value: &str| {
            Cli::try_parse_from(["sdv-test", "run", "s.yaml", "--step-timeout", value])
        };

        let Commands::Run(args) = parse("2.5").unwrap().command else {
            panic!("expected run");
        };
        assert_eq!(args.step_timeout, Some(Duration::from_millis(2500)));

        for bad in ["1e30", "-1", "inf", "soon"] {
            assert!(parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_broker_is_hidden_but_parses() {
        let cli = Cli::try_parse_from(["sdv-test", "broker"]).unwrap();
        assert!(matches!(cli.command, Commands::Broker));
    }
}
