//! CLI command handling
//!
//! Runs suites in-process and forwards the signal commands to the broker
//! daemon, formatting their output.

mod spawn;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;

use crate::broker::BrokerClient;
use crate::commands::{BrokerKind, Commands, RunArgs};
use crate::common::config::Config;
use crate::common::{logging, paths, Error, Result};
use crate::expr::Value;
use crate::report::{self, ReportFormat};
use crate::signal::{ActuatorMode, MemoryBroker, SignalClient, VehicleSpec};
use crate::testing::{
    Environment, EnvironmentConfig, RunOptions, TestReport, TestRunner, TestSuite,
};
use crate::tracker::{LogBuffer, StateTracker};

pub use spawn::ensure_broker_running;

/// Dispatch a CLI command, returning the process exit code
pub async fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Run(args) => run(args).await,

        Commands::Broker => {
            // Handled in main so the broker gets its own logging
            Err(Error::Internal("broker mode must be started from main".to_string()))
        }

        Commands::Check { suite, spec } => check(&suite, spec.as_deref()),

        Commands::Replay { log, machine } => replay(&log, machine.as_deref()),

        Commands::Get { path, target } => {
            let client = connect_broker().await?;
            let value = client.get(&path, mode_flag(target)).await?;
            match value.timestamp {
                Some(ts) => println!(
                    "{} = {} {}",
                    value.path,
                    value.value,
                    format!("({})", ts.format("%H:%M:%S%.3f")).dimmed()
                ),
                None => println!("{} = {}", value.path, value.value),
            }
            Ok(0)
        }

        Commands::Set { path, value, target } => {
            let client = connect_broker().await?;
            let value = Value::parse_literal(&value);
            client.set(&path, value.clone(), mode_flag(target)).await?;
            if target {
                println!("{} = {} [target]", path, value);
            } else {
                println!("{} = {}", path, value);
            }
            Ok(0)
        }

        Commands::Status => {
            let socket = paths::socket_path();
            if !BrokerClient::ping(&socket).await {
                println!("Broker: not running");
                return Ok(0);
            }

            let client = connect_broker().await?;
            let status = client.status().await?;
            println!("Broker: running (pid {}, version {})", status.pid, status.version);
            println!("Socket: {}", socket.display());
            println!("Uptime: {}s", status.uptime_secs);
            println!(
                "Signals: {} current, {} target",
                status.current_signals, status.target_signals
            );
            println!("Clients: {}", status.clients);
            if let Some(log) = logging::broker_log_path() {
                println!("Log: {}", log.display());
            }
            Ok(0)
        }

        Commands::Stop => {
            let socket = paths::socket_path();
            if !BrokerClient::ping(&socket).await {
                println!("Broker is not running");
                return Ok(0);
            }
            let client = connect_broker().await?;
            client.shutdown().await?;
            println!("Broker stopped");
            Ok(0)
        }
    }
}

fn mode_flag(target: bool) -> Option<ActuatorMode> {
    target.then_some(ActuatorMode::Target)
}

async fn connect_broker() -> Result<BrokerClient> {
    let client = BrokerClient::new(paths::socket_path());
    client.connect().await?;
    Ok(client)
}

/// Load a suite, run it and emit the report
///
/// Logging is initialized here because the log file is named after the suite.
pub async fn run(args: RunArgs) -> Result<i32> {
    let config = Config::load()?;
    let step_timeout = args
        .step_timeout
        .unwrap_or_else(|| config.timeouts.step_default());
    let suite = TestSuite::load_with_timeout(&args.suite, step_timeout)?;

    let log_file = args
        .log_dir
        .as_deref()
        .map(|dir| logging::suite_log_file(dir, &suite.name));
    let _guard = logging::init_cli(args.verbose, log_file.as_deref());

    let spec = match args.spec.as_ref().or(suite.system_spec.as_ref()) {
        Some(path) => {
            let spec = VehicleSpec::load(path)?;
            tracing::info!(
                "Loaded vehicle spec {} ({} signals, {} requirements)",
                path.display(),
                spec.signals.len(),
                spec.requirements.len()
            );
            Some(Arc::new(spec))
        }
        None => None,
    };

    let broker = match args.broker {
        Some(kind) => kind,
        None if config.defaults.broker.eq_ignore_ascii_case("memory") => BrokerKind::Memory,
        None => BrokerKind::Local,
    };
    let client: Arc<dyn SignalClient> = match broker {
        BrokerKind::Memory => Arc::new(MemoryBroker::new()),
        BrokerKind::Local => {
            let socket = paths::socket_path();
            if let Err(e) = ensure_broker_running(&socket).await {
                let report =
                    TestReport::aborted(&suite.name, format!("Signal broker unavailable: {e}"));
                emit(&report, args.format, args.output.as_deref(), spec.as_deref())?;
                return Ok(report::exit_code(&report));
            }
            Arc::new(BrokerClient::with_subscribe_poll(
                socket,
                Duration::from_millis(config.broker.subscribe_poll_ms),
            ))
        }
    };

    let tracker = StateTracker::new().with_poll_interval(config.timeouts.poll_interval());
    let buffer = LogBuffer::new(config.logs.max_lines, config.logs.max_bytes());
    let env_config = EnvironmentConfig {
        process: args.process,
        log_file: args.log_file,
        containers: args.container,
        echo: !args.no_target_logs,
        ..EnvironmentConfig::from_config(&config)
    };
    let has_logs = env_config.has_log_source();

    let env = match Environment::start(
        client.clone(),
        &tracker,
        Some(&buffer),
        env_config,
        &suite.fixtures,
    )
    .await
    {
        Ok(env) => env,
        Err(e) => {
            tracing::error!("Failed to start test environment: {}", e);
            let report =
                TestReport::aborted(&suite.name, format!("Failed to start test environment: {e}"));
            emit(&report, args.format, args.output.as_deref(), spec.as_deref())?;
            return Ok(report::exit_code(&report));
        }
    };

    let options = RunOptions {
        stop_on_failure: args.stop_on_failure,
        filter: args.filter,
        tags: args.tags,
        ..RunOptions::from_config(&config)
    };
    let mut runner = TestRunner::new(client, tracker).with_options(options);
    if has_logs {
        runner = runner.with_log_buffer(buffer);
    }
    if let Some(spec) = &spec {
        runner = runner.with_spec(spec.clone());
    }

    let report = runner.run_suite(&suite).await;
    env.shutdown().await;

    emit(&report, args.format, args.output.as_deref(), spec.as_deref())?;
    Ok(report::exit_code(&report))
}

fn emit(
    report: &TestReport,
    format: ReportFormat,
    output: Option<&Path>,
    spec: Option<&VehicleSpec>,
) -> Result<()> {
    let rendered = report::render(report, format, spec)?;
    match output {
        Some(path) => {
            report::write_output(path, &rendered)?;
            // Keep a human summary on the terminal when the report goes to a file
            if format != ReportFormat::Console {
                print!("{}", report::render(report, ReportFormat::Console, spec)?);
            }
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

/// Parse a suite, validate it against its spec and list its cases
fn check(suite_path: &Path, spec_path: Option<&Path>) -> Result<i32> {
    let suite = TestSuite::load(suite_path)?;

    let spec_path: Option<PathBuf> = spec_path
        .map(Path::to_path_buf)
        .or_else(|| suite.system_spec.clone());
    let spec = spec_path.as_deref().map(VehicleSpec::load).transpose()?;

    println!("{} {}", "Suite:".blue().bold(), suite.name.white().bold());
    if let Some(path) = &spec_path {
        println!("  Spec: {}", path.display().to_string().dimmed());
    }
    if !suite.fixtures.is_empty() {
        println!("  Fixtures: {}", suite.fixtures.len());
    }
    if !suite.setup.is_empty() || !suite.teardown.is_empty() {
        println!(
            "  Suite setup/teardown: {}/{} step(s)",
            suite.setup.len(),
            suite.teardown.len()
        );
    }

    println!("\n{}", "Test cases:".cyan());
    for case in &suite.test_cases {
        let verifications = case
            .steps
            .iter()
            .filter(|s| s.kind.is_critical())
            .count();
        println!(
            "  {} {} {}",
            "•".dimmed(),
            case.name,
            format!(
                "({} step(s), {} verification(s))",
                case.steps.len(),
                verifications
            )
            .dimmed()
        );
        if !case.requirements.is_empty() {
            println!("      requirements: {}", case.requirements.join(", "));
        }
        if !case.tags.is_empty() {
            println!("      tags: {}", case.tags.join(", "));
        }
    }

    let mut warnings = spec.as_ref().map(|s| suite.lint(s)).unwrap_or_default();
    if let Some(spec) = &spec {
        for case in &suite.test_cases {
            for req in &case.requirements {
                if spec.requirement(req).is_none() {
                    warnings.push(format!(
                        "test case '{}': requirement {} not declared in spec",
                        case.name, req
                    ));
                }
            }
        }
    }

    if warnings.is_empty() {
        println!("\n{} Suite is valid", "✓".green());
        Ok(0)
    } else {
        println!();
        for warning in &warnings {
            println!("{} {}", "warning:".yellow(), warning);
        }
        println!("\n{} {} warning(s)", "✗".red(), warnings.len());
        Ok(1)
    }
}

/// Feed a log file through the state tracker and print the result
fn replay(log: &Path, machine: Option<&str>) -> Result<i32> {
    let content = std::fs::read_to_string(log).map_err(|e| Error::file_read(log, e))?;
    let tracker = StateTracker::new();

    let mut events = 0usize;
    for line in content.lines() {
        if tracker.process_line(line, None).is_some() {
            events += 1;
        }
    }

    println!(
        "{} {} ({} line(s), {} event(s))",
        "Replayed".blue().bold(),
        log.display(),
        content.lines().count(),
        events
    );

    println!("\n{}", "States:".cyan());
    let states = tracker.all_states();
    let shown: Vec<_> = states
        .iter()
        .filter(|(name, _)| machine.map_or(true, |m| m == name.as_str()))
        .collect();
    if shown.is_empty() {
        println!("  (none)");
    }
    for (name, state) in shown {
        println!("  {} = {}", name, state.green());
    }

    println!("\n{}", "Transitions:".cyan());
    let transitions = tracker.transitions(machine);
    if transitions.is_empty() {
        println!("  (none)");
    }
    for event in &transitions {
        println!(
            "  {} {}",
            event.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
            event
        );
    }

    let blocked = tracker.blocked_events(machine);
    if !blocked.is_empty() {
        println!("\n{}", "Blocked events:".yellow());
        for event in &blocked {
            println!(
                "  {} {}",
                event.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
                event
            );
        }
    }
    Ok(0)
}

