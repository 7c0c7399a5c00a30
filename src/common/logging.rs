//! Logging and tracing configuration
//!
//! The CLI logs to stderr, optionally mirrored into a per-suite file.
//! The broker daemon logs to a file since it runs in the background.
//! Output captured from the target under test is emitted under the
//! `sdv_test::target` tracing target so it can be filtered separately.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use super::paths;

/// Tracing target for lines captured from the process or container under test
pub const TARGET_LOG: &str = "sdv_test::target";

/// Initialize tracing for the CLI
///
/// Logs are controlled by the `RUST_LOG` environment variable. Default level
/// is INFO for this crate (DEBUG with `verbose`), WARN for dependencies.
/// With `log_file`, a plain-text copy of everything is written there; keep
/// the returned guard alive until the run ends so the file gets flushed.
pub fn init_cli(verbose: bool, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let directive = if verbose {
        "sdv_test=debug,info"
    } else {
        "sdv_test=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let (file_layer, guard) = match log_file.and_then(open_appender) {
        Some((writer, guard)) => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn open_appender(path: &Path) -> Option<(NonBlocking, WorkerGuard)> {
    let dir = path.parent().filter(|d| !d.as_os_str().is_empty())?;
    let file_name = path.file_name()?;

    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("Warning: Could not create log directory {}: {}", dir.display(), e);
        return None;
    }

    let appender = tracing_appender::rolling::never(dir, file_name);
    Some(tracing_appender::non_blocking(appender))
}

/// Log file name for a suite: spaces become underscores
pub fn suite_log_file(log_dir: &Path, suite_name: &str) -> PathBuf {
    let stem: String = suite_name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    log_dir.join(format!("{stem}.log"))
}

/// Initialize tracing for the broker daemon (file + stderr logging)
///
/// The daemon logs to both:
/// 1. A log file at `<data dir>/sdv-test/logs/broker.log`
/// 2. stderr (inherited from the spawning process for early errors)
pub fn init_broker() -> Option<PathBuf> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sdv_test=debug,info"));

    let log_path = broker_log_path().and_then(|log_file| {
        let dir = log_file.parent()?;
        std::fs::create_dir_all(dir).ok()?;
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
        {
            Ok(file) => Some((log_file, file)),
            Err(e) => {
                eprintln!("Warning: Could not open log file: {}", e);
                None
            }
        }
    });

    let (path, file) = log_path.unzip();
    broker_subscriber(filter, file).init();
    path
}

/// Broker subscriber stack: full details to `file` when there is one, compact stderr always
fn broker_subscriber(
    filter: EnvFilter,
    file: Option<std::fs::File>,
) -> impl tracing::Subscriber + Send + Sync {
    let file_layer = file.map(|file| {
        fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
    });

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
}

/// Get the path to the broker log file
pub fn broker_log_path() -> Option<PathBuf> {
    paths::log_dir().map(|d| d.join("broker.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_log_file_name() {
        let path = suite_log_file(Path::new("/tmp/logs"), "Climate Control: smoke");
        assert_eq!(path, Path::new("/tmp/logs/Climate_Control__smoke.log"));
    }

    #[test]
    fn test_broker_subscriber_writes_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let handle = file.reopen().unwrap();

        let subscriber = broker_subscriber(EnvFilter::new("info"), Some(handle));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("broker listening");
        });

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.contains("broker listening"), "{content}");
    }

    #[test]
    fn test_broker_subscriber_without_file() {
        let subscriber = broker_subscriber(EnvFilter::new("info"), None);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("stderr only");
        });
    }
}
