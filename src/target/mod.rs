//! Log sources of the system under test
//!
//! Everything here ends in a [`LogPump`](crate::tracker::LogPump) feeding the
//! state tracker: the stdout/stderr of a spawned process, a followed
//! container log, or a tailed file.

mod logs;
mod process;

pub use logs::{follow_container, tail_file, LogCapture};
pub use process::TargetProcess;
