//! Common utilities shared between the runner, the CLI and the broker daemon

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, Result};
