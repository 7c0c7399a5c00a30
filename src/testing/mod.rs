//! Behavioural test execution
//!
//! Suites are parsed from YAML into canonical steps ([`suite`]), executed
//! against a signal client and the state tracker ([`runner`]) inside an
//! [`Environment`] that owns the process under test and its log sources.

mod environment;
mod fixtures;
mod model;
mod runner;
mod suite;

pub use environment::{Environment, EnvironmentConfig};
pub use fixtures::RunningFixture;
pub use model::*;
pub use runner::{RunOptions, TestRunner};
