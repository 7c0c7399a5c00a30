//! sdv-test - behavioural test runner for vehicle software
//!
//! Three parts carry the verdicts: the [`tracker`] reconstructs state
//! machines from log lines, the [`expr`] evaluator checks signal values
//! against conditions, and the [`testing`] engine executes suite steps
//! against a [`signal::SignalClient`].

pub mod broker;
pub mod cli;
pub mod commands;
pub mod common;
pub mod expr;
pub mod report;
pub mod signal;
pub mod target;
pub mod testing;
pub mod tracker;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use expr::{Evaluator, Value};
pub use tracker::StateTracker;
