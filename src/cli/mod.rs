//! CLI-specific functionality for the row-loading simulation
//!
//! This module contains argument parsing, configuration loading and the
//! simulation driver used by the `taskchain` binary.

pub mod args;
pub mod config;
pub mod demo;

pub use args::{Args, ExecutionMode, SimulateConfig};
pub use config::{DemoConfig, SimulationConfig};
pub use demo::{SimulationReport, print_report, run_simulation};
