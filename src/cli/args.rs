//! Command line argument parsing
//!
//! Subcommands:
//! - `simulate`: Run the row-loading simulation
//! - `show-config`: Print the effective configuration as TOML

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug)]
pub enum ExecutionMode {
    Simulate(SimulateConfig),
    ShowConfig { config_path: Option<PathBuf> },
}

/// Simulation options as given on the command line; `None` keeps the
/// value from the configuration file
#[derive(Debug, Clone, Default)]
pub struct SimulateConfig {
    pub config_path: Option<PathBuf>,
    pub rows: Option<usize>,
    pub workers: Option<usize>,
    pub scroll_away: Option<usize>,
    pub rerequests: Option<usize>,
    pub json: bool,
}

#[derive(Debug, Parser)]
#[command(name = "taskchain")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dependency-aware task scheduling with a keyed result cache")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Simulate a list view loading rows through fetch -> transform chains
    Simulate {
        /// Number of rows in the list
        #[arg(short = 'r', long = "rows")]
        rows: Option<usize>,
        /// Maximum number of concurrently executing tasks
        #[arg(short = 'w', long = "workers")]
        workers: Option<usize>,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Rows scrolled off-screen while loading
        #[arg(long = "scroll-away")]
        scroll_away: Option<usize>,
        /// Rows requested again while still loading
        #[arg(long = "rerequests")]
        rerequests: Option<usize>,
        /// Print the summary as JSON
        #[arg(long = "json")]
        json: bool,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// Show the effective configuration
    ShowConfig {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Simulate {
                rows,
                workers,
                config,
                scroll_away,
                rerequests,
                json,
                ..
            }) => Ok(ExecutionMode::Simulate(SimulateConfig {
                config_path: config.clone(),
                rows: *rows,
                workers: *workers,
                scroll_away: *scroll_away,
                rerequests: *rerequests,
                json: *json,
            })),
            Some(Commands::ShowConfig { config }) => Ok(ExecutionMode::ShowConfig {
                config_path: config.clone(),
            }),
            None => Err(
                "No command specified. Use 'taskchain --help' to see available commands."
                    .to_string(),
            ),
        }
    }

    /// Whether debug logging was requested
    pub fn verbose(&self) -> bool {
        matches!(self.command, Some(Commands::Simulate { verbose: true, .. }))
    }
}
