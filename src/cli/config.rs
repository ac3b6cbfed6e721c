//! Configuration loading for the simulation
//!
//! Values come from built-in defaults, optionally replaced by a TOML file,
//! and finally overridden by command line flags.

use super::args::SimulateConfig;
use crate::task::SchedulerConfig;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DemoConfig {
    pub scheduler: SchedulerConfig,
    pub simulation: SimulationConfig,
}

/// Shape of the simulated list and its data source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    pub rows: usize,
    /// Rows cancelled while their chains are still in flight
    pub scroll_away: usize,
    /// Rows requested a second time while loading, superseding the first chain
    pub rerequests: usize,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            rows: 20,
            scroll_away: 5,
            rerequests: 3,
            min_latency_ms: 5,
            max_latency_ms: 40,
        }
    }
}

impl DemoConfig {
    /// Load from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DemoConfig =
            toml::from_str(content).context("Failed to parse TOML configuration")?;
        Ok(config)
    }

    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Defaults, or the given file if there is one
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_toml_file(path),
            None => {
                debug!("No configuration file given, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Apply command line overrides on top of the loaded values
    pub fn apply_overrides(&mut self, overrides: &SimulateConfig) {
        if let Some(rows) = overrides.rows {
            self.simulation.rows = rows;
        }
        if let Some(workers) = overrides.workers {
            self.scheduler.max_concurrent_tasks = workers;
        }
        if let Some(scroll_away) = overrides.scroll_away {
            self.simulation.scroll_away = scroll_away;
        }
        if let Some(rerequests) = overrides.rerequests {
            self.simulation.rerequests = rerequests;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        let sim = &self.simulation;
        if sim.rows == 0 {
            bail!("simulation.rows must be at least 1");
        }
        if sim.min_latency_ms > sim.max_latency_ms {
            bail!(
                "simulation.min_latency_ms ({}) exceeds max_latency_ms ({})",
                sim.min_latency_ms,
                sim.max_latency_ms
            );
        }
        if sim.scroll_away > sim.rows || sim.rerequests > sim.rows {
            bail!(
                "simulation.scroll_away and simulation.rerequests cannot exceed rows ({})",
                sim.rows
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DemoConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.max_concurrent_tasks, 4);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DemoConfig::from_toml_str(
            r#"
[scheduler]
max_concurrent_tasks = 2
"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.max_concurrent_tasks, 2);
        assert_eq!(config.simulation, SimulationConfig::default());
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let mut config = DemoConfig::default();
        config.apply_overrides(&SimulateConfig {
            rows: Some(100),
            workers: Some(8),
            ..Default::default()
        });

        assert_eq!(config.simulation.rows, 100);
        assert_eq!(config.scheduler.max_concurrent_tasks, 8);
        assert_eq!(config.simulation.scroll_away, 5);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = DemoConfig::default();
        config.scheduler.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());

        let mut config = DemoConfig::default();
        config.simulation.min_latency_ms = 50;
        config.simulation.max_latency_ms = 10;
        assert!(config.validate().is_err());

        let mut config = DemoConfig::default();
        config.simulation.scroll_away = config.simulation.rows + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_toml_reports_error() {
        let result = DemoConfig::from_toml_str("scheduler = 3");
        assert!(result.is_err());
    }
}
