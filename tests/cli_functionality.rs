//! Integration tests for CLI functionality
//!
//! These tests drive the simulation the way the binary does: parse
//! arguments, load a config file, apply overrides and run.

use clap::Parser;
use std::fs;
use taskchain::cli::{Args, DemoConfig, ExecutionMode, run_simulation};
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simulate_from_config_file_with_overrides() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("demo.toml");
    fs::write(
        &config_path,
        "[scheduler]\n\
         max_concurrent_tasks = 8\n\
         \n\
         [simulation]\n\
         rows = 16\n\
         scroll_away = 4\n\
         rerequests = 4\n\
         min_latency_ms = 1\n\
         max_latency_ms = 4\n",
    )
    .unwrap();

    let args = Args::parse_from([
        "taskchain",
        "simulate",
        "--config",
        config_path.to_str().unwrap(),
        "--workers",
        "2",
        "--json",
    ]);
    let ExecutionMode::Simulate(options) = args.mode().unwrap() else {
        panic!("Expected Simulate mode");
    };

    let mut config = DemoConfig::load(options.config_path.as_deref()).unwrap();
    config.apply_overrides(&options);
    let report = run_simulation(&config).await.unwrap();

    assert_eq!(report.workers, 2);
    assert_eq!(report.rows, 16);
    assert_eq!(report.rows_loaded, 16);
    assert_eq!(report.stale_deliveries, 0);
    assert!(report.stats.peak_executing <= 2);
    assert!(report.cache_hits > 0, "scrolling back should hit the cache");

    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"stale_deliveries\":0"));
}

#[tokio::test]
async fn test_simulate_rejects_invalid_config() {
    let mut config = DemoConfig::default();
    config.simulation.rows = 0;

    let result = run_simulation(&config).await;

    assert!(result.is_err());
}

#[test]
fn test_show_config_prints_loadable_toml() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("shown.toml");

    let shown = DemoConfig::default().to_toml_string().unwrap();
    fs::write(&config_path, &shown).unwrap();

    let args = Args::parse_from(["taskchain", "show-config", "-c", config_path.to_str().unwrap()]);
    let ExecutionMode::ShowConfig { config_path } = args.mode().unwrap() else {
        panic!("Expected ShowConfig mode");
    };
    let loaded = DemoConfig::load(config_path.as_deref()).unwrap();
    assert_eq!(loaded, DemoConfig::default());
}
