use anyhow::Result;
use taskchain::cli::{Args, DemoConfig, ExecutionMode, SimulateConfig, print_report, run_simulation};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let default_filter = if args.verbose() {
        "taskchain=debug"
    } else {
        "taskchain=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match mode {
        ExecutionMode::Simulate(config) => run_simulate_mode(config).await,
        ExecutionMode::ShowConfig { config_path } => {
            let config = DemoConfig::load(config_path.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_simulate_mode(options: SimulateConfig) -> Result<()> {
    let mut config = DemoConfig::load(options.config_path.as_deref())?;
    config.apply_overrides(&options);

    info!(
        "Simulating {} rows with {} workers",
        config.simulation.rows, config.scheduler.max_concurrent_tasks
    );
    let report = run_simulation(&config).await?;
    print_report(&report, options.json)
}
