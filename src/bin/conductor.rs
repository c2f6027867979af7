//! Administrative entry point: init tracing, load config, run the
//! runtime until a shutdown signal arrives (spec.md §6).

use clap::Parser;
use conductor_core::{telemetry, Runtime, RuntimeConfig};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "conductor-core", version, about = "Durable bus, KV, and scheduler runtime")]
struct Args {
    /// Path to a TOML config file; env vars still override on top.
    #[arg(long, env = "CONDUCTOR_CONFIG")]
    config: Option<String>,
}

const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_DEPENDENCY_FAILURE: i32 = 3;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match RuntimeConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    telemetry::init_tracing(&config.logging.level, config.logging.json);
    info!(service = %config.service.name, version = %config.service.version, "starting conductor");

    let runtime = match Runtime::open(&config) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to open runtime dependencies");
            std::process::exit(EXIT_DEPENDENCY_FAILURE);
        }
    };

    if let Err(e) = run(&runtime).await {
        error!(error = %e, "fatal error while running");
        std::process::exit(EXIT_DEPENDENCY_FAILURE);
    }

    info!("conductor stopped cleanly");
}

/// Drive the runtime until a shutdown signal arrives. Kept separate from
/// `main` so the only path returning `anyhow::Result` is this one — the
/// two named configuration/dependency exit codes are decided in `main`
/// before this ever runs.
async fn run(runtime: &Runtime) -> anyhow::Result<()> {
    runtime.start();
    signal::ctrl_c().await?;
    info!("shutdown signal received");
    runtime.shutdown();
    Ok(())
}
