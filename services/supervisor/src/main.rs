// rsmp-supervisor: accepts site connections on the configured address.

use std::path::PathBuf;

use clap::Parser;
use supervisor::Supervisor;
use supervisor::config::load_config_from_path;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "rsmp-supervisor", version, about = "RSMP supervisor")]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "/etc/rsmp/supervisor.toml")]
    config: PathBuf,
    /// Listen address, overriding `bind` from the config file.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "supervisor starting");

    let mut config = match load_config_from_path(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %args.config.display(), "failed to load config");
            std::process::exit(1);
        }
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let supervisor = Supervisor::new(config);
    if let Err(e) = supervisor.start().await {
        error!(error = %e, "failed to bind");
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown requested");
    supervisor.shutdown().await;
}
