// rsmp-site: connects to the configured supervisors and serves the component
// model described in the config file.

use std::path::PathBuf;

use clap::Parser;
use site::Site;
use site::config::load_config_from_path;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "rsmp-site", version, about = "RSMP site")]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "/etc/rsmp/site.toml")]
    config: PathBuf,
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
    info!(version = env!("CARGO_PKG_VERSION"), "site starting");

    let config = match load_config_from_path(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %args.config.display(), "failed to load config");
            std::process::exit(1);
        }
    };

    let site = Site::new(config);
    site.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown requested");
    site.shutdown().await;
}
