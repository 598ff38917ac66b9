//! `relaygate` binary entrypoint.

use std::path::PathBuf;

use clap::Parser;
use relaygate::{serve, telemetry, GatewayConfig};

#[derive(Parser)]
#[command(name = "relaygate")]
#[command(about = "Claude Messages gateway for OpenAI-compatible upstreams")]
struct Cli {
    /// YAML config with users, credentials and proxy routes.
    #[arg(long, env = "RELAYGATE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => GatewayConfig::from_yaml_file(path)?,
        None => GatewayConfig::default(),
    };
    telemetry::init_subscriber(&config.telemetry);

    if config.users.is_empty() {
        tracing::warn!("no users configured, every request will be rejected");
    }
    serve(config).await
}
