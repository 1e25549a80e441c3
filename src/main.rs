mod args;
mod commands;

use anyhow::Context;
use args::{Cli, Commands};
use clap::Parser;
use worker_bridge::{logging, BridgeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = logging::bootstrap(|| match &cli.config {
        Some(path) => BridgeConfig::load_from(path),
        None => BridgeConfig::load(),
    })
    .context("Failed to load bridge configuration")?;

    logging::init(&config.logging);

    let status = match cli.command {
        Commands::Call {
            worker,
            action,
            data,
            timeout_ms,
        } => commands::call::cmd_call(&config, worker, &action, data, timeout_ms).await?,
        Commands::List { domain } => commands::domain::cmd_list(&config, domain).await?,
        Commands::Ensure { domain, id } => {
            commands::domain::cmd_ensure(&config, domain, &id).await?
        }
        Commands::Status { probe, lines } => {
            commands::status::cmd_status(&config, probe, lines).await?
        }
        Commands::Config => commands::config::cmd_config(&config, cli.config.as_deref())?,
    };

    if !status.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
