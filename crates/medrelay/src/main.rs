//! Medrelay daemon - streaming chat relay for the medical consultation frontend

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use medrelay_server::config::Config;
use medrelay_server::error::Result;
use medrelay_server::server::RelayServer;

/// Medrelay - streaming relay between a Coze chat bot and browser clients
#[derive(Parser)]
#[command(name = "medrelay")]
#[command(about = "Streaming relay between a Coze chat bot and browser clients")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Override the listen address from the config file
    #[arg(long, short = 'l', global = true)]
    pub listen: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the relay server (default command)
    #[command(name = "serve")]
    Serve,

    /// Parse the configuration and report the tenants it defines
    #[command(name = "check-config")]
    CheckConfig,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let (mut config, config_path) = load_config(cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }

    match cli.command {
        None | Some(Command::Serve) => serve(config, config_path).await,
        Some(Command::CheckConfig) => check_config(&config),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,medrelay_server=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(config_path: Option<PathBuf>) -> Result<(Config, Option<PathBuf>)> {
    match config_path {
        Some(path) => {
            tracing::info!("Loading config from: {}", path.display());
            Ok((Config::load(&path)?, Some(path)))
        }
        None => Config::discover(),
    }
}

fn check_config(config: &Config) -> Result<()> {
    let registry = medrelay_server::registry::TenantRegistry::new(
        config.default_tenant.clone(),
        config.tenants.clone(),
    );

    let mut failures = 0;
    for summary in registry.summaries() {
        match registry.resolve(Some(&summary.id)) {
            Ok(client) => println!(
                "ok      {:<12} bot {} at {}",
                summary.id,
                client.settings().bot_id,
                client.settings().base_url
            ),
            Err(e) => {
                failures += 1;
                println!("invalid {:<12} {e}", summary.id);
            }
        }
    }

    if failures > 0 {
        return Err(medrelay_server::RelayError::Config(format!(
            "{failures} tenant(s) failed validation"
        )));
    }
    Ok(())
}

async fn serve(config: Config, config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting medrelay daemon");
    tracing::debug!(
        "Server config: {:?}, references: {:?}",
        config.server,
        config.references
    );

    if config.tenants.is_empty() {
        tracing::warn!("No tenants configured; every chat request will fail until a config is loaded");
    } else if !config.tenants.contains_key(&config.default_tenant) {
        tracing::warn!(
            "Default tenant '{}' is not configured; requests must name a tenant",
            config.default_tenant
        );
    }

    RelayServer::new(config, config_path).serve().await?;

    tracing::info!("Medrelay daemon stopped");
    Ok(())
}
