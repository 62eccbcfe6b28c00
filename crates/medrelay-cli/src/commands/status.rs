use chrono::{DateTime, Utc};
use clap::Parser;

use crate::client::RelayClient;
use crate::error::CliResult;
use crate::output::{OutputFormat, format_timestamp};

#[derive(Parser)]
pub struct HealthCommand {}

impl HealthCommand {
    pub async fn execute(&self, client: &RelayClient, format: OutputFormat) -> CliResult<()> {
        let health = client.health().await?;

        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&health)?),
            OutputFormat::Table => {
                let checked_at = health["timestamp"]
                    .as_str()
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| format_timestamp(&t.with_timezone(&Utc)))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "Relay is {} (version {}, checked {})",
                    health["status"].as_str().unwrap_or("unknown"),
                    health["version"].as_str().unwrap_or("-"),
                    checked_at
                );
            }
        }
        Ok(())
    }
}

#[derive(Parser)]
pub struct ReloadCommand {}

impl ReloadCommand {
    pub async fn execute(&self, client: &RelayClient, format: OutputFormat) -> CliResult<()> {
        let message = client.reload().await?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({"success": true, "message": message});
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => println!("{message}"),
        }
        Ok(())
    }
}
