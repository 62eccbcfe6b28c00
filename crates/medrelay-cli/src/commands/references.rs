use clap::Parser;

use crate::client::RelayClient;
use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct ReferencesCommand {
    #[clap(help = "Conversation id the references were cached under")]
    pub conversation_id: String,
}

impl ReferencesCommand {
    pub async fn execute(&self, client: &RelayClient, format: OutputFormat) -> CliResult<()> {
        let response = client.references(&self.conversation_id).await?;

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&response)?);
            }
            OutputFormat::Table => {
                if response.references.is_empty() {
                    println!("No references cached for {}", response.conversation_id);
                } else {
                    println!("{}", response.references);
                }
            }
        }

        Ok(())
    }
}
