use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};

use crate::client::RelayClient;
use crate::error::CliResult;
use crate::output::{OutputFormat, truncate_string};

#[derive(Parser)]
pub struct DoctorsCommand {
    #[clap(long, help = "Show bot details for one doctor instead of listing all")]
    pub info: Option<String>,
}

impl DoctorsCommand {
    pub async fn execute(&self, client: &RelayClient, format: OutputFormat) -> CliResult<()> {
        if let Some(doctor) = &self.info {
            return Self::bot_info(client, doctor, format).await;
        }

        let doctors = client.doctors().await?;

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&doctors)?);
            }
            OutputFormat::Table => {
                if doctors.is_empty() {
                    println!("No doctors configured.");
                    return Ok(());
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["ID", "Name", "Specialty", "Description"]);

                for doctor in &doctors {
                    table.add_row([
                        doctor.id.as_str(),
                        doctor.name.as_str(),
                        doctor.specialty.as_str(),
                        &truncate_string(&doctor.description, 60),
                    ]);
                }

                println!("{table}");
                println!("\nTotal: {} doctors", doctors.len());
            }
        }

        Ok(())
    }

    async fn bot_info(client: &RelayClient, doctor: &str, format: OutputFormat) -> CliResult<()> {
        let info = client.bot_info(Some(doctor)).await?;

        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
            OutputFormat::Table => {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_header(["Field", "Value"]);
                for field in ["tenant", "bot_id", "base_url", "status"] {
                    table.add_row([field, info[field].as_str().unwrap_or("-")]);
                }
                println!("{table}");
            }
        }
        Ok(())
    }
}
