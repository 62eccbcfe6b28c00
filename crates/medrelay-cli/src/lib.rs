pub mod client;
pub mod commands;
pub mod error;
pub mod output;

pub use client::{RelayClient, StreamFrame};
pub use commands::{ChatCommand, DoctorsCommand, HealthCommand, ReferencesCommand, ReloadCommand};
pub use error::{CliError, CliResult};
pub use output::{OutputFormat, format_timestamp, truncate_string};
