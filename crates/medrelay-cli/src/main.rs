use clap::{Parser, Subcommand};
use medrelay_cli::client::{DEFAULT_RELAY_URL, RelayClient};
use medrelay_cli::commands::{
    ChatCommand, DoctorsCommand, HealthCommand, ReferencesCommand, ReloadCommand,
};
use medrelay_cli::error::CliResult;
use medrelay_cli::output::OutputFormat;

#[derive(Parser)]
#[command(name = "medrelay-cli")]
#[command(about = "Medrelay CLI - Client for the medrelay streaming chat relay")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(
        long,
        global = true,
        default_value = DEFAULT_RELAY_URL,
        help = "Base URL of the relay"
    )]
    pub url: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Send a message and stream the answer")]
    Chat(ChatCommand),

    #[clap(about = "Fetch the references cached for a conversation")]
    References(ReferencesCommand),

    #[clap(about = "List the configured doctor profiles")]
    Doctors(DoctorsCommand),

    #[clap(about = "Ask the relay to reload its configuration")]
    Reload(ReloadCommand),

    #[clap(about = "Check that the relay is up")]
    Health(HealthCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let client = RelayClient::new(&cli.url);

    match &cli.command {
        Command::Chat(cmd) => cmd.execute(&client, format).await,
        Command::References(cmd) => cmd.execute(&client, format).await,
        Command::Doctors(cmd) => cmd.execute(&client, format).await,
        Command::Reload(cmd) => cmd.execute(&client, format).await,
        Command::Health(cmd) => cmd.execute(&client, format).await,
    }
}
