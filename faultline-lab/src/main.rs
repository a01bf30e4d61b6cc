use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod output;

/// Exercise faultline policies against a simulated flaky dependency.
#[derive(Debug, Parser)]
#[command(name = "faultline-lab", version, about)]
struct Cli {
    /// Write logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run calls through the executor and summarize the outcome
    Simulate(commands::simulate::SimulateArgs),

    /// Print the metadata a command resolves to
    InspectConfig(commands::inspect::InspectArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON reports on stdout stay parseable
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "faultline=info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(
            cli.json_logs
                .then(|| fmt::layer().json().with_writer(std::io::stderr)),
        )
        .with((!cli.json_logs).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();

    match cli.command {
        Command::Simulate(args) => commands::simulate::execute(args).await,
        Command::InspectConfig(args) => commands::inspect::execute(args),
    }
}
