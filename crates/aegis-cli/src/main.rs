use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod simulate;

use simulate::SimulateArgs;

#[derive(Parser)]
#[command(name = "aegis")]
#[command(about = "Hybrid BFT consensus engine operator tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process cluster and print a JSON summary
    Simulate(SimulateArgs),

    /// Print the default engine configuration as JSON
    DefaultConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate(args) => {
            info!("Simulating {} nodes with {} proposals", args.nodes, args.proposals);
            let report = simulate::run(args).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::DefaultConfig => {
            let config = aegis_consensus::ConsensusConfig::default();
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
