//! Main entry point for the device safety copilot CLI.

use anyhow::Result;
use clap::Parser;
use device_safety_platform::{cli, registry::AgentRegistry, server, settings::Settings, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    // Load and validate settings
    let settings = Settings::load_from(args.config.as_deref())?;

    // Initialize telemetry
    telemetry::init(&settings.logging)?;

    // Execute the requested command
    match args.command {
        cli::Commands::Serve { addr } => server::serve(&settings, addr).await,
        cli::Commands::Ask { query, json } => cli::ask(&settings, &query, json).await,
        cli::Commands::Agents => {
            cli::print_agents(&AgentRegistry::with_defaults()?);
            Ok(())
        }
    }
}
