//! ChatRelay - streaming chat delivery pipeline
//!
#![doc = "ChatRelay - streaming chat delivery pipeline"]
#![doc = "Main entry point for the chatrelay binary."]

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use chatrelay::app::{self, Pipeline};
use chatrelay::cli::{Cli, Commands};
use chatrelay::config::Config;
use chatrelay::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/chatrelay.yaml");
    let config = Config::load(config_path, &cli)?;
    config.validate()?;

    init_logging(&config.logging)?;
    tracing::debug!("Loaded configuration from {}", config_path);

    match cli.command {
        Commands::Serve { components } => {
            let shutdown = CancellationToken::new();
            app::cancel_on_ctrl_c(shutdown.clone());

            tracing::info!(
                bus = ?config.bus.backend,
                "Starting chatrelay {}",
                env!("CARGO_PKG_VERSION")
            );
            Pipeline::open(config)?.run(&components, shutdown).await
        }
        Commands::CheckConfig => {
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}
