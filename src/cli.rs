//! Command-line interface definition for ChatRelay
//!
//! This module defines the CLI structure using clap's derive API.

use clap::{Parser, Subcommand, ValueEnum};

/// ChatRelay - streaming chat delivery pipeline
///
/// Runs the connection hub, generation orchestrator, durable store
/// synchronizer and vectorization worker over a shared message bus.
#[derive(Parser, Debug, Clone)]
#[command(name = "chatrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/chatrelay.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for ChatRelay
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start pipeline components
    Serve {
        /// Components to run (repeatable); all components when omitted
        #[arg(long = "component", value_enum)]
        components: Vec<Component>,
    },

    /// Load, validate and print the effective configuration
    CheckConfig,
}

/// A pipeline component that `serve` can start
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    /// WebSocket connection hub and `server_reply` consumer
    Hub,
    /// `user_query` consumer driving generation
    Orchestrator,
    /// `db_ops` consumer merging the buffer into durable storage
    Synchronizer,
    /// `vectorize_file` consumer
    Vectorizer,
}

impl Component {
    /// Every component, in start-up order
    pub const ALL: [Component; 4] = [
        Component::Synchronizer,
        Component::Vectorizer,
        Component::Orchestrator,
        Component::Hub,
    ];

    /// Name used for consumer groups and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hub => "hub",
            Self::Orchestrator => "orchestrator",
            Self::Synchronizer => "synchronizer",
            Self::Vectorizer => "vectorizer",
        }
    }
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/chatrelay.yaml".to_string()),
            verbose: false,
            command: Commands::CheckConfig,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default() {
        let cli = Cli::default();
        assert_eq!(cli.config, Some("config/chatrelay.yaml".to_string()));
        assert!(!cli.verbose);
        assert!(matches!(cli.command, Commands::CheckConfig));
    }

    #[test]
    fn test_cli_parse_serve_without_components() {
        let cli = Cli::try_parse_from(["chatrelay", "serve"]).unwrap();
        if let Commands::Serve { components } = cli.command {
            assert!(components.is_empty());
        } else {
            panic!("Expected Serve command");
        }
    }

    #[test]
    fn test_cli_parse_serve_with_components() {
        let cli = Cli::try_parse_from([
            "chatrelay",
            "serve",
            "--component",
            "hub",
            "--component",
            "synchronizer",
        ])
        .unwrap();
        if let Commands::Serve { components } = cli.command {
            assert_eq!(components, vec![Component::Hub, Component::Synchronizer]);
        } else {
            panic!("Expected Serve command");
        }
    }

    #[test]
    fn test_cli_rejects_unknown_component() {
        let cli = Cli::try_parse_from(["chatrelay", "serve", "--component", "gateway"]);
        assert!(cli.is_err());
    }

    #[test]
    fn test_cli_parse_check_config_with_path() {
        let cli =
            Cli::try_parse_from(["chatrelay", "-c", "/etc/chatrelay.yaml", "-v", "check-config"])
                .unwrap();
        assert_eq!(cli.config, Some("/etc/chatrelay.yaml".to_string()));
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::CheckConfig));
    }

    #[test]
    fn test_component_names() {
        let names: Vec<&str> = Component::ALL.iter().map(|c| c.as_str()).collect();
        assert_eq!(names, vec!["synchronizer", "vectorizer", "orchestrator", "hub"]);
    }
}
