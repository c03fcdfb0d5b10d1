//! ChatRelay - streaming chat delivery pipeline
//!
//! Clients hold a WebSocket to the connection hub. Their turns travel over
//! a partitioned message bus to the generation orchestrator, which streams
//! the reply back chunk by chunk while a write-behind session buffer keeps
//! recent context and is periodically flushed into durable storage.
//!
//! # Architecture
//!
//! - `hub`: WebSocket endpoint, session → connection registry, reply routing
//! - `bus`: topic contract, Kafka and in-process implementations, payloads
//! - `orchestrator`: one generation turn per `user_query` message
//! - `buffer`: per-session ephemeral state (summary + recent messages)
//! - `synchronizer`: `db_ops` flush / delete protocol
//! - `store`: durable chat log, memories and file records
//! - `vectorization`: `vectorize_file` worker
//! - `providers` / `services`: generation, vector search and vectorizer clients
//! - `app`: process root wiring the components together
//!
//! # Example
//!
//! ```no_run
//! use chatrelay::app::Pipeline;
//! use chatrelay::cli::Cli;
//! use chatrelay::Config;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/chatrelay.yaml", &Cli::default())?;
//!     config.validate()?;
//!
//!     Pipeline::open(config)?.run(&[], CancellationToken::new()).await
//! }
//! ```

pub mod app;
pub mod buffer;
pub mod bus;
pub mod cli;
pub mod config;
pub mod error;
pub mod hub;
pub mod logging;
pub mod orchestrator;
pub mod providers;
pub mod services;
pub mod session;
pub mod store;
pub mod synchronizer;
pub mod vectorization;

// Re-export commonly used types
pub use config::Config;
pub use error::{ChatRelayError, Result};
pub use session::{Message, Role, SessionKey};

#[cfg(test)]
pub mod test_utils;
