//! Configuration management for ChatRelay
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::bus::config::{KafkaSecurity, KafkaSettings};
use crate::error::{ChatRelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for ChatRelay
///
/// Every section is optional in the YAML file; missing fields take their
/// defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Message bus settings
    #[serde(default)]
    pub bus: BusConfig,
    /// Connection hub settings
    #[serde(default)]
    pub hub: HubConfig,
    /// Text generation service settings
    #[serde(default)]
    pub generation: GenerationConfig,
    /// Vector search service settings
    #[serde(default)]
    pub vector_search: VectorSearchConfig,
    /// File vectorization service settings
    #[serde(default)]
    pub vectorizer: VectorizerConfig,
    /// Generation orchestrator settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Storage locations
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which bus implementation to run on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// Kafka brokers via rdkafka
    #[default]
    Kafka,
    /// In-process partitioned bus (single process only)
    Memory,
}

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus implementation
    #[serde(default)]
    pub backend: BusBackend,

    /// Kafka broker addresses (comma-separated)
    #[serde(default = "default_brokers")]
    pub brokers: String,

    /// Prefix for consumer group ids
    #[serde(default = "default_group_prefix")]
    pub group_prefix: String,

    /// Broker security settings
    #[serde(default)]
    pub security: KafkaSecurity,

    /// Consumer session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Partitions per topic for the in-memory backend
    #[serde(default = "default_memory_partitions")]
    pub memory_partitions: usize,

    /// Delay before a held message is redelivered, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Topic names
    #[serde(default)]
    pub topics: TopicsConfig,
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_group_prefix() -> String {
    "chatrelay".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_memory_partitions() -> usize {
    8
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::default(),
            brokers: default_brokers(),
            group_prefix: default_group_prefix(),
            security: KafkaSecurity::default(),
            session_timeout_ms: default_session_timeout_ms(),
            memory_partitions: default_memory_partitions(),
            retry_backoff_ms: default_retry_backoff_ms(),
            topics: TopicsConfig::default(),
        }
    }
}

impl BusConfig {
    /// Kafka connection settings derived from this section
    pub fn kafka_settings(&self) -> KafkaSettings {
        let mut settings = KafkaSettings::new(&self.brokers, &self.group_prefix)
            .with_session_timeout(Duration::from_millis(self.session_timeout_ms))
            .with_retry_backoff(self.retry_backoff());
        settings.security = self.security.clone();
        settings
    }

    /// Delay before a held message is redelivered
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Names of the four pipeline topics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicsConfig {
    /// Inbound user turns
    #[serde(default = "default_user_query_topic")]
    pub user_query: String,
    /// Outbound reply and status events
    #[serde(default = "default_server_reply_topic")]
    pub server_reply: String,
    /// Flush and delete requests
    #[serde(default = "default_db_ops_topic")]
    pub db_ops: String,
    /// File vectorization tasks
    #[serde(default = "default_vectorize_file_topic")]
    pub vectorize_file: String,
}

fn default_user_query_topic() -> String {
    "user_query".to_string()
}

fn default_server_reply_topic() -> String {
    "server_reply".to_string()
}

fn default_db_ops_topic() -> String {
    "db_ops".to_string()
}

fn default_vectorize_file_topic() -> String {
    "vectorize_file".to_string()
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            user_query: default_user_query_topic(),
            server_reply: default_server_reply_topic(),
            db_ops: default_db_ops_topic(),
            vectorize_file: default_vectorize_file_topic(),
        }
    }
}

/// Connection hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Listen address for the WebSocket endpoint
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Capacity of each connection's outbound queue
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Time allowed to write one frame to the peer (seconds)
    #[serde(default = "default_write_wait_secs")]
    pub write_wait_secs: u64,

    /// Time allowed between frames from the peer (seconds)
    #[serde(default = "default_pong_wait_secs")]
    pub pong_wait_secs: u64,

    /// Ping interval (seconds); must be shorter than the pong wait
    #[serde(default = "default_ping_period_secs")]
    pub ping_period_secs: u64,

    /// Maximum inbound message size in bytes
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8082".to_string()
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_write_wait_secs() -> u64 {
    10
}

fn default_pong_wait_secs() -> u64 {
    60
}

fn default_ping_period_secs() -> u64 {
    default_pong_wait_secs() * 9 / 10
}

fn default_max_message_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            write_wait_secs: default_write_wait_secs(),
            pong_wait_secs: default_pong_wait_secs(),
            ping_period_secs: default_ping_period_secs(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl HubConfig {
    /// Write deadline as a duration
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    /// Read deadline as a duration
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Ping interval as a duration
    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }
}

/// Text generation service (Ollama) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Ollama server host
    #[serde(default = "default_ollama_host")]
    pub host: String,

    /// Model to generate with
    #[serde(default = "default_ollama_model")]
    pub model: String,

    /// Upper bound on one streamed turn (seconds)
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
}

fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_generation_timeout() -> u64 {
    300
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            host: default_ollama_host(),
            model: default_ollama_model(),
            timeout_secs: default_generation_timeout(),
        }
    }
}

/// Vector search service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorSearchConfig {
    /// Service base URL
    #[serde(default = "default_vector_search_url")]
    pub base_url: String,

    /// Request timeout (seconds)
    #[serde(default = "default_short_timeout")]
    pub timeout_secs: u64,
}

fn default_vector_search_url() -> String {
    "http://localhost:8090".to_string()
}

fn default_short_timeout() -> u64 {
    10
}

impl Default for VectorSearchConfig {
    fn default() -> Self {
        Self {
            base_url: default_vector_search_url(),
            timeout_secs: default_short_timeout(),
        }
    }
}

/// File vectorization service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorizerConfig {
    /// Service base URL
    #[serde(default = "default_vectorizer_url")]
    pub base_url: String,

    /// Request timeout (seconds); uploads of large files take a while
    #[serde(default = "default_vectorizer_timeout")]
    pub timeout_secs: u64,
}

fn default_vectorizer_url() -> String {
    "http://localhost:8091".to_string()
}

fn default_vectorizer_timeout() -> u64 {
    120
}

impl Default for VectorizerConfig {
    fn default() -> Self {
        Self {
            base_url: default_vectorizer_url(),
            timeout_secs: default_vectorizer_timeout(),
        }
    }
}

/// Generation orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Bound on each augmentation lookup (seconds)
    #[serde(default = "default_short_timeout")]
    pub augmentation_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            augmentation_timeout_secs: default_short_timeout(),
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory of the durable chat and file store
    #[serde(default = "default_durable_path")]
    pub durable_path: PathBuf,

    /// Directory of the session buffer
    #[serde(default = "default_buffer_path")]
    pub buffer_path: PathBuf,
}

fn default_durable_path() -> PathBuf {
    PathBuf::from("data/durable")
}

fn default_buffer_path() -> PathBuf {
    PathBuf::from("data/buffer")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            durable_path: default_durable_path(),
            buffer_path: default_buffer_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable JSON-formatted logs
    #[serde(default)]
    pub json_format: bool,

    /// Log file path (if None, STDOUT only)
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ChatRelayError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| ChatRelayError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        // Bus overrides
        if let Ok(backend) = std::env::var("CHATRELAY_BUS_BACKEND") {
            match backend.to_lowercase().as_str() {
                "kafka" => self.bus.backend = BusBackend::Kafka,
                "memory" => self.bus.backend = BusBackend::Memory,
                _ => tracing::warn!("Invalid CHATRELAY_BUS_BACKEND: {}", backend),
            }
        }

        if let Ok(brokers) = std::env::var("CHATRELAY_KAFKA_BROKERS") {
            self.bus.brokers = brokers;
        }

        if let Ok(prefix) = std::env::var("CHATRELAY_KAFKA_GROUP_PREFIX") {
            self.bus.group_prefix = prefix;
        }

        if let Ok(protocol) = std::env::var("CHATRELAY_KAFKA_SECURITY_PROTOCOL") {
            match protocol.parse() {
                Ok(value) => self.bus.security.protocol = value,
                Err(_) => tracing::warn!("Invalid CHATRELAY_KAFKA_SECURITY_PROTOCOL: {}", protocol),
            }
        }

        if let Ok(mechanism) = std::env::var("CHATRELAY_KAFKA_SASL_MECHANISM") {
            match mechanism.parse() {
                Ok(value) => self.bus.security.sasl_mechanism = value,
                Err(_) => tracing::warn!("Invalid CHATRELAY_KAFKA_SASL_MECHANISM: {}", mechanism),
            }
        }

        if let Ok(username) = std::env::var("CHATRELAY_KAFKA_SASL_USERNAME") {
            self.bus.security.sasl_username = Some(username);
        }

        if let Ok(password) = std::env::var("CHATRELAY_KAFKA_SASL_PASSWORD") {
            self.bus.security.sasl_password = Some(password);
        }

        if let Ok(ca) = std::env::var("CHATRELAY_KAFKA_SSL_CA_LOCATION") {
            self.bus.security.ssl_ca_location = Some(ca);
        }

        // Hub overrides
        if let Ok(addr) = std::env::var("CHATRELAY_HUB_BIND_ADDR") {
            self.hub.bind_addr = addr;
        }

        // Collaborator overrides
        if let Ok(host) = std::env::var("CHATRELAY_OLLAMA_HOST") {
            self.generation.host = host;
        }

        if let Ok(model) = std::env::var("CHATRELAY_OLLAMA_MODEL") {
            self.generation.model = model;
        }

        if let Ok(timeout) = std::env::var("CHATRELAY_GENERATION_TIMEOUT_SECS") {
            if let Ok(value) = timeout.parse() {
                self.generation.timeout_secs = value;
            } else {
                tracing::warn!("Invalid CHATRELAY_GENERATION_TIMEOUT_SECS: {}", timeout);
            }
        }

        if let Ok(url) = std::env::var("CHATRELAY_VECTOR_SEARCH_URL") {
            self.vector_search.base_url = url;
        }

        if let Ok(url) = std::env::var("CHATRELAY_VECTORIZER_URL") {
            self.vectorizer.base_url = url;
        }

        // Storage overrides
        if let Ok(path) = std::env::var("CHATRELAY_DURABLE_PATH") {
            self.storage.durable_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("CHATRELAY_BUFFER_PATH") {
            self.storage.buffer_path = PathBuf::from(path);
        }

        // Logging overrides
        if let Ok(level) = std::env::var("CHATRELAY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(json) = std::env::var("CHATRELAY_LOG_JSON") {
            self.logging.json_format = matches!(json.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        if self.bus.backend == BusBackend::Kafka && self.bus.brokers.trim().is_empty() {
            return Err(ChatRelayError::Config("bus.brokers cannot be empty".to_string()).into());
        }

        self.bus.security.validate()?;

        if self.bus.memory_partitions == 0 {
            return Err(ChatRelayError::Config(
                "bus.memory_partitions must be greater than 0".to_string(),
            )
            .into());
        }

        if self.bus.retry_backoff_ms == 0 {
            return Err(ChatRelayError::Config(
                "bus.retry_backoff_ms must be greater than 0".to_string(),
            )
            .into());
        }

        let topics = [
            &self.bus.topics.user_query,
            &self.bus.topics.server_reply,
            &self.bus.topics.db_ops,
            &self.bus.topics.vectorize_file,
        ];
        if topics.iter().any(|t| t.is_empty()) {
            return Err(ChatRelayError::Config("topic names cannot be empty".to_string()).into());
        }

        if self.hub.outbound_queue_capacity == 0 {
            return Err(ChatRelayError::Config(
                "hub.outbound_queue_capacity must be greater than 0".to_string(),
            )
            .into());
        }

        if self.hub.ping_period_secs == 0 || self.hub.ping_period_secs >= self.hub.pong_wait_secs
        {
            return Err(ChatRelayError::Config(
                "hub.ping_period_secs must be greater than 0 and less than hub.pong_wait_secs"
                    .to_string(),
            )
            .into());
        }

        if self.hub.write_wait_secs == 0 {
            return Err(ChatRelayError::Config(
                "hub.write_wait_secs must be greater than 0".to_string(),
            )
            .into());
        }

        if self.generation.model.is_empty() {
            return Err(
                ChatRelayError::Config("generation.model cannot be empty".to_string()).into(),
            );
        }

        if self.generation.timeout_secs == 0 {
            return Err(ChatRelayError::Config(
                "generation.timeout_secs must be greater than 0".to_string(),
            )
            .into());
        }

        if self.orchestrator.augmentation_timeout_secs == 0 {
            return Err(ChatRelayError::Config(
                "orchestrator.augmentation_timeout_secs must be greater than 0".to_string(),
            )
            .into());
        }

        if self.storage.durable_path == self.storage.buffer_path {
            return Err(ChatRelayError::Config(
                "storage.durable_path and storage.buffer_path must differ".to_string(),
            )
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::config::SecurityProtocol;
    use crate::cli::Cli;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bus.backend, BusBackend::Kafka);
        assert_eq!(config.bus.topics.user_query, "user_query");
        assert_eq!(config.bus.topics.vectorize_file, "vectorize_file");
        assert_eq!(config.hub.outbound_queue_capacity, 256);
        assert_eq!(config.hub.ping_period_secs, 54);
        assert_eq!(config.orchestrator.augmentation_timeout_secs, 10);
    }

    #[test]
    fn test_config_validation_success() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_ping_not_shorter_than_pong() {
        let mut config = Config::default();
        config.hub.ping_period_secs = config.hub.pong_wait_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_queue() {
        let mut config = Config::default();
        config.hub.outbound_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_shared_storage_path() {
        let mut config = Config::default();
        config.storage.buffer_path = config.storage.durable_path.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_retry_backoff() {
        let mut config = Config::default();
        config.bus.retry_backoff_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_sasl_without_credentials() {
        let mut config = Config::default();
        config.bus.security.protocol = SecurityProtocol::SaslSsl;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_memory_backend_allows_empty_brokers() {
        let mut config = Config::default();
        config.bus.backend = BusBackend::Memory;
        config.bus.brokers = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
bus:
  backend: memory
  topics:
    user_query: uq
hub:
  bind_addr: "127.0.0.1:9000"
generation:
  model: mistral
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bus.backend, BusBackend::Memory);
        assert_eq!(config.bus.topics.user_query, "uq");
        assert_eq!(config.bus.topics.server_reply, "server_reply");
        assert_eq!(config.hub.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.generation.model, "mistral");
        assert_eq!(config.generation.host, "http://localhost:11434");
    }

    #[test]
    fn test_kafka_settings_from_bus_config() {
        let mut bus = BusConfig::default();
        bus.session_timeout_ms = 45_000;
        bus.retry_backoff_ms = 250;
        let settings = bus.kafka_settings();
        assert_eq!(settings.brokers, "localhost:9092");
        assert_eq!(settings.session_timeout, Duration::from_secs(45));
        assert_eq!(settings.retry_backoff, Duration::from_millis(250));
        assert_eq!(settings.group_id("hub"), "chatrelay-hub");
    }

    #[test]
    #[serial]
    fn test_load_missing_file_uses_defaults() {
        let cli = Cli::default();
        let config = Config::load("/nonexistent/chatrelay.yaml", &cli).unwrap();
        assert_eq!(config.hub.bind_addr, "0.0.0.0:8082");
    }

    #[test]
    #[serial]
    fn test_load_from_file_and_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatrelay.yaml");
        std::fs::write(&path, "generation:\n  model: from-file\n").unwrap();

        std::env::set_var("CHATRELAY_OLLAMA_HOST", "http://ollama:11434");
        let cli = Cli::default();
        let config = Config::load(path.to_str().unwrap(), &cli).unwrap();
        std::env::remove_var("CHATRELAY_OLLAMA_HOST");

        assert_eq!(config.generation.model, "from-file");
        assert_eq!(config.generation.host, "http://ollama:11434");
    }

    #[test]
    #[serial]
    fn test_invalid_env_value_is_ignored() {
        std::env::set_var("CHATRELAY_GENERATION_TIMEOUT_SECS", "soon");
        let cli = Cli::default();
        let config = Config::load("/nonexistent/chatrelay.yaml", &cli).unwrap();
        std::env::remove_var("CHATRELAY_GENERATION_TIMEOUT_SECS");
        assert_eq!(config.generation.timeout_secs, 300);
    }

    #[test]
    #[serial]
    fn test_verbose_flag_raises_log_level() {
        let cli = Cli {
            verbose: true,
            ..Cli::default()
        };
        let config = Config::load("/nonexistent/chatrelay.yaml", &cli).unwrap();
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_rejects_malformed_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "bus: [unclosed").unwrap();
        let cli = Cli::default();
        assert!(Config::load(path.to_str().unwrap(), &cli).is_err());
    }
}
