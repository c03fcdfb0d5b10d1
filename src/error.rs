//! Error types for ChatRelay
//!
//! This module defines the domain error type used throughout the pipeline,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for ChatRelay operations
///
/// Covers configuration loading, bus plumbing, the session buffer, the
/// durable store and the external collaborators (generation, vector search,
/// file vectorization).
#[derive(Error, Debug)]
pub enum ChatRelayError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Message bus errors (publish, subscribe, commit)
    #[error("Bus error: {0}")]
    Bus(String),

    /// Session buffer errors (ephemeral store round trips)
    #[error("Buffer error: {0}")]
    Buffer(String),

    /// Durable store errors (chat log, file records)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Generation service errors
    #[error("Provider error: {0}")]
    Provider(String),

    /// Vector search or vectorizer service errors
    #[error("Service error: {0}")]
    Service(String),

    /// A record that was expected to exist is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for ChatRelay operations
///
/// Uses `anyhow::Error` so callers can attach context while propagating.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = ChatRelayError::Config("invalid format".to_string());
        assert_eq!(error.to_string(), "Configuration error: invalid format");
    }

    #[test]
    fn test_bus_error_display() {
        let error = ChatRelayError::Bus("broker unreachable".to_string());
        assert_eq!(error.to_string(), "Bus error: broker unreachable");
    }

    #[test]
    fn test_buffer_error_display() {
        let error = ChatRelayError::Buffer("tree missing".to_string());
        assert_eq!(error.to_string(), "Buffer error: tree missing");
    }

    #[test]
    fn test_storage_error_display() {
        let error = ChatRelayError::Storage("database connection failed".to_string());
        assert_eq!(
            error.to_string(),
            "Storage error: database connection failed"
        );
    }

    #[test]
    fn test_not_found_display() {
        let error = ChatRelayError::NotFound("file 42".to_string());
        assert_eq!(error.to_string(), "Not found: file 42");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: ChatRelayError = io_error.into();
        assert!(matches!(error, ChatRelayError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{invalid json}").unwrap_err();
        let error: ChatRelayError = json_error.into();
        assert!(matches!(error, ChatRelayError::Serialization(_)));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: : yaml").unwrap_err();
        let error: ChatRelayError = yaml_error.into();
        assert!(matches!(error, ChatRelayError::Yaml(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ChatRelayError>();
    }
}
