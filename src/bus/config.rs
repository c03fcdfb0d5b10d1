//! Kafka client settings for the pipeline topics.
//!
//! Producer and consumer share one set of connection and security settings;
//! each consuming component gets its own consumer group
//! (`{group_prefix}-{component}`).
//!
//! # Example
//!
//! ```rust
//! use chatrelay::bus::config::{KafkaSettings, SecurityProtocol};
//!
//! let settings = KafkaSettings::new("kafka:9093", "chatrelay")
//!     .with_sasl_scram_sha256("user", "pass");
//! assert_eq!(settings.security.protocol, SecurityProtocol::SaslSsl);
//! assert_eq!(settings.group_id("orchestrator"), "chatrelay-orchestrator");
//! ```

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ChatRelayError;

/// Security protocol for the broker connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityProtocol {
    /// No encryption or authentication.
    #[default]
    #[serde(rename = "PLAINTEXT")]
    Plaintext,
    /// TLS encryption without SASL.
    #[serde(rename = "SSL")]
    Ssl,
    /// SASL authentication without TLS.
    #[serde(rename = "SASL_PLAINTEXT")]
    SaslPlaintext,
    /// SASL authentication with TLS encryption.
    #[serde(rename = "SASL_SSL")]
    SaslSsl,
}

impl SecurityProtocol {
    /// Returns the librdkafka configuration string for this protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plaintext => "PLAINTEXT",
            Self::Ssl => "SSL",
            Self::SaslPlaintext => "SASL_PLAINTEXT",
            Self::SaslSsl => "SASL_SSL",
        }
    }

    /// True for the two SASL protocols.
    pub fn uses_sasl(&self) -> bool {
        matches!(self, Self::SaslPlaintext | Self::SaslSsl)
    }

    /// True for the two TLS protocols.
    pub fn uses_tls(&self) -> bool {
        matches!(self, Self::Ssl | Self::SaslSsl)
    }
}

impl FromStr for SecurityProtocol {
    type Err = ChatRelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PLAINTEXT" => Ok(Self::Plaintext),
            "SSL" => Ok(Self::Ssl),
            "SASL_PLAINTEXT" => Ok(Self::SaslPlaintext),
            "SASL_SSL" => Ok(Self::SaslSsl),
            _ => Err(ChatRelayError::Config(format!(
                "Invalid security protocol: {}",
                s
            ))),
        }
    }
}

/// SASL authentication mechanism.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaslMechanism {
    /// PLAIN mechanism.
    #[serde(rename = "PLAIN")]
    Plain,
    /// SCRAM-SHA-256 mechanism.
    #[default]
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    /// SCRAM-SHA-512 mechanism.
    #[serde(rename = "SCRAM-SHA-512")]
    ScramSha512,
}

impl SaslMechanism {
    /// Returns the librdkafka configuration string for this mechanism.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

impl FromStr for SaslMechanism {
    type Err = ChatRelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Ok(Self::Plain),
            "SCRAM-SHA-256" => Ok(Self::ScramSha256),
            "SCRAM-SHA-512" => Ok(Self::ScramSha512),
            _ => Err(ChatRelayError::Config(format!(
                "Invalid SASL mechanism: {}",
                s
            ))),
        }
    }
}

/// Broker security settings.
///
/// SASL credentials are required when `protocol` is a SASL protocol; the
/// CA location is optional for TLS protocols (system roots are used
/// otherwise).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KafkaSecurity {
    /// Security protocol.
    #[serde(default)]
    pub protocol: SecurityProtocol,

    /// SASL mechanism (used only with SASL protocols).
    #[serde(default)]
    pub sasl_mechanism: SaslMechanism,

    /// SASL username (prefer env var CHATRELAY_KAFKA_SASL_USERNAME).
    #[serde(default)]
    pub sasl_username: Option<String>,

    /// SASL password (prefer env var CHATRELAY_KAFKA_SASL_PASSWORD).
    #[serde(default, skip_serializing)]
    pub sasl_password: Option<String>,

    /// Path to CA certificate file.
    #[serde(default)]
    pub ssl_ca_location: Option<String>,
}

impl KafkaSecurity {
    /// Checks that SASL credentials are present when the protocol needs them.
    pub fn validate(&self) -> Result<(), ChatRelayError> {
        if self.protocol.uses_sasl() {
            if self.sasl_username.as_deref().unwrap_or("").is_empty() {
                return Err(ChatRelayError::Config(
                    "bus.security.sasl_username is required for SASL protocols".to_string(),
                ));
            }
            if self.sasl_password.as_deref().unwrap_or("").is_empty() {
                return Err(ChatRelayError::Config(
                    "bus.security.sasl_password is required for SASL protocols".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Connection settings shared by the producer and every consumer.
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    /// Broker addresses (comma-separated).
    pub brokers: String,

    /// Prefix for consumer group ids and client ids.
    pub group_prefix: String,

    /// Security settings.
    pub security: KafkaSecurity,

    /// Consumer session timeout.
    pub session_timeout: Duration,

    /// Delay before a held message is fetched again.
    pub retry_backoff: Duration,
}

impl KafkaSettings {
    /// Creates settings with plaintext security, a 30s session timeout and
    /// a 1s retry backoff.
    pub fn new(brokers: &str, group_prefix: &str) -> Self {
        Self {
            brokers: brokers.to_string(),
            group_prefix: group_prefix.to_string(),
            security: KafkaSecurity::default(),
            session_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(1),
        }
    }

    /// Configures SASL/SCRAM-SHA-256 authentication over TLS.
    pub fn with_sasl_scram_sha256(mut self, username: &str, password: &str) -> Self {
        self.security.protocol = SecurityProtocol::SaslSsl;
        self.security.sasl_mechanism = SaslMechanism::ScramSha256;
        self.security.sasl_username = Some(username.to_string());
        self.security.sasl_password = Some(password.to_string());
        self
    }

    /// Configures TLS with a CA certificate.
    pub fn with_ssl(mut self, ca_location: &str) -> Self {
        if !self.security.protocol.uses_tls() {
            self.security.protocol = SecurityProtocol::Ssl;
        }
        self.security.ssl_ca_location = Some(ca_location.to_string());
        self
    }

    /// Sets the consumer session timeout.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Sets the delay before a held message is fetched again.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Consumer group id for one component.
    pub fn group_id(&self, component: &str) -> String {
        format!("{}-{}", self.group_prefix, component)
    }

    /// Connection and security entries common to producers and consumers.
    pub fn common_entries(&self) -> Vec<(String, String)> {
        let mut settings = vec![
            ("bootstrap.servers".to_string(), self.brokers.clone()),
            (
                "security.protocol".to_string(),
                self.security.protocol.as_str().to_string(),
            ),
        ];

        if self.security.protocol.uses_sasl() {
            settings.push((
                "sasl.mechanism".to_string(),
                self.security.sasl_mechanism.as_str().to_string(),
            ));
            if let Some(username) = &self.security.sasl_username {
                settings.push(("sasl.username".to_string(), username.clone()));
            }
            if let Some(password) = &self.security.sasl_password {
                settings.push(("sasl.password".to_string(), password.clone()));
            }
        }

        if self.security.protocol.uses_tls() {
            if let Some(ca) = &self.security.ssl_ca_location {
                settings.push(("ssl.ca.location".to_string(), ca.clone()));
            }
        }

        settings
    }

    /// Producer entries: full acknowledgement, idempotence and one request
    /// in flight so retries cannot reorder a session's messages.
    pub fn producer_entries(&self) -> Vec<(String, String)> {
        let mut settings = self.common_entries();
        settings.extend([
            (
                "client.id".to_string(),
                format!("{}-producer", self.group_prefix),
            ),
            ("acks".to_string(), "all".to_string()),
            ("enable.idempotence".to_string(), "true".to_string()),
            (
                "max.in.flight.requests.per.connection".to_string(),
                "1".to_string(),
            ),
            ("message.timeout.ms".to_string(), "30000".to_string()),
        ]);
        settings
    }

    /// Consumer entries for one component: manual commit, earliest reset.
    pub fn consumer_entries(&self, component: &str) -> Vec<(String, String)> {
        let mut settings = self.common_entries();
        settings.extend([
            ("group.id".to_string(), self.group_id(component)),
            (
                "client.id".to_string(),
                format!("{}-{}", self.group_prefix, component),
            ),
            ("enable.auto.commit".to_string(), "false".to_string()),
            ("enable.auto.offset.store".to_string(), "false".to_string()),
            ("auto.offset.reset".to_string(), "earliest".to_string()),
            (
                "session.timeout.ms".to_string(),
                self.session_timeout.as_millis().to_string(),
            ),
        ]);
        settings
    }

    /// Builds an rdkafka producer configuration.
    pub fn producer_config(&self) -> ClientConfig {
        to_client_config(self.producer_entries())
    }

    /// Builds an rdkafka consumer configuration for one component.
    pub fn consumer_config(&self, component: &str) -> ClientConfig {
        to_client_config(self.consumer_entries(component))
    }
}

fn to_client_config(entries: Vec<(String, String)>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in entries {
        config.set(key, value);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(entries: &'a [(String, String)], key: &str) -> Option<&'a str> {
        entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_new_settings_defaults() {
        let settings = KafkaSettings::new("localhost:9092", "chatrelay");
        assert_eq!(settings.brokers, "localhost:9092");
        assert_eq!(settings.security.protocol, SecurityProtocol::Plaintext);
        assert_eq!(settings.session_timeout, Duration::from_secs(30));
        assert_eq!(settings.group_id("hub"), "chatrelay-hub");
    }

    #[test]
    fn test_producer_entries_enforce_ordering() {
        let entries = KafkaSettings::new("b:9092", "cr").producer_entries();
        assert_eq!(lookup(&entries, "acks"), Some("all"));
        assert_eq!(lookup(&entries, "enable.idempotence"), Some("true"));
        assert_eq!(
            lookup(&entries, "max.in.flight.requests.per.connection"),
            Some("1")
        );
        assert_eq!(lookup(&entries, "sasl.mechanism"), None);
    }

    #[test]
    fn test_consumer_entries_disable_auto_commit() {
        let entries = KafkaSettings::new("b:9092", "cr").consumer_entries("synchronizer");
        assert_eq!(lookup(&entries, "group.id"), Some("cr-synchronizer"));
        assert_eq!(lookup(&entries, "enable.auto.commit"), Some("false"));
        assert_eq!(lookup(&entries, "auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn test_sasl_entries() {
        let entries = KafkaSettings::new("b:9093", "cr")
            .with_sasl_scram_sha256("user", "pass")
            .with_ssl("/etc/ca.pem")
            .common_entries();
        assert_eq!(lookup(&entries, "security.protocol"), Some("SASL_SSL"));
        assert_eq!(lookup(&entries, "sasl.mechanism"), Some("SCRAM-SHA-256"));
        assert_eq!(lookup(&entries, "sasl.username"), Some("user"));
        assert_eq!(lookup(&entries, "ssl.ca.location"), Some("/etc/ca.pem"));
    }

    #[test]
    fn test_with_ssl_keeps_sasl_protocol() {
        let settings = KafkaSettings::new("b", "cr")
            .with_sasl_scram_sha256("u", "p")
            .with_ssl("/ca");
        assert_eq!(settings.security.protocol, SecurityProtocol::SaslSsl);

        let plain = KafkaSettings::new("b", "cr").with_ssl("/ca");
        assert_eq!(plain.security.protocol, SecurityProtocol::Ssl);
    }

    #[test]
    fn test_security_protocol_from_str() {
        assert_eq!(
            "sasl_ssl".parse::<SecurityProtocol>().unwrap(),
            SecurityProtocol::SaslSsl
        );
        assert!("bogus".parse::<SecurityProtocol>().is_err());
    }

    #[test]
    fn test_sasl_mechanism_from_str() {
        assert_eq!(
            "scram-sha-512".parse::<SaslMechanism>().unwrap(),
            SaslMechanism::ScramSha512
        );
        assert!("GSSAPI".parse::<SaslMechanism>().is_err());
    }

    #[test]
    fn test_security_validate_requires_credentials() {
        let mut security = KafkaSecurity {
            protocol: SecurityProtocol::SaslPlaintext,
            ..Default::default()
        };
        assert!(security.validate().is_err());

        security.sasl_username = Some("u".to_string());
        security.sasl_password = Some("p".to_string());
        assert!(security.validate().is_ok());
    }

    #[test]
    fn test_security_deserializes_kafka_names() {
        let yaml = "protocol: SASL_SSL\nsasl_mechanism: SCRAM-SHA-512\n";
        let security: KafkaSecurity = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(security.protocol, SecurityProtocol::SaslSsl);
        assert_eq!(security.sasl_mechanism, SaslMechanism::ScramSha512);
    }
}
