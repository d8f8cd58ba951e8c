use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::ConfigError;
use crate::source::Qos;

/// Topic subscribed to when none is configured.
pub const DEFAULT_TOPIC: &str = "SiteWhere/input/protobuf";

/// Environment variable holding a YAML `IngestConfig`.
pub const CONFIG_ENV_VAR: &str = "RECEIVER_CONFIG";

const SUPPORTED_PROTOCOLS: &[&str] = &["tcp", "mqtt", "ssl", "tls", "mqtts"];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    pub version: u32,
    pub source_id: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub receiver: ReceiverConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub protocol: String,
    pub hostname: String,
    pub port: u16,
    pub topic: String,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_timeout_ms: u64,
    pub subscribe_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub receive_retry_delay_ms: u64,
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            protocol: "tcp".to_string(),
            hostname: "localhost".to_string(),
            port: 1883,
            topic: DEFAULT_TOPIC.to_string(),
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 30,
            clean_session: true,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10000,
            subscribe_timeout_ms: 10000,
            shutdown_timeout_ms: 5000,
            receive_retry_delay_ms: 100,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn subscribe(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn receive_retry_delay(&self) -> Duration {
        Duration::from_millis(self.receive_retry_delay_ms)
    }
}

impl ReceiverConfig {
    /// Receivers always subscribe with at-least-once delivery.
    pub fn qos(&self) -> Qos {
        Qos::AtLeastOnce
    }

    pub fn broker_info(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn display_name(&self) -> String {
        format!(
            "{}://{}:{}/{}",
            self.protocol, self.hostname, self.port, self.topic
        )
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self.protocol.as_str(), "ssl" | "tls" | "mqtts")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.is_empty() {
            return Err(ConfigError::MissingField {
                field: "hostname".to_string(),
            });
        }
        if self.port == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "Broker port cannot be 0".to_string(),
            });
        }
        if self.topic.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "MQTT topic cannot be empty".to_string(),
            });
        }
        if !SUPPORTED_PROTOCOLS.contains(&self.protocol.as_str()) {
            return Err(ConfigError::Invalid {
                message: format!("Unsupported protocol '{}'", self.protocol),
            });
        }
        if self.keep_alive_secs == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "Keep-alive must be at least one second".to_string(),
            });
        }
        let timeouts = &self.timeouts;
        if timeouts.connect_timeout_ms == 0
            || timeouts.subscribe_timeout_ms == 0
            || timeouts.shutdown_timeout_ms == 0
        {
            return Err(ConfigError::ValidationFailed {
                reason: "Connect, subscribe and shutdown timeouts must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

pub async fn load_config(config_path: Option<&str>) -> anyhow::Result<IngestConfig> {
    let config = match config_path {
        Some(path) => IngestConfig::from_file(path)?,
        None => IngestConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

impl IngestConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.to_string(),
            error: Box::new(e),
        })?;
        Self::from_yaml(path, &content)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config_str = std::env::var(CONFIG_ENV_VAR).map_err(|_| ConfigError::MissingField {
            field: CONFIG_ENV_VAR.to_string(),
        })?;
        Self::from_yaml(CONFIG_ENV_VAR, &config_str)
    }

    fn from_yaml(origin: &str, content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::LoadFailed {
            origin: origin.to_string(),
            error: Box::new(e),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_id.is_empty() {
            return Err(ConfigError::MissingField {
                field: "source_id".to_string(),
            });
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "Channel capacity must be greater than 0".to_string(),
            });
        }
        self.receiver.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_receiver_defaults() {
        let config = ReceiverConfig::default();
        assert_eq!(config.topic, DEFAULT_TOPIC);
        assert_eq!(config.port, 1883);
        assert_eq!(config.qos(), Qos::AtLeastOnce);
        assert_eq!(config.broker_info(), "localhost:1883");
        assert_eq!(
            config.display_name(),
            "tcp://localhost:1883/SiteWhere/input/protobuf"
        );
        assert!(!config.uses_tls());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_partial_yaml_uses_defaults() {
        let yaml = r#"
version: 1
source_id: mqtt-tenant-a
receiver:
  hostname: broker.internal
  topic: t1
  timeouts:
    subscribe_timeout_ms: 250
"#;
        let config = IngestConfig::from_yaml("inline", yaml).unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.channel_capacity, 1024);
        assert_eq!(config.receiver.hostname, "broker.internal");
        assert_eq!(config.receiver.port, 1883);
        assert_eq!(config.receiver.protocol, "tcp");
        assert_eq!(config.receiver.timeouts.subscribe_timeout_ms, 250);
        assert_eq!(config.receiver.timeouts.connect_timeout_ms, 10000);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ReceiverConfig::default();
        config.topic.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed { .. })
        ));

        let mut config = ReceiverConfig::default();
        config.protocol = "ws".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = ReceiverConfig::default();
        config.hostname.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField { .. })
        ));

        let mut config = ReceiverConfig::default();
        config.timeouts.shutdown_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_protocols() {
        let mut config = ReceiverConfig::default();
        config.protocol = "ssl".to_string();
        config.port = 8883;
        assert!(config.uses_tls());
        assert_eq!(config.display_name(), "ssl://localhost:8883/SiteWhere/input/protobuf");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "version: 2\nsource_id: s1\nchannel_capacity: 8").unwrap();

        let config = IngestConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.version, 2);
        assert_eq!(config.channel_capacity, 8);
        assert_eq!(config.receiver.topic, DEFAULT_TOPIC);
    }

    #[test]
    fn test_from_file_missing() {
        let err = IngestConfig::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::LoadFailed { .. }));
    }
}
