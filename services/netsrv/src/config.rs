//! netsrv configuration
//!
//! Loaded from YAML/TOML/JSON through `common::load_config_from_file`, with
//! `NETSRV_`-prefixed environment overrides (`NETSRV_LOGGING__DIRECTORY`).
//!
//! ```yaml
//! logging:
//!   directory: logs
//! loggers:
//!   - name: cloud
//!     mqtt: { host: broker.local, port: 1883 }
//!     buffer:
//!       max_buffer_bytes: 1048576
//!       max_segments: 8
//!       persistence_directory: data/cloud
//!     serializer: json
//!     topic_prefix: site1/telemetry
//!     log_multiple: true
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use voltage_buffer::{BufferConfig, MqttSettings};

use crate::error::{NetsrvError, Result};
use crate::formatter::SerializerRegistry;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetsrvConfig {
    pub logging: LoggingSettings,
    /// Outbound telemetry loggers
    pub loggers: Vec<EndpointConfig>,
    /// Outbound channel-write drivers
    pub drivers: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Daily log file directory; console only when unset
    pub directory: Option<PathBuf>,
    /// Write the log file as JSON lines
    pub json: bool,
    /// Filter used when `RUST_LOG` is not set
    pub filter: Option<String>,
}

impl LoggingSettings {
    pub fn to_log_config(&self, ansi: bool) -> common::LogConfig {
        common::LogConfig {
            log_dir: self.directory.clone(),
            default_filter: self.filter.clone(),
            enable_json: self.json,
            ansi,
            ..common::LogConfig::for_service("netsrv")
        }
    }
}

/// One outbound publisher: a broker, a buffer and a payload format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub name: String,
    pub enabled: bool,
    pub mqtt: MqttSettings,
    pub buffer: BufferConfig,
    /// Serializer id, see `SerializerRegistry`
    pub serializer: String,
    pub topic_prefix: String,
    /// Per-channel topic overrides
    pub topics: HashMap<String, String>,
    /// Loggers only: one message per topic and cycle instead of one per reading
    pub log_multiple: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            mqtt: MqttSettings::default(),
            buffer: BufferConfig::default(),
            serializer: "json".to_string(),
            topic_prefix: String::new(),
            topics: HashMap::new(),
            log_multiple: false,
        }
    }
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Routing key for `channel`
    pub fn topic_for(&self, channel: &str) -> String {
        if let Some(topic) = self.topics.get(channel) {
            return topic.clone();
        }
        let prefix = self.topic_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            channel.to_string()
        } else {
            format!("{}/{}", prefix, channel)
        }
    }

    fn validate(&self, kind: &str, serializers: &SerializerRegistry) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(NetsrvError::ConfigError(format!("{} without a name", kind)));
        }
        let scoped = |e: voltage_buffer::ConfigError| {
            NetsrvError::ConfigError(format!("{} '{}': {}", kind, self.name, e))
        };
        self.mqtt.validate().map_err(scoped)?;
        self.buffer.validate().map_err(scoped)?;

        if !serializers.contains(&self.serializer) {
            return Err(NetsrvError::ConfigError(format!(
                "{} '{}': unknown serializer '{}' (available: {})",
                kind,
                self.name,
                self.serializer,
                serializers.ids().join(", ")
            )));
        }
        Ok(())
    }
}

impl NetsrvConfig {
    pub fn enabled_loggers(&self) -> impl Iterator<Item = &EndpointConfig> {
        self.loggers.iter().filter(|e| e.enabled)
    }

    pub fn enabled_drivers(&self) -> impl Iterator<Item = &EndpointConfig> {
        self.drivers.iter().filter(|e| e.enabled)
    }

    /// Check every enabled endpoint and the uniqueness of names and
    /// persistence directories.
    pub fn validate(&self, serializers: &SerializerRegistry) -> Result<()> {
        let mut directories: HashSet<PathBuf> = HashSet::new();

        for (kind, endpoints) in [("logger", &self.loggers), ("driver", &self.drivers)] {
            let mut names = HashSet::new();
            for endpoint in endpoints.iter().filter(|e| e.enabled) {
                endpoint.validate(kind, serializers)?;
                if !names.insert(endpoint.name.as_str()) {
                    return Err(NetsrvError::ConfigError(format!(
                        "duplicate {} name '{}'",
                        kind, endpoint.name
                    )));
                }
                if let Some(dir) = &endpoint.buffer.persistence_directory {
                    if !directories.insert(dir.clone()) {
                        return Err(NetsrvError::ConfigError(format!(
                            "{} '{}': persistence directory {} is used by another publisher",
                            kind,
                            endpoint.name,
                            dir.display()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn with_dir(name: &str, dir: &str) -> EndpointConfig {
        EndpointConfig {
            buffer: BufferConfig::with_overflow(1024, dir, 4, 4096),
            ..EndpointConfig::new(name)
        }
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
logging:
  directory: /var/log/netsrv
loggers:
  - name: cloud
    mqtt:
      host: broker.local
      port: 8883
    buffer:
      max_buffer_bytes: 2048
      max_segments: 4
      persistence_directory: /data/cloud
    serializer: ascii
    topic_prefix: site1/telemetry/
    log_multiple: true
drivers:
  - name: plc
    enabled: false
"#;
        let config: NetsrvConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.logging.directory,
            Some(PathBuf::from("/var/log/netsrv"))
        );
        let cloud = &config.loggers[0];
        assert_eq!(cloud.mqtt.host, "broker.local");
        assert_eq!(cloud.mqtt.port, 8883);
        assert!(cloud.buffer.overflow_enabled());
        assert!(cloud.log_multiple);
        assert_eq!(cloud.topic_for("pv.power"), "site1/telemetry/pv.power");
        assert_eq!(config.enabled_drivers().count(), 0);
        config
            .validate(&SerializerRegistry::with_defaults())
            .unwrap();
    }

    #[test]
    fn test_topic_overrides() {
        let mut endpoint = EndpointConfig::new("a");
        assert_eq!(endpoint.topic_for("x"), "x");
        endpoint.topic_prefix = "p".to_string();
        endpoint
            .topics
            .insert("x".to_string(), "custom/x".to_string());
        assert_eq!(endpoint.topic_for("x"), "custom/x");
        assert_eq!(endpoint.topic_for("y"), "p/y");
    }

    #[test]
    fn test_duplicate_directory_rejected() {
        let config = NetsrvConfig {
            loggers: vec![with_dir("a", "/tmp/netsrv-a")],
            drivers: vec![with_dir("b", "/tmp/netsrv-a")],
            ..Default::default()
        };
        let err = config
            .validate(&SerializerRegistry::with_defaults())
            .unwrap_err();
        assert!(err.to_string().contains("used by another publisher"));
    }

    #[test]
    fn test_disabled_endpoint_not_checked() {
        let mut broken = with_dir("a", "/tmp/netsrv-a");
        broken.buffer.max_segments = 0;
        broken.buffer.max_buffer_bytes = 0;
        broken.serializer = "nope".to_string();
        broken.enabled = false;
        let config = NetsrvConfig {
            loggers: vec![broken],
            ..Default::default()
        };
        assert!(config.validate(&SerializerRegistry::with_defaults()).is_ok());
    }

    #[test]
    fn test_invalid_endpoints_rejected() {
        let serializers = SerializerRegistry::with_defaults();

        let config = NetsrvConfig {
            loggers: vec![EndpointConfig::new("a"), EndpointConfig::new("a")],
            ..Default::default()
        };
        assert!(config.validate(&serializers).is_err());

        let config = NetsrvConfig {
            loggers: vec![EndpointConfig {
                serializer: "xml".to_string(),
                ..EndpointConfig::new("a")
            }],
            ..Default::default()
        };
        assert!(config
            .validate(&serializers)
            .unwrap_err()
            .to_string()
            .contains("unknown serializer"));

        let config = NetsrvConfig {
            drivers: vec![EndpointConfig::new(" ")],
            ..Default::default()
        };
        assert!(config.validate(&serializers).is_err());
    }
}
