//! Telemetry driver
//!
//! Publishes channel writes (setpoints, commands) to a broker through its
//! own durable publisher, independent of the loggers.

use std::sync::Arc;
use tracing::debug;
use voltage_buffer::{BrokerConnection, DurablePublisher, PublisherStatsSnapshot};

use crate::config::EndpointConfig;
use crate::error::Result;
use crate::formatter::PayloadSerializer;
use crate::outbound::OutboundEndpoint;
use crate::reading::Reading;

pub struct TelemetryDriver {
    endpoint: OutboundEndpoint,
}

impl TelemetryDriver {
    pub fn new(
        config: EndpointConfig,
        serializer: Arc<dyn PayloadSerializer>,
        connection: Arc<dyn BrokerConnection>,
    ) -> Result<Self> {
        Ok(Self {
            endpoint: OutboundEndpoint::new("driver", config, serializer, connection)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.endpoint.config().name
    }

    pub fn start(&self) {
        self.endpoint.start();
    }

    pub fn publisher(&self) -> &DurablePublisher {
        self.endpoint.publisher()
    }

    pub fn stats(&self) -> PublisherStatsSnapshot {
        self.endpoint.stats()
    }

    /// Write `value` to `channel`. Only a serializer failure is reported;
    /// transport trouble is absorbed by the buffer.
    pub async fn write(&self, channel: &str, value: f64) -> Result<()> {
        debug!("{}: write {} = {}", self.name(), channel, value);
        self.endpoint
            .publish_reading(&Reading::new(channel, value))
            .await
    }

    pub async fn shutdown(&self) {
        self.endpoint.shutdown().await;
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::formatter::JsonSerializer;
    use voltage_buffer::test_utils::MockBrokerConnection;
    use voltage_buffer::BufferConfig;

    fn driver(broker: Arc<MockBrokerConnection>, config: EndpointConfig) -> TelemetryDriver {
        TelemetryDriver::new(config, Arc::new(JsonSerializer), broker).unwrap()
    }

    #[tokio::test]
    async fn test_write_publishes_on_channel_topic() {
        let broker = MockBrokerConnection::new_connected();
        let plc = driver(
            broker.clone(),
            EndpointConfig {
                topic_prefix: "plc/write".to_string(),
                ..EndpointConfig::new("plc")
            },
        );

        plc.write("setpoint", 42.5).await.unwrap();
        assert_eq!(broker.delivered_keys(), vec!["plc/write/setpoint"]);
        let reading: Reading = serde_json::from_slice(&broker.delivered_payloads()[0]).unwrap();
        assert_eq!(reading.channel, "setpoint");
        assert_eq!(reading.value, 42.5);
        assert!(reading.timestamp.is_some());
    }

    #[tokio::test]
    async fn test_writes_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = EndpointConfig {
            buffer: BufferConfig::with_overflow(1024, dir.path(), 4, 4096),
            ..EndpointConfig::new("plc")
        };

        {
            let broker = MockBrokerConnection::new_disconnected();
            let plc = driver(broker, config.clone());
            plc.write("a", 1.0).await.unwrap();
            plc.write("b", 2.0).await.unwrap();
            plc.shutdown().await;
        }

        let broker = MockBrokerConnection::new_connected();
        let plc = driver(broker.clone(), config);
        assert_eq!(plc.publisher().stored_messages().await, 2);
        plc.start();
        assert!(broker.wait_for_deliveries(2, std::time::Duration::from_secs(5)).await);
        assert_eq!(broker.delivered_keys(), vec!["a", "b"]);
    }
}
