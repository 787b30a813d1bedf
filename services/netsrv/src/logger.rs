//! Telemetry logger
//!
//! Forwards the readings of each logging cycle to a broker. In log-multiple
//! mode all readings of a cycle that map to the same topic are sent as one
//! message; topics keep the order in which they first appear in the cycle.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};
use voltage_buffer::{BrokerConnection, DurablePublisher, PublisherStatsSnapshot};

use crate::config::EndpointConfig;
use crate::error::Result;
use crate::formatter::PayloadSerializer;
use crate::outbound::OutboundEndpoint;
use crate::reading::Reading;

pub struct TelemetryLogger {
    endpoint: OutboundEndpoint,
}

impl TelemetryLogger {
    pub fn new(
        config: EndpointConfig,
        serializer: Arc<dyn PayloadSerializer>,
        connection: Arc<dyn BrokerConnection>,
    ) -> Result<Self> {
        Ok(Self {
            endpoint: OutboundEndpoint::new("logger", config, serializer, connection)?,
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

    /// Log one cycle. Returns the number of messages handed to the publisher.
    pub async fn log(&self, readings: &[Reading]) -> usize {
        if readings.is_empty() {
            return 0;
        }

        let sent = if self.endpoint.config().log_multiple {
            self.log_grouped(readings).await
        } else {
            let mut sent = 0;
            for reading in readings {
                match self.endpoint.publish_reading(reading).await {
                    Ok(()) => sent += 1,
                    Err(e) => error!("{}: reading {} skipped: {}", self.name(), reading.channel, e),
                }
            }
            sent
        };

        debug!(
            "{}: cycle of {} readings -> {} messages",
            self.name(),
            readings.len(),
            sent
        );
        sent
    }

    async fn log_grouped(&self, readings: &[Reading]) -> usize {
        let config = self.endpoint.config();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(String, Vec<&Reading>)> = Vec::new();

        for reading in readings {
            let topic = config.topic_for(&reading.channel);
            match index.get(&topic) {
                Some(&i) => groups[i].1.push(reading),
                None => {
                    index.insert(topic.clone(), groups.len());
                    groups.push((topic, vec![reading]));
                },
            }
        }

        let mut sent = 0;
        for (topic, group) in groups {
            if self.endpoint.publish_batch(topic, &group).await {
                sent += 1;
            }
        }
        sent
    }

    /// Flush buffered data to disk (when overflow is configured)
    pub async fn shutdown(&self) {
        self.endpoint.shutdown().await;
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::formatter::{AsciiSerializer, JsonSerializer};
    use voltage_buffer::test_utils::MockBrokerConnection;
    use voltage_buffer::BufferConfig;

    fn endpoint(log_multiple: bool) -> EndpointConfig {
        EndpointConfig {
            topic_prefix: "site".to_string(),
            log_multiple,
            buffer: BufferConfig::memory_only(4096),
            topics: HashMap::from([
                ("a".to_string(), "site/group".to_string()),
                ("b".to_string(), "site/group".to_string()),
            ]),
            ..EndpointConfig::new("cloud")
        }
    }

    #[tokio::test]
    async fn test_one_message_per_reading() {
        let broker = MockBrokerConnection::new_connected();
        let logger =
            TelemetryLogger::new(endpoint(false), Arc::new(JsonSerializer), broker.clone()).unwrap();

        let cycle = vec![
            Reading::at("a", 1.0, 1),
            Reading::at("c", 2.0, 1),
            Reading::at("b", 3.0, 1),
        ];
        assert_eq!(logger.log(&cycle).await, 3);
        assert_eq!(
            broker.delivered_keys(),
            vec!["site/group", "site/c", "site/group"]
        );
        assert_eq!(logger.stats().published, 3);
    }

    #[tokio::test]
    async fn test_log_multiple_groups_per_topic() {
        let broker = MockBrokerConnection::new_connected();
        let logger =
            TelemetryLogger::new(endpoint(true), Arc::new(AsciiSerializer), broker.clone()).unwrap();

        let cycle = vec![
            Reading::at("a", 1.0, 7),
            Reading::at("c", 2.0, 7),
            Reading::at("b", 3.0, 7),
        ];
        assert_eq!(logger.log(&cycle).await, 2);
        assert_eq!(broker.delivered_keys(), vec!["site/group", "site/c"]);
        let payloads = broker.delivered_payloads();
        assert_eq!(payloads[0].as_ref(), b"a: 1 @ 7\nb: 3 @ 7\n");
        assert_eq!(payloads[1].as_ref(), b"c: 2 @ 7\n");
    }

    #[tokio::test]
    async fn test_empty_cycle() {
        let broker = MockBrokerConnection::new_connected();
        let logger =
            TelemetryLogger::new(endpoint(true), Arc::new(JsonSerializer), broker.clone()).unwrap();
        assert_eq!(logger.log(&[]).await, 0);
        assert!(broker.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_outage_buffers_and_replays() {
        let broker = MockBrokerConnection::new_disconnected();
        let logger =
            TelemetryLogger::new(endpoint(false), Arc::new(JsonSerializer), broker.clone()).unwrap();
        logger.start();

        logger.log(&[Reading::at("c", 1.0, 1)]).await;
        logger.log(&[Reading::at("c", 2.0, 2)]).await;
        assert_eq!(logger.publisher().buffered_messages().await, 2);

        broker.recover();
        assert!(broker.wait_for_deliveries(2, std::time::Duration::from_secs(5)).await);
        let values: Vec<Reading> = broker
            .delivered_payloads()
            .iter()
            .map(|p| serde_json::from_slice(p).unwrap())
            .collect();
        assert_eq!(values[0].value, 1.0);
        assert_eq!(values[1].value, 2.0);
    }
}
