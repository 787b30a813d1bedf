//! Shared plumbing of loggers and drivers: one durable publisher, one
//! serializer and the topic mapping of one configured endpoint.

use std::sync::Arc;
use tracing::{error, info};
use voltage_buffer::{BrokerConnection, DurablePublisher, PublisherStatsSnapshot};

use crate::config::EndpointConfig;
use crate::error::Result;
use crate::formatter::PayloadSerializer;
use crate::reading::Reading;

pub(crate) struct OutboundEndpoint {
    config: EndpointConfig,
    serializer: Arc<dyn PayloadSerializer>,
    publisher: DurablePublisher,
}

impl OutboundEndpoint {
    pub(crate) fn new(
        kind: &str,
        config: EndpointConfig,
        serializer: Arc<dyn PayloadSerializer>,
        connection: Arc<dyn BrokerConnection>,
    ) -> Result<Self> {
        let pid = format!("{}:{}", kind, config.name);
        let publisher = DurablePublisher::new(pid, config.buffer.clone(), connection)?;
        info!(
            "{} '{}' ready (serializer {}, broker {}:{})",
            kind,
            config.name,
            serializer.id(),
            config.mqtt.host,
            config.mqtt.port
        );
        Ok(Self {
            config,
            serializer,
            publisher,
        })
    }

    pub(crate) fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub(crate) fn publisher(&self) -> &DurablePublisher {
        &self.publisher
    }

    pub(crate) fn start(&self) {
        self.publisher.start();
    }

    pub(crate) async fn shutdown(&self) {
        self.publisher.shutdown().await;
    }

    pub(crate) fn stats(&self) -> PublisherStatsSnapshot {
        self.publisher.stats().snapshot()
    }

    /// Serialize and publish a single reading on its channel topic
    pub(crate) async fn publish_reading(&self, reading: &Reading) -> Result<()> {
        let payload = self.serializer.serialize(reading)?;
        self.publisher
            .publish(self.config.topic_for(&reading.channel), payload)
            .await;
        Ok(())
    }

    /// Publish several readings as one message on `topic`. Serializer
    /// failures are logged; nothing is published for that batch.
    pub(crate) async fn publish_batch(&self, topic: String, readings: &[&Reading]) -> bool {
        match self.serializer.serialize_batch(readings) {
            Ok(payload) => {
                self.publisher.publish(topic, payload).await;
                true
            },
            Err(e) => {
                error!(
                    "{}: failed to serialize {} readings for {}: {}",
                    self.config.name,
                    readings.len(),
                    topic,
                    e
                );
                false
            },
        }
    }
}
