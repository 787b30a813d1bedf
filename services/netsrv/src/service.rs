//! Network service
//!
//! Owns the MQTT connection registry, one lease per endpoint and the
//! loggers/drivers built on top of them. Lifecycle is explicit:
//! `connect` → `start` → `handle_line`/`log_cycle`/`write` → `shutdown`.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use voltage_buffer::{BrokerConnection, ConnectionLease, ConnectionRegistry, MqttSettings};

use crate::config::NetsrvConfig;
use crate::driver::TelemetryDriver;
use crate::error::{NetsrvError, Result};
use crate::formatter::SerializerRegistry;
use crate::logger::TelemetryLogger;
use crate::reading::{InputLine, Reading};

pub struct NetworkService {
    loggers: Vec<TelemetryLogger>,
    drivers: HashMap<String, TelemetryDriver>,
    leases: Vec<ConnectionLease>,
}

impl NetworkService {
    /// Build every enabled endpoint on sessions from `registry`.
    /// Endpoints with the same broker share one session.
    pub fn connect(
        config: &NetsrvConfig,
        serializers: &SerializerRegistry,
        registry: &Arc<ConnectionRegistry>,
    ) -> Result<Self> {
        let mut leases = Vec::new();
        let mut service = Self::build(config, serializers, |settings| {
            let lease = registry.acquire(settings)?;
            let connection = lease
                .broker_connection()
                .ok_or_else(|| NetsrvError::ConfigError("released lease".to_string()))?;
            leases.push(lease);
            Ok(connection)
        })?;
        service.leases = leases;
        info!(
            "Network service: {} loggers, {} drivers, {} broker sessions",
            service.loggers.len(),
            service.drivers.len(),
            registry.len()
        );
        Ok(service)
    }

    /// Build every enabled endpoint, taking connections from `connect`
    pub fn build<F>(config: &NetsrvConfig, serializers: &SerializerRegistry, mut connect: F) -> Result<Self>
    where
        F: FnMut(&MqttSettings) -> Result<Arc<dyn BrokerConnection>>,
    {
        config.validate(serializers)?;

        let mut loggers = Vec::new();
        for endpoint in config.enabled_loggers() {
            let serializer = serializers.get(&endpoint.serializer)?;
            let connection = connect(&endpoint.mqtt)?;
            loggers.push(TelemetryLogger::new(endpoint.clone(), serializer, connection)?);
        }

        let mut drivers = HashMap::new();
        for endpoint in config.enabled_drivers() {
            let serializer = serializers.get(&endpoint.serializer)?;
            let connection = connect(&endpoint.mqtt)?;
            drivers.insert(
                endpoint.name.clone(),
                TelemetryDriver::new(endpoint.clone(), serializer, connection)?,
            );
        }

        if loggers.is_empty() && drivers.is_empty() {
            warn!("No logger or driver enabled, input will be discarded");
        }

        Ok(Self {
            loggers,
            drivers,
            leases: Vec::new(),
        })
    }

    /// Start recovery handling of every publisher
    pub fn start(&self) {
        self.loggers.iter().for_each(TelemetryLogger::start);
        self.drivers.values().for_each(TelemetryDriver::start);
    }

    pub fn loggers(&self) -> &[TelemetryLogger] {
        &self.loggers
    }

    pub fn driver(&self, name: &str) -> Option<&TelemetryDriver> {
        self.drivers.get(name)
    }

    /// Hand one cycle to every logger
    pub async fn log_cycle(&self, readings: &[Reading]) {
        for logger in &self.loggers {
            logger.log(readings).await;
        }
    }

    pub async fn write(&self, driver: &str, channel: &str, value: f64) -> Result<()> {
        self.drivers
            .get(driver)
            .ok_or_else(|| NetsrvError::UnknownDriver(driver.to_string()))?
            .write(channel, value)
            .await
    }

    /// Process one input line; bad lines are logged and skipped
    pub async fn handle_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let result = match InputLine::parse(line) {
            Ok(InputLine::Cycle(readings)) => {
                self.log_cycle(&readings).await;
                Ok(())
            },
            Ok(InputLine::Write(w)) => self.write(&w.driver, &w.channel, w.value).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!("Input line skipped: {}", e);
        }
    }

    /// Flush every publisher, then release the broker sessions
    pub async fn shutdown(self) {
        for logger in &self.loggers {
            logger.shutdown().await;
        }
        for driver in self.drivers.values() {
            driver.shutdown().await;
        }
        for lease in self.leases {
            lease.release().await;
        }
        info!("Network service stopped");
    }
}
