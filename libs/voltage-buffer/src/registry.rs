//! Shared MQTT sessions
//!
//! Publishers that target the same broker (same `MqttSettings::broker_key`)
//! share one `MqttConnection`. The registry is owned by the service and
//! counts leases explicitly; the session is closed when the last lease is
//! released.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::connection::BrokerConnection;
use crate::error::ConfigError;
use crate::mqtt::{MqttConnection, MqttSettings};

struct Entry {
    connection: Arc<MqttConnection>,
    leases: usize,
}

/// Reference-counted map of broker key to MQTT session
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the session for `settings`, connecting on first use.
    ///
    /// Settings that only differ in will messages or timeouts still share
    /// the first session created for that broker key.
    pub fn acquire(self: &Arc<Self>, settings: &MqttSettings) -> Result<ConnectionLease, ConfigError> {
        let key = settings.broker_key();
        let mut entries = self.entries.lock();

        let connection = match entries.get_mut(&key) {
            Some(entry) => {
                entry.leases += 1;
                debug!(broker = %key, leases = entry.leases, "Reusing MQTT session");
                Arc::clone(&entry.connection)
            },
            None => {
                let connection = MqttConnection::connect(settings)?;
                entries.insert(
                    key.clone(),
                    Entry {
                        connection: Arc::clone(&connection),
                        leases: 1,
                    },
                );
                connection
            },
        };

        Ok(ConnectionLease {
            registry: Arc::clone(self),
            key,
            connection: Some(connection),
        })
    }

    /// Number of distinct sessions
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn lease_count(&self, settings: &MqttSettings) -> usize {
        self.entries
            .lock()
            .get(&settings.broker_key())
            .map_or(0, |e| e.leases)
    }

    /// Drop one lease; returns the session if it was the last one.
    fn release_key(&self, key: &str) -> Option<Arc<MqttConnection>> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        entry.leases = entry.leases.saturating_sub(1);
        if entry.leases > 0 {
            return None;
        }
        entries.remove(key).map(|e| e.connection)
    }
}

/// A counted handle to a shared session
pub struct ConnectionLease {
    registry: Arc<ConnectionRegistry>,
    key: String,
    connection: Option<Arc<MqttConnection>>,
}

impl ConnectionLease {
    pub fn connection(&self) -> Option<&Arc<MqttConnection>> {
        self.connection.as_ref()
    }

    /// Connection as the trait object publishers take
    pub fn broker_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.connection
            .as_ref()
            .map(|c| Arc::clone(c) as Arc<dyn BrokerConnection>)
    }

    /// Give the lease back. The last lease disconnects cleanly.
    pub async fn release(mut self) {
        if self.connection.take().is_none() {
            return;
        }
        if let Some(connection) = self.registry.release_key(&self.key) {
            info!(broker = %self.key, "Last lease released, closing MQTT session");
            connection.disconnect().await;
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.connection.take().is_none() {
            return;
        }
        if let Some(connection) = self.registry.release_key(&self.key) {
            debug!(broker = %self.key, "Last lease dropped, aborting MQTT session");
            connection.abort();
        }
    }
}
