//! MQTT broker connection
//!
//! Wraps a `rumqttc` client. The event loop runs in its own task, reconnects
//! with backoff and fires a recovery event after every successful CONNACK.
//! An optional birth message is published on each connect; the last will is
//! handed to the broker, and with `last_will_always` also sent by the client
//! itself on a clean disconnect. Plain TCP, TLS, WebSocket and secure
//! WebSocket transports are supported.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::connection::{BrokerConnection, ConnectionState, RecoveryListener, RecoverySignal};
use crate::error::{ConfigError, SendError};
use crate::reconnect::{Backoff, ReconnectPolicy};

/// MQTT connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    /// Generated as `netsrv-<uuid>` when not set
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// 0, 1 or 2
    pub qos: u8,
    /// Keep-alive (heartbeat) period
    pub connection_alive_interval_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// Birth message published on every connect
    pub first_will_topic: Option<String>,
    pub first_will_payload: Option<String>,
    /// Published by the broker when this client disappears
    pub last_will_topic: Option<String>,
    pub last_will_payload: Option<String>,
    pub last_will_retain: bool,
    /// Also publish the last will on a clean disconnect
    pub last_will_always: bool,
    /// TLS transport; requires `ca_cert_path`
    pub use_ssl: bool,
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate authentication, both or neither
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// MQTT over WebSocket (`wss` when `use_ssl` is set)
    pub web_socket: bool,
    pub web_socket_path: String,
    /// Bound of the client request channel
    pub request_channel_capacity: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            qos: 1,
            connection_alive_interval_secs: 30,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            first_will_topic: None,
            first_will_payload: None,
            last_will_topic: None,
            last_will_payload: None,
            last_will_retain: false,
            last_will_always: false,
            use_ssl: false,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            web_socket: false,
            web_socket_path: "/mqtt".to_string(),
            request_channel_capacity: 100,
        }
    }
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Missing("mqtt.host".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid("mqtt.port", "must be greater than 0"));
        }
        if self.qos > 2 {
            return Err(ConfigError::invalid("mqtt.qos", "must be 0, 1 or 2"));
        }
        if self.connection_alive_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "mqtt.connection_alive_interval_secs",
                "must be at least 1 second",
            ));
        }
        if self.request_channel_capacity == 0 {
            return Err(ConfigError::invalid(
                "mqtt.request_channel_capacity",
                "must be greater than 0",
            ));
        }
        if self.first_will_payload.is_some() && self.first_will_topic.is_none() {
            return Err(ConfigError::Missing(
                "mqtt.first_will_topic (first_will_payload is set)".to_string(),
            ));
        }
        if self.last_will_payload.is_some() && self.last_will_topic.is_none() {
            return Err(ConfigError::Missing(
                "mqtt.last_will_topic (last_will_payload is set)".to_string(),
            ));
        }
        if self.last_will_always && self.last_will_topic.is_none() {
            return Err(ConfigError::Missing(
                "mqtt.last_will_topic (last_will_always is set)".to_string(),
            ));
        }
        if self.use_ssl && self.ca_cert_path.is_none() {
            return Err(ConfigError::Missing(
                "mqtt.ca_cert_path (SSL is enabled but certificates are not provided)".to_string(),
            ));
        }
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(ConfigError::invalid(
                "mqtt.client_cert_path",
                "client certificate and client key must be given together",
            ));
        }
        if self.web_socket && !self.web_socket_path.starts_with('/') {
            return Err(ConfigError::invalid(
                "mqtt.web_socket_path",
                "must start with '/'",
            ));
        }
        Ok(())
    }

    /// Identity used to share one session between publishers
    pub fn broker_key(&self) -> String {
        format!(
            "{}@{}:{}#{}",
            self.username.as_deref().unwrap_or(""),
            self.host,
            self.port,
            self.client_id.as_deref().unwrap_or("")
        )
    }

    pub fn qos_level(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_config(self.reconnect_initial_ms, self.reconnect_max_ms)
    }

    /// Host for plain/TLS transports, URL for WebSocket transports
    pub fn broker_address(&self) -> String {
        if !self.web_socket {
            return self.host.clone();
        }
        let scheme = if self.use_ssl { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.web_socket_path)
    }

    fn tls_configuration(&self) -> Result<TlsConfiguration, ConfigError> {
        let ca = read_pem("mqtt.ca_cert_path", self.ca_cert_path.as_deref())?;
        let client_auth = match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => Some((
                read_pem("mqtt.client_cert_path", Some(cert))?,
                read_pem("mqtt.client_key_path", Some(key))?,
            )),
            _ => None,
        };
        Ok(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        })
    }

    fn transport(&self) -> Result<Option<Transport>, ConfigError> {
        let tls = if self.use_ssl {
            Some(self.tls_configuration()?)
        } else {
            None
        };
        Ok(match (self.web_socket, tls) {
            (false, None) => None,
            (false, Some(tls)) => Some(Transport::Tls(tls)),
            (true, None) => Some(Transport::Ws),
            (true, Some(tls)) => Some(Transport::Wss(tls)),
        })
    }

    /// Last will as (topic, payload, retain), sent on clean disconnect
    /// when `last_will_always` is set
    fn farewell(&self) -> Option<(String, Bytes, bool)> {
        if !self.last_will_always {
            return None;
        }
        let topic = self.last_will_topic.clone()?;
        let payload = self.last_will_payload.clone().unwrap_or_default();
        Some((topic, Bytes::from(payload), self.last_will_retain))
    }

    fn options(&self, client_id: &str) -> Result<MqttOptions, ConfigError> {
        let mut options = MqttOptions::new(client_id, self.broker_address(), self.port);
        if let Some(transport) = self.transport()? {
            options.set_transport(transport);
        }
        options.set_keep_alive(Duration::from_secs(self.connection_alive_interval_secs));
        options.set_clean_session(true);

        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        if let Some(topic) = &self.last_will_topic {
            let payload = self.last_will_payload.clone().unwrap_or_default();
            options.set_last_will(LastWill::new(
                topic.clone(),
                payload,
                self.qos_level(),
                self.last_will_retain,
            ));
        }
        Ok(options)
    }
}

fn read_pem(field: &str, path: Option<&Path>) -> Result<Vec<u8>, ConfigError> {
    let path = path.ok_or_else(|| ConfigError::Missing(field.to_string()))?;
    std::fs::read(path)
        .map_err(|e| ConfigError::invalid(field, format!("cannot read {}: {}", path.display(), e)))
}

struct ConnectionShared {
    broker: String,
    client: AsyncClient,
    qos: QoS,
    birth: Option<(String, Bytes)>,
    farewell: Option<(String, Bytes, bool)>,
    state: Mutex<ConnectionState>,
    recovery: RecoverySignal,
    closing: AtomicBool,
}

impl ConnectionShared {
    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *self.state.lock(), next)
    }

    fn publish_birth(&self) {
        let Some((topic, payload)) = &self.birth else {
            return;
        };
        match self
            .client
            .try_publish(topic.clone(), self.qos, false, payload.to_vec())
        {
            Ok(()) => debug!(broker = %self.broker, topic = %topic, "Birth message queued"),
            Err(e) => warn!(broker = %self.broker, error = %e, "Failed to publish birth message"),
        }
    }

    fn publish_farewell(&self) {
        let Some((topic, payload, retain)) = &self.farewell else {
            return;
        };
        if *self.state.lock() != ConnectionState::Connected {
            return;
        }
        match self
            .client
            .try_publish(topic.clone(), self.qos, *retain, payload.to_vec())
        {
            Ok(()) => debug!(broker = %self.broker, topic = %topic, "Last will queued before disconnect"),
            Err(e) => warn!(broker = %self.broker, error = %e, "Failed to publish last will"),
        }
    }
}

/// Shared MQTT session implementing [`BrokerConnection`]
pub struct MqttConnection {
    shared: Arc<ConnectionShared>,
    client_id: String,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttConnection {
    /// Create the client and start its event loop. Must be called within a
    /// tokio runtime. Returns immediately; the first connect happens in the
    /// background and is announced as a recovery event.
    pub fn connect(settings: &MqttSettings) -> Result<Arc<Self>, ConfigError> {
        settings.validate()?;

        let client_id = settings
            .client_id
            .clone()
            .unwrap_or_else(|| format!("netsrv-{}", uuid::Uuid::new_v4().simple()));
        let (client, eventloop) = AsyncClient::new(
            settings.options(&client_id)?,
            settings.request_channel_capacity,
        );

        let birth = settings.first_will_topic.clone().map(|topic| {
            let payload = settings.first_will_payload.clone().unwrap_or_default();
            (topic, Bytes::from(payload))
        });
        let shared = Arc::new(ConnectionShared {
            broker: format!("{}:{}", settings.host, settings.port),
            client,
            qos: settings.qos_level(),
            birth,
            farewell: settings.farewell(),
            state: Mutex::new(ConnectionState::Connecting),
            recovery: RecoverySignal::new(),
            closing: AtomicBool::new(false),
        });

        info!(
            broker = %shared.broker,
            client_id = %client_id,
            tls = settings.use_ssl,
            web_socket = settings.web_socket,
            "Connecting to MQTT broker"
        );
        let task = tokio::spawn(run_event_loop(
            Arc::clone(&shared),
            eventloop,
            settings.reconnect_policy(),
        ));

        Ok(Arc::new(Self {
            shared,
            client_id,
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn broker(&self) -> &str {
        &self.shared.broker
    }

    /// Send DISCONNECT and stop the event loop. With `last_will_always` the
    /// last will is published first.
    pub async fn disconnect(&self) {
        self.shared.publish_farewell();
        self.shared.closing.store(true, Ordering::Release);
        if let Err(e) = self.shared.client.try_disconnect() {
            debug!(broker = %self.shared.broker, error = %e, "Disconnect request not queued");
        }

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
        info!(broker = %self.shared.broker, "Disconnected from MQTT broker");
    }

    /// Stop the event loop without a clean DISCONNECT.
    pub fn abort(&self) {
        self.shared.closing.store(true, Ordering::Release);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl BrokerConnection for MqttConnection {
    async fn send(&self, routing_key: &str, payload: &Bytes) -> Result<(), SendError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(SendError::NotConnected(state.to_string()));
        }
        self.shared
            .client
            .publish_bytes(routing_key, self.shared.qos, false, payload.clone())
            .await
            .map_err(|e| SendError::Transport(e.to_string()))
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    fn subscribe_recovery(&self) -> RecoveryListener {
        self.shared.recovery.subscribe()
    }
}

async fn run_event_loop(
    shared: Arc<ConnectionShared>,
    mut eventloop: EventLoop,
    policy: ReconnectPolicy,
) {
    let mut backoff = Backoff::new(policy);
    let mut ever_connected = false;

    loop {
        let lost = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    backoff.reset();
                    ever_connected = true;
                    shared.set_state(ConnectionState::Connected);
                    shared.publish_birth();
                    let generation = shared.recovery.notify();
                    info!(broker = %shared.broker, generation, "Connected to MQTT broker");
                    None
                } else {
                    Some(format!("connection refused: {:?}", ack.code))
                }
            },
            Ok(Event::Incoming(Packet::Disconnect)) => Some("broker sent DISCONNECT".to_string()),
            Ok(Event::Outgoing(Outgoing::Disconnect)) if shared.closing.load(Ordering::Acquire) => {
                break;
            },
            Ok(event) => {
                trace!(broker = %shared.broker, ?event, "MQTT event");
                None
            },
            Err(e) => Some(e.to_string()),
        };

        let Some(reason) = lost else {
            continue;
        };
        if shared.closing.load(Ordering::Acquire) {
            break;
        }

        let next = if ever_connected {
            ConnectionState::Recovering
        } else {
            ConnectionState::Connecting
        };
        let previous = shared.set_state(next);
        let delay = backoff.next_delay();
        if previous == ConnectionState::Connected {
            warn!(broker = %shared.broker, reason = %reason, "MQTT connection lost");
        }
        debug!(
            broker = %shared.broker,
            attempt = backoff.attempt(),
            retry_in = ?delay,
            reason = %reason,
            "MQTT reconnect scheduled"
        );
        tokio::time::sleep(delay).await;
    }
    debug!(broker = %shared.broker, "MQTT event loop stopped");
}
