//! Test utilities for voltage-buffer
//!
//! Provides an in-memory broker connection for unit and integration tests,
//! in this crate and in services built on it.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::connection::{BrokerConnection, ConnectionState, RecoveryListener, RecoverySignal};
use crate::error::SendError;
use crate::message::OutboundMessage;

#[derive(Debug)]
struct MockState {
    connection: ConnectionState,
    /// Sends that fail before the next success
    fail_next: usize,
    /// Successful sends left before the connection drops by itself
    drop_after: Option<usize>,
    send_delay: Duration,
}

/// Scriptable broker connection
///
/// Records every delivered message. The connection can be taken down,
/// brought back (firing a recovery event), made to reject individual sends
/// or to drop after a number of deliveries.
#[derive(Debug)]
pub struct MockBrokerConnection {
    state: Mutex<MockState>,
    delivered: Mutex<Vec<OutboundMessage>>,
    delivery_notify: Notify,
    recovery: RecoverySignal,
}

impl MockBrokerConnection {
    fn with_state(connection: ConnectionState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                connection,
                fail_next: 0,
                drop_after: None,
                send_delay: Duration::ZERO,
            }),
            delivered: Mutex::new(Vec::new()),
            delivery_notify: Notify::new(),
            recovery: RecoverySignal::new(),
        })
    }

    pub fn new_connected() -> Arc<Self> {
        Self::with_state(ConnectionState::Connected)
    }

    pub fn new_disconnected() -> Arc<Self> {
        Self::with_state(ConnectionState::Connecting)
    }

    /// Lose the connection
    pub fn go_down(&self) {
        self.state.lock().connection = ConnectionState::Recovering;
    }

    /// Mark connected without firing a recovery event
    pub fn go_up(&self) {
        self.state.lock().connection = ConnectionState::Connected;
    }

    /// Reconnect and notify recovery listeners
    pub fn recover(&self) {
        self.go_up();
        self.recovery.notify();
    }

    /// Make the next `count` sends fail while staying connected
    pub fn fail_next(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    /// Go down automatically after `count` more successful sends
    pub fn drop_after(&self, count: usize) {
        self.state.lock().drop_after = Some(count);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.state.lock().send_delay = delay;
    }

    pub fn delivered(&self) -> Vec<OutboundMessage> {
        self.delivered.lock().clone()
    }

    pub fn delivered_keys(&self) -> Vec<String> {
        self.delivered
            .lock()
            .iter()
            .map(|m| m.routing_key().to_string())
            .collect()
    }

    pub fn delivered_payloads(&self) -> Vec<Bytes> {
        self.delivered
            .lock()
            .iter()
            .map(|m| m.payload().clone())
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.recovery.subscriber_count()
    }

    /// Wait until at least `count` messages were delivered. Returns false on timeout.
    pub async fn wait_for_deliveries(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.delivery_notify.notified();
                if self.delivered.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[async_trait]
impl BrokerConnection for MockBrokerConnection {
    async fn send(&self, routing_key: &str, payload: &Bytes) -> Result<(), SendError> {
        let delay = self.state.lock().send_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        {
            let mut state = self.state.lock();
            if state.connection != ConnectionState::Connected {
                return Err(SendError::NotConnected(state.connection.to_string()));
            }
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(SendError::Rejected("scripted failure".to_string()));
            }
            if let Some(left) = state.drop_after.as_mut() {
                if *left == 0 {
                    state.connection = ConnectionState::Recovering;
                    state.drop_after = None;
                    return Err(SendError::NotConnected("connection dropped".to_string()));
                }
                *left -= 1;
            }
        }

        self.delivered
            .lock()
            .push(OutboundMessage::new(routing_key, payload.clone()));
        self.delivery_notify.notify_waiters();
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    fn subscribe_recovery(&self) -> RecoveryListener {
        self.recovery.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_requires_connection() {
        let conn = MockBrokerConnection::new_disconnected();
        let result = conn.send("a", &Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(SendError::NotConnected(_))));

        conn.go_up();
        conn.send("a", &Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(conn.delivered_keys(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_drop_after_goes_down() {
        let conn = MockBrokerConnection::new_connected();
        conn.drop_after(1);

        conn.send("a", &Bytes::new()).await.unwrap();
        assert!(conn.send("b", &Bytes::new()).await.is_err());
        assert_eq!(conn.state(), ConnectionState::Recovering);
    }

    #[tokio::test]
    async fn test_recover_notifies() {
        let conn = MockBrokerConnection::new_disconnected();
        let mut listener = conn.subscribe_recovery();
        conn.recover();

        assert_eq!(listener.recv().await.unwrap().generation, 1);
        assert!(conn.is_connected());
    }
}
