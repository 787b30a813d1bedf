//! Broker connection abstraction
//!
//! The publisher only needs three things from a transport: a way to send,
//! the current state, and a notification when a lost connection comes back.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::error::SendError;

/// Connection state as observed by publishers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying
    Disconnected,
    /// Initial connection in progress
    Connecting,
    /// Connected and able to send
    Connected,
    /// Connection lost, reconnecting
    Recovering,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Recovering => "recovering",
        };
        f.write_str(s)
    }
}

/// Fired each time the connection becomes usable again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryEvent {
    /// Increments with every successful (re)connect
    pub generation: u64,
}

pub type RecoveryListener = broadcast::Receiver<RecoveryEvent>;

/// Transport used by a `DurablePublisher`.
///
/// Implementations must be shareable between publishers; a connection is
/// typically reused by every publisher that targets the same broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Send one message. Any error means "not delivered".
    async fn send(&self, routing_key: &str, payload: &Bytes) -> Result<(), SendError>;

    fn state(&self) -> ConnectionState;

    /// Subscribe to recovery notifications. Events fired before the call
    /// are not delivered; check `is_connected` after subscribing.
    fn subscribe_recovery(&self) -> RecoveryListener;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// Recovery broadcast shared by connection implementations
#[derive(Debug)]
pub struct RecoverySignal {
    sender: broadcast::Sender<RecoveryEvent>,
    generation: AtomicU64,
}

impl RecoverySignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            sender,
            generation: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> RecoveryListener {
        self.sender.subscribe()
    }

    /// Notify every subscriber. Returns the new generation.
    pub fn notify(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        // No subscribers is fine
        let _ = self.sender.send(RecoveryEvent { generation });
        generation
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for RecoverySignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_reaches_all_subscribers() {
        let signal = RecoverySignal::new();
        let mut a = signal.subscribe();
        let mut b = signal.subscribe();

        assert_eq!(signal.notify(), 1);
        assert_eq!(a.recv().await.unwrap(), RecoveryEvent { generation: 1 });
        assert_eq!(b.recv().await.unwrap(), RecoveryEvent { generation: 1 });
    }

    #[test]
    fn test_notify_without_subscribers() {
        let signal = RecoverySignal::new();
        assert_eq!(signal.notify(), 1);
        assert_eq!(signal.notify(), 2);
        assert_eq!(signal.generation(), 2);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Recovering.to_string(), "recovering");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }
}
