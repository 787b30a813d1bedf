//! VoltageEMS Durable Publish Buffer
//!
//! Reliability layer between components that emit telemetry to a remote
//! message broker and a broker connection that is frequently unavailable.
//!
//! # Key Components
//!
//! - **MemoryQueue**: bounded FIFO of pending messages, tracked by byte size
//! - **OverflowStore**: rotating on-disk segment log that survives restarts
//! - **BrokerConnection**: transport trait exposing state and recovery events
//! - **DurablePublisher**: direct send, fall back to buffering, ordered replay
//!
//! Replay order per publisher is: overflow store (oldest segment first), then
//! the memory queue. A spill always empties the memory queue completely, so
//! everything left in memory is newer than everything on disk.

pub mod config;

pub mod connection;

pub mod error;

pub mod memory_queue;

pub mod message;

pub mod overflow;

pub mod publisher;

pub mod reconnect;

#[cfg(feature = "mqtt")]
pub mod mqtt;

#[cfg(feature = "mqtt")]
pub mod registry;

pub mod test_utils;

// Re-exports
pub use bytes::Bytes;

pub use config::{BufferConfig, DirectoryClaim};
pub use connection::{BrokerConnection, ConnectionState, RecoveryEvent, RecoveryListener, RecoverySignal};
pub use error::{BufferError, ConfigError, Result, SendError, StoreError};
pub use memory_queue::MemoryQueue;
pub use message::OutboundMessage;
pub use overflow::{OverflowStore, SegmentDrain, SegmentId};
pub use publisher::{DurablePublisher, PublisherStats, PublisherStatsSnapshot};
pub use reconnect::{Backoff, ReconnectPolicy};

#[cfg(feature = "mqtt")]
pub use mqtt::{MqttConnection, MqttSettings};

#[cfg(feature = "mqtt")]
pub use registry::{ConnectionLease, ConnectionRegistry};
