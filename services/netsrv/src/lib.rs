//! Network Service (netsrv)
//!
//! Forwards telemetry readings and channel writes to MQTT brokers. Every
//! logger and driver publishes through its own `DurablePublisher`, so data
//! produced during a broker outage is buffered in memory, spilled to disk
//! when the memory cap is reached, and replayed in order on reconnect.

pub mod config;
pub mod driver;
pub mod error;
pub mod formatter;
pub mod logger;
mod outbound;
pub mod reading;
pub mod service;

pub use config::{EndpointConfig, LoggingSettings, NetsrvConfig};
pub use driver::TelemetryDriver;
pub use error::{NetsrvError, Result};
pub use formatter::{PayloadSerializer, SerializerRegistry};
pub use logger::TelemetryLogger;
pub use reading::{ChannelWrite, InputLine, Reading};
pub use service::NetworkService;
