//! `VoltageEMS` basic library (basic library)
//!
//! Provides the plumbing shared by all services:
//! - logging initialisation
//! - configuration file loading with environment overrides
//! - shutdown signal handling

pub mod config_loader;
pub mod logging;
pub mod shutdown;

pub use config_loader::{load_config_from_file, ConfigLoadError};
pub use logging::{LogConfig, LoggingError};
pub use shutdown::{wait_for_shutdown, ShutdownSignal};
