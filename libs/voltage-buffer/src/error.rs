//! Error types for voltage-buffer
//!
//! None of these reach producer code through `DurablePublisher::publish`;
//! they surface from constructors and from the store/transport layers, where
//! the publisher converts them into buffering or a logged, bounded loss.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid buffer or transport configuration, rejected at construction time
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Missing required configuration: {0}")]
    Missing(String),

    #[error("Persistence directory {0} is already owned by another publisher")]
    DirectoryInUse(PathBuf),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Overflow store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Record of {size} bytes exceeds segment limit of {limit} bytes")]
    RecordTooLarge { size: u64, limit: u64 },

    #[error("Corrupt record in {segment} at offset {offset}: {reason} ({lost_records} records lost)")]
    Corrupt {
        segment: String,
        offset: u64,
        reason: String,
        /// Records from the damaged one to the end of the segment
        lost_records: u64,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The file behind this error no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// A single failed send attempt. The publisher treats every variant the same:
/// the message is buffered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Not connected to broker: {0}")]
    NotConnected(String),

    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    #[error("Destination rejected: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Top-level error for voltage-buffer
#[derive(Error, Debug)]
pub enum BufferError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Send(#[from] SendError),
}

pub type Result<T> = std::result::Result<T, BufferError>;

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("max_segments", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: max_segments: must be greater than 0"
        );
    }

    #[test]
    fn test_directory_in_use_display() {
        let err = ConfigError::DirectoryInUse(PathBuf::from("/var/lib/netsrv/buffer"));
        assert!(err.to_string().contains("/var/lib/netsrv/buffer"));
    }

    #[test]
    fn test_record_too_large_display() {
        let err = StoreError::RecordTooLarge {
            size: 4096,
            limit: 1024,
        };
        assert_eq!(
            err.to_string(),
            "Record of 4096 bytes exceeds segment limit of 1024 bytes"
        );
    }

    #[test]
    fn test_not_found_detection() {
        let gone = StoreError::io("/tmp/x", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(gone.is_not_found());
        let denied = StoreError::io("/tmp/x", std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!denied.is_not_found());
    }

    #[test]
    fn test_send_timeout_display() {
        let err = SendError::Timeout(Duration::from_millis(500));
        assert_eq!(err.to_string(), "Send timed out after 500ms");
    }

    #[test]
    fn test_buffer_error_from_store() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: BufferError = StoreError::io("/tmp/x", io).into();
        assert!(matches!(err, BufferError::Store(StoreError::Io { .. })));
        assert!(err.to_string().contains("denied"));
    }
}
