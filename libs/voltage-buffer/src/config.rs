//! Buffer configuration and persistence directory ownership

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::ConfigError;

/// Per-publisher buffer configuration
///
/// `max_buffer_bytes == 0 && max_segments == 0` is the "buffering disabled"
/// configuration: failed sends are dropped with an error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// RAM cap for the memory queue, in payload bytes
    pub max_buffer_bytes: u64,
    /// Size at which the overflow store starts a new segment file
    pub max_segment_bytes: u64,
    /// Number of segment files retained; 0 disables file overflow
    pub max_segments: usize,
    /// Directory owned exclusively by this publisher
    pub persistence_directory: Option<PathBuf>,
    /// Upper bound for a single send attempt
    pub send_timeout_ms: u64,
    /// Messages replayed between recovery pauses; 0 disables throttling
    pub recovery_chunk_size: usize,
    /// Pause after each replayed chunk
    pub recovery_delay_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 1024 * 1024,
            max_segment_bytes: 2 * 1024 * 1024,
            max_segments: 0,
            persistence_directory: None,
            send_timeout_ms: 5_000,
            recovery_chunk_size: 0,
            recovery_delay_ms: 0,
        }
    }
}

impl BufferConfig {
    /// RAM-only buffer with drop-oldest backpressure
    pub fn memory_only(max_buffer_bytes: u64) -> Self {
        Self {
            max_buffer_bytes,
            ..Default::default()
        }
    }

    /// RAM buffer that spills into `max_segments` rotating segment files
    pub fn with_overflow(
        max_buffer_bytes: u64,
        directory: impl Into<PathBuf>,
        max_segments: usize,
        max_segment_bytes: u64,
    ) -> Self {
        Self {
            max_buffer_bytes,
            max_segment_bytes,
            max_segments,
            persistence_directory: Some(directory.into()),
            ..Default::default()
        }
    }

    pub fn overflow_enabled(&self) -> bool {
        self.max_segments > 0 && self.max_buffer_bytes > 0
    }

    pub fn buffering_disabled(&self) -> bool {
        self.max_buffer_bytes == 0
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_buffer_bytes == 0 && self.max_segments > 0 {
            return Err(ConfigError::invalid(
                "max_buffer_bytes",
                "must be greater than 0 when file overflow is configured (max_segments > 0)",
            ));
        }

        if self.max_segments > 0 {
            if self.persistence_directory.is_none() {
                return Err(ConfigError::Missing(
                    "persistence_directory (required when max_segments > 0)".to_string(),
                ));
            }
            if self.max_segment_bytes == 0 {
                return Err(ConfigError::invalid(
                    "max_segment_bytes",
                    "must be greater than 0 when max_segments > 0",
                ));
            }
        }

        if self.persistence_directory.is_some()
            && self.max_segments == 0
            && self.max_buffer_bytes > 0
        {
            return Err(ConfigError::invalid(
                "max_segments",
                "zero segment count with a nonzero buffer size while persistence_directory is set",
            ));
        }

        if self.send_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "send_timeout_ms",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

// ============================================================================
// Persistence directory ownership
// ============================================================================

static CLAIMED_DIRECTORIES: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();

fn claimed() -> &'static Mutex<HashSet<PathBuf>> {
    CLAIMED_DIRECTORIES.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive ownership of a persistence directory within this process.
///
/// Released on drop. Two publishers pointing at the same directory (after
/// path normalization) is a configuration error.
#[derive(Debug)]
pub struct DirectoryClaim {
    path: PathBuf,
}

impl DirectoryClaim {
    pub fn acquire(directory: &Path) -> Result<Self, ConfigError> {
        let path = normalize(directory)?;
        let mut set = claimed().lock();
        if !set.insert(path.clone()) {
            return Err(ConfigError::DirectoryInUse(path));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirectoryClaim {
    fn drop(&mut self) {
        claimed().lock().remove(&self.path);
    }
}

fn normalize(directory: &Path) -> Result<PathBuf, ConfigError> {
    if let Ok(canonical) = directory.canonicalize() {
        return Ok(canonical);
    }
    std::path::absolute(directory).map_err(|e| {
        ConfigError::invalid(
            "persistence_directory",
            format!("cannot resolve {}: {}", directory.display(), e),
        )
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_default_is_memory_only() {
        let config = BufferConfig::default();
        assert!(!config.overflow_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overflow_enabled_requires_both_limits() {
        let config = BufferConfig::with_overflow(100, "/tmp/buf", 3, 1024);
        assert!(config.overflow_enabled());

        let config = BufferConfig::memory_only(100);
        assert!(!config.overflow_enabled());
    }

    #[test]
    fn test_disabled_buffer_is_accepted() {
        let config = BufferConfig::memory_only(0);
        assert!(config.buffering_disabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_buffer_with_segments_rejected() {
        let config = BufferConfig::with_overflow(0, "/tmp/buf", 3, 1024);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "max_buffer_bytes"));
    }

    #[test]
    fn test_segments_without_directory_rejected() {
        let config = BufferConfig {
            max_segments: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn test_zero_segments_with_directory_rejected() {
        let config = BufferConfig::with_overflow(1024, "/tmp/buf", 0, 1024);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "max_segments"));
    }

    #[test]
    fn test_zero_segment_size_rejected() {
        let config = BufferConfig::with_overflow(1024, "/tmp/buf", 2, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: BufferConfig = serde_json::from_str(
            r#"{"max_buffer_bytes": 2048, "max_segments": 4, "persistence_directory": "/data/buf"}"#,
        )
        .unwrap();
        assert_eq!(config.max_buffer_bytes, 2048);
        assert_eq!(config.max_segments, 4);
        assert_eq!(config.max_segment_bytes, 2 * 1024 * 1024);
        assert_eq!(config.send_timeout_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_directory_claim_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let claim = DirectoryClaim::acquire(dir.path()).unwrap();

        let second = DirectoryClaim::acquire(dir.path());
        assert!(matches!(second, Err(ConfigError::DirectoryInUse(_))));

        drop(claim);
        assert!(DirectoryClaim::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_directory_claim_normalizes_paths() {
        let dir = tempfile::tempdir().unwrap();
        let _claim = DirectoryClaim::acquire(dir.path()).unwrap();

        let aliased = dir.path().join("sub").join("..");
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        assert!(DirectoryClaim::acquire(&aliased).is_err());
    }
}
