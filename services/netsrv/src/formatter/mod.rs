//! Payload serializers
//!
//! Loggers and drivers refer to a serializer by id (`"json"`, `"ascii"`).
//! The ids are resolved against a `SerializerRegistry` once, when the
//! service is built.

mod ascii;
mod json;

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{NetsrvError, Result};
use crate::reading::Reading;

pub use ascii::AsciiSerializer;
pub use json::JsonSerializer;

/// Turns readings into a message payload
pub trait PayloadSerializer: Send + Sync {
    /// Registry id
    fn id(&self) -> &'static str;

    fn serialize(&self, reading: &Reading) -> Result<Bytes>;

    /// Payload for several readings sharing one topic
    fn serialize_batch(&self, readings: &[&Reading]) -> Result<Bytes>;
}

/// Map of serializer id to serializer
#[derive(Clone, Default)]
pub struct SerializerRegistry {
    serializers: HashMap<String, Arc<dyn PayloadSerializer>>,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `json` and `ascii` serializers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JsonSerializer));
        registry.register(Arc::new(AsciiSerializer));
        registry
    }

    /// Add a serializer, replacing any previous one with the same id
    pub fn register(&mut self, serializer: Arc<dyn PayloadSerializer>) {
        self.serializers
            .insert(serializer.id().to_string(), serializer);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn PayloadSerializer>> {
        self.serializers
            .get(id)
            .cloned()
            .ok_or_else(|| NetsrvError::UnknownSerializer(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.serializers.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.serializers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    struct Raw;

    impl PayloadSerializer for Raw {
        fn id(&self) -> &'static str {
            "raw"
        }

        fn serialize(&self, reading: &Reading) -> Result<Bytes> {
            Ok(Bytes::from(reading.value.to_string()))
        }

        fn serialize_batch(&self, readings: &[&Reading]) -> Result<Bytes> {
            Ok(Bytes::from(readings.len().to_string()))
        }
    }

    #[test]
    fn test_defaults_registered() {
        let registry = SerializerRegistry::with_defaults();
        assert_eq!(registry.ids(), vec!["ascii", "json"]);
        assert_eq!(registry.get("json").unwrap().id(), "json");
    }

    #[test]
    fn test_unknown_serializer() {
        let registry = SerializerRegistry::with_defaults();
        assert!(matches!(
            registry.get("protobuf"),
            Err(NetsrvError::UnknownSerializer(id)) if id == "protobuf"
        ));
    }

    #[test]
    fn test_custom_serializer() {
        let mut registry = SerializerRegistry::new();
        registry.register(Arc::new(Raw));
        assert!(registry.contains("raw"));
        let payload = registry
            .get("raw")
            .unwrap()
            .serialize(&Reading::at("a", 2.5, 0))
            .unwrap();
        assert_eq!(payload, Bytes::from("2.5"));
    }
}
