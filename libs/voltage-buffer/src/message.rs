//! Outbound message type

use bytes::Bytes;

/// A message waiting to be published under a routing key (topic or queue name).
///
/// Immutable once created. `Bytes` keeps clones cheap when a message moves
/// between the send path and the buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    routing_key: String,
    payload: Bytes,
}

impl OutboundMessage {
    pub fn new(routing_key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload: payload.into(),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload size in bytes. Only the payload counts against buffer limits.
    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn into_parts(self) -> (String, Bytes) {
        (self.routing_key, self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_len_ignores_routing_key() {
        let msg = OutboundMessage::new("a/very/long/routing/key", Bytes::from_static(b"1234"));
        assert_eq!(msg.payload_len(), 4);
    }

    #[test]
    fn test_into_parts() {
        let msg = OutboundMessage::new("meter/1", b"42.0".to_vec());
        let (key, payload) = msg.into_parts();
        assert_eq!(key, "meter/1");
        assert_eq!(payload, Bytes::from_static(b"42.0"));
    }
}
