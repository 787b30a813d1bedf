use bytes::Bytes;

use crate::error::Result;
use crate::formatter::PayloadSerializer;
use crate::reading::Reading;

/// `{"channel":..,"value":..,"timestamp":..}`, batches as a JSON array
pub struct JsonSerializer;

impl PayloadSerializer for JsonSerializer {
    fn id(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, reading: &Reading) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(reading)?))
    }

    fn serialize_batch(&self, readings: &[&Reading]) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(readings)?))
    }
}
