use bytes::Bytes;
use std::fmt::Write;

use crate::error::{NetsrvError, Result};
use crate::formatter::PayloadSerializer;
use crate::reading::Reading;

/// Plain text, one `channel: value @ timestamp` line per reading
pub struct AsciiSerializer;

fn write_line(output: &mut String, reading: &Reading) -> Result<()> {
    match reading.timestamp {
        Some(ts) => writeln!(output, "{}: {} @ {}", reading.channel, reading.value, ts),
        None => writeln!(output, "{}: {}", reading.channel, reading.value),
    }
    .map_err(|e| NetsrvError::FormatError(format!("ASCII formatting error: {}", e)))
}

impl PayloadSerializer for AsciiSerializer {
    fn id(&self) -> &'static str {
        "ascii"
    }

    fn serialize(&self, reading: &Reading) -> Result<Bytes> {
        let mut output = String::new();
        write_line(&mut output, reading)?;
        Ok(Bytes::from(output))
    }

    fn serialize_batch(&self, readings: &[&Reading]) -> Result<Bytes> {
        let mut output = String::new();
        for reading in readings {
            write_line(&mut output, reading)?;
        }
        Ok(Bytes::from(output))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        let payload = AsciiSerializer
            .serialize(&Reading::at("grid.freq", 50.01, 42))
            .unwrap();
        assert_eq!(payload, Bytes::from("grid.freq: 50.01 @ 42\n"));
    }

    #[test]
    fn test_missing_timestamp() {
        let reading = Reading {
            channel: "x".to_string(),
            value: 1.0,
            timestamp: None,
        };
        assert_eq!(
            AsciiSerializer.serialize(&reading).unwrap(),
            Bytes::from("x: 1\n")
        );
    }

    #[test]
    fn test_batch_lines() {
        let a = Reading::at("a", 1.5, 1);
        let b = Reading::at("b", -2.0, 2);
        let payload = AsciiSerializer.serialize_batch(&[&a, &b]).unwrap();
        assert_eq!(payload, Bytes::from("a: 1.5 @ 1\nb: -2 @ 2\n"));
    }
}
