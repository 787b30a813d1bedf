//! Telemetry readings and the line-oriented input format
//!
//! Each input line is one JSON document:
//! - a single reading: `{"channel": "pv.power", "value": 12.5}`
//! - one logging cycle: `[{"channel": ...}, {"channel": ...}]`
//! - a channel write for a driver:
//!   `{"write": {"driver": "plc", "channel": "setpoint", "value": 3.0}}`

use serde::{Deserialize, Serialize};

use crate::error::{NetsrvError, Result};

/// One channel value at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub channel: String,
    pub value: f64,
    /// Unix time in milliseconds; filled in on parse when absent
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl Reading {
    pub fn new(channel: impl Into<String>, value: f64) -> Self {
        Self {
            channel: channel.into(),
            value,
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
        }
    }

    pub fn at(channel: impl Into<String>, value: f64, timestamp: i64) -> Self {
        Self {
            channel: channel.into(),
            value,
            timestamp: Some(timestamp),
        }
    }

    fn stamp(&mut self, now: i64) {
        if self.timestamp.is_none() {
            self.timestamp = Some(now);
        }
    }
}

/// A value written to a driver channel
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelWrite {
    pub driver: String,
    pub channel: String,
    pub value: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLine {
    Write { write: ChannelWrite },
    Cycle(Vec<Reading>),
    Single(Reading),
}

/// A parsed input line
#[derive(Debug, Clone, PartialEq)]
pub enum InputLine {
    /// Readings of one logging cycle
    Cycle(Vec<Reading>),
    Write(ChannelWrite),
}

impl InputLine {
    /// Parse one line. Readings without a timestamp get the current time.
    pub fn parse(line: &str) -> Result<Self> {
        let raw: RawLine = serde_json::from_str(line.trim())
            .map_err(|e| NetsrvError::InputError(e.to_string()))?;

        let now = chrono::Utc::now().timestamp_millis();
        Ok(match raw {
            RawLine::Write { write } => InputLine::Write(write),
            RawLine::Single(mut reading) => {
                reading.stamp(now);
                InputLine::Cycle(vec![reading])
            },
            RawLine::Cycle(mut readings) => {
                readings.iter_mut().for_each(|r| r.stamp(now));
                InputLine::Cycle(readings)
            },
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_reading() {
        let line = InputLine::parse(r#"{"channel": "pv.power", "value": 12.5, "timestamp": 1000}"#)
            .unwrap();
        assert_eq!(line, InputLine::Cycle(vec![Reading::at("pv.power", 12.5, 1000)]));
    }

    #[test]
    fn test_parse_cycle_fills_timestamps() {
        let line = InputLine::parse(
            r#"[{"channel": "a", "value": 1}, {"channel": "b", "value": 2, "timestamp": 5}]"#,
        )
        .unwrap();
        let InputLine::Cycle(readings) = line else {
            panic!("expected a cycle");
        };
        assert_eq!(readings.len(), 2);
        assert!(readings[0].timestamp.unwrap() > 5);
        assert_eq!(readings[1].timestamp, Some(5));
    }

    #[test]
    fn test_parse_write() {
        let line =
            InputLine::parse(r#"{"write": {"driver": "plc", "channel": "sp", "value": 3.0}}"#)
                .unwrap();
        assert_eq!(
            line,
            InputLine::Write(ChannelWrite {
                driver: "plc".to_string(),
                channel: "sp".to_string(),
                value: 3.0,
            })
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            InputLine::parse("not json"),
            Err(NetsrvError::InputError(_))
        ));
        assert!(matches!(
            InputLine::parse(r#"{"value": 1}"#),
            Err(NetsrvError::InputError(_))
        ));
    }
}
