// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Canonical event model: log lines and metric samples with labels and a timestamp.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_FIELDS, MAX_FIELD_VALUE_BYTES, MAX_MESSAGE_BYTES};
use crate::errors::{ParseError, QueryError};
use crate::labels::LabelSet;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Inclusive time range `[start, end]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self, QueryError> {
        if start > end {
            return Err(QueryError::InvalidTimeRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, timestamp: Timestamp) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Log,
    Counter,
    Gauge,
    Histogram,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Log => "log",
            EventKind::Counter => "counter",
            EventKind::Gauge => "gauge",
            EventKind::Histogram => "histogram",
        };
        f.write_str(s)
    }
}

/// A primitive structured field value. Nesting is not representable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// Structured fields attached to a log line: at most [`MAX_FIELDS`] entries, string values at
/// most [`MAX_FIELD_VALUE_BYTES`] long.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fields(BTreeMap<String, FieldValue>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert; bounds are checked by [`Fields::validate`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn validate(&self) -> Result<(), ParseError> {
        if self.0.len() > MAX_FIELDS {
            return Err(ParseError::TooManyFields(MAX_FIELDS));
        }
        for (key, value) in &self.0 {
            let oversized = key.len() > MAX_FIELD_VALUE_BYTES
                || matches!(value, FieldValue::Str(s) if s.len() > MAX_FIELD_VALUE_BYTES);
            if oversized {
                return Err(ParseError::FieldTooLarge(key.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: Timestamp,
    pub labels: LabelSet,
    pub message: String,
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub fields: Fields,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Log { message: String, fields: Fields },
    /// Increment of a counter.
    Counter(f64),
    /// Counter restart marker (e.g. the producing process restarted).
    CounterReset,
    Gauge(f64),
    /// One histogram observation.
    Histogram(f64),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub timestamp: Timestamp,
    pub labels: LabelSet,
    pub payload: Payload,
}

impl Event {
    pub fn log(timestamp: Timestamp, labels: LabelSet, message: String, fields: Fields) -> Self {
        Event {
            timestamp,
            labels,
            payload: Payload::Log { message, fields },
        }
    }

    pub fn kind(&self) -> EventKind {
        match self.payload {
            Payload::Log { .. } => EventKind::Log,
            Payload::Counter(_) | Payload::CounterReset => EventKind::Counter,
            Payload::Gauge(_) => EventKind::Gauge,
            Payload::Histogram(_) => EventKind::Histogram,
        }
    }

    /// Checks the size bounds of log payloads.
    pub fn validate(&self) -> Result<(), ParseError> {
        match &self.payload {
            Payload::Log { message, fields } => {
                if message.len() > MAX_MESSAGE_BYTES {
                    return Err(ParseError::Raw(format!(
                        "log message larger than {MAX_MESSAGE_BYTES} bytes"
                    )));
                }
                fields.validate()
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_deserialize_primitives() {
        let fields: Fields = serde_json::from_str(
            r#"{"count": 3, "duration": 0.25, "audit": true, "user_id": "admin_123"}"#,
        )
        .unwrap();
        assert_eq!(fields.get("count"), Some(&FieldValue::Int(3)));
        assert_eq!(fields.get("duration"), Some(&FieldValue::Float(0.25)));
        assert_eq!(fields.get("audit"), Some(&FieldValue::Bool(true)));
        assert_eq!(
            fields.get("user_id"),
            Some(&FieldValue::Str("admin_123".to_string()))
        );
    }

    #[test]
    fn test_fields_reject_nesting() {
        let result: Result<Fields, _> = serde_json::from_str(r#"{"nested": {"a": 1}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_fields_bounds() {
        let mut fields = Fields::new();
        for i in 0..=MAX_FIELDS {
            fields = fields.with(format!("f{i}"), i as i64);
        }
        assert_eq!(
            fields.validate(),
            Err(ParseError::TooManyFields(MAX_FIELDS))
        );

        let big = Fields::new().with("stack", "x".repeat(MAX_FIELD_VALUE_BYTES + 1));
        assert_eq!(
            big.validate(),
            Err(ParseError::FieldTooLarge("stack".to_string()))
        );
    }

    #[test]
    fn test_time_range() {
        assert_eq!(
            TimeRange::new(10, 5),
            Err(QueryError::InvalidTimeRange { start: 10, end: 5 })
        );
        let range = TimeRange::new(5, 10).unwrap();
        assert!(range.contains(5));
        assert!(range.contains(10));
        assert!(!range.contains(11));
    }

    #[test]
    fn test_event_kind() {
        let event = Event {
            timestamp: 0,
            labels: LabelSet::default(),
            payload: Payload::CounterReset,
        };
        assert_eq!(event.kind(), EventKind::Counter);
        assert_eq!(EventKind::Histogram.to_string(), "histogram");
    }

    #[test]
    fn test_oversized_message_rejected() {
        let event = Event::log(
            0,
            LabelSet::default(),
            "x".repeat(MAX_MESSAGE_BYTES + 1),
            Fields::new(),
        );
        assert!(event.validate().is_err());
    }
}
