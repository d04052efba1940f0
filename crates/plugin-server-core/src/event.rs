//! Event envelope decoding and validation.
//!
//! Raw queue messages are JSON objects:
//!
//! ```json
//! {"team_id": 42, "event": "pageview", "timestamp": "2024-01-01T00:00:00Z",
//!  "properties": {"$browser": "Chrome"}}
//! ```
//!
//! Decoding is split in two steps. The first step only checks that the
//! payload has the right shape ([`IntakeError::Decode`]); the second checks
//! that the envelope makes sense for this deployment
//! ([`IntakeError::Validation`]): the team must be known and the timestamp
//! must be a valid RFC 3339 instant.

use crate::error::{IntakeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};

/// A single analytics event flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub team_id: i64,
    pub event: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distinct_id: Option<String>,
}

impl Event {
    /// Create an event with no properties.
    pub fn new(team_id: i64, event: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            team_id,
            event: event.into(),
            timestamp,
            properties: Map::new(),
            uuid: None,
            distinct_id: None,
        }
    }

    /// Builder-style helper to attach a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Lookup of the teams this deployment serves.
pub trait TeamLookup {
    fn contains_team(&self, team_id: i64) -> bool;
}

impl TeamLookup for HashSet<i64> {
    fn contains_team(&self, team_id: i64) -> bool {
        self.contains(&team_id)
    }
}

impl TeamLookup for BTreeSet<i64> {
    fn contains_team(&self, team_id: i64) -> bool {
        self.contains(&team_id)
    }
}

/// Wire shape of an incoming message. Every field is optional here so that
/// absence is reported as a validation failure rather than a decode failure.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    team_id: Option<i64>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    distinct_id: Option<String>,
}

/// Decode and validate a raw message into an [`Event`].
///
/// # Errors
///
/// - [`IntakeError::Decode`] if the payload is not a JSON object of the
///   expected shape.
/// - [`IntakeError::Validation`] if `team_id` is missing or unknown, the
///   event name is missing or empty, or the timestamp is missing or not
///   RFC 3339.
pub fn decode_event(raw: &[u8], teams: &dyn TeamLookup) -> Result<Event> {
    let envelope: RawEnvelope = serde_json::from_slice(raw)?;
    validate_envelope(envelope, teams)
}

fn validate_envelope(envelope: RawEnvelope, teams: &dyn TeamLookup) -> Result<Event> {
    let team_id = envelope
        .team_id
        .ok_or_else(|| IntakeError::validation("team_id", "missing"))?;
    if !teams.contains_team(team_id) {
        return Err(IntakeError::validation(
            "team_id",
            format!("unknown team {team_id}"),
        ));
    }

    let event = match envelope.event {
        Some(name) if !name.trim().is_empty() => name,
        Some(_) => return Err(IntakeError::validation("event", "empty")),
        None => return Err(IntakeError::validation("event", "missing")),
    };

    let raw_ts = envelope
        .timestamp
        .ok_or_else(|| IntakeError::validation("timestamp", "missing"))?;
    let timestamp = parse_timestamp(&raw_ts)?;

    Ok(Event {
        team_id,
        event,
        timestamp,
        properties: envelope.properties.unwrap_or_default(),
        uuid: envelope.uuid,
        distinct_id: envelope.distinct_id,
    })
}

/// Parse an RFC 3339 timestamp, normalizing to UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| IntakeError::validation("timestamp", format!("'{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn teams() -> HashSet<i64> {
        [42, 7].into_iter().collect()
    }

    #[test]
    fn test_decode_valid_event() {
        let raw = br#"{"team_id":42,"event":"pageview","timestamp":"2024-01-01T00:00:00Z","properties":{"$browser":"Chrome"}}"#;
        let event = decode_event(raw, &teams()).unwrap();
        assert_eq!(event.team_id, 42);
        assert_eq!(event.event, "pageview");
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(event.properties["$browser"], "Chrome");
    }

    #[test]
    fn test_decode_normalizes_offset() {
        let raw = br#"{"team_id":7,"event":"e","timestamp":"2024-01-01T02:00:00+02:00"}"#;
        let event = decode_event(raw, &teams()).unwrap();
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert!(event.properties.is_empty());
    }

    #[test]
    fn test_missing_team_is_validation_error() {
        let raw = br#"{"event":"pageview","timestamp":"2024-01-01T00:00:00Z"}"#;
        let err = decode_event(raw, &teams()).unwrap_err();
        assert!(matches!(
            err,
            IntakeError::Validation {
                field: "team_id",
                ..
            }
        ));
    }

    #[test]
    fn test_null_team_is_validation_error() {
        let raw = br#"{"team_id":null,"event":"pageview","timestamp":"2024-01-01T00:00:00Z"}"#;
        let err = decode_event(raw, &teams()).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_unknown_team_is_validation_error() {
        let raw = br#"{"team_id":999,"event":"pageview","timestamp":"2024-01-01T00:00:00Z"}"#;
        let err = decode_event(raw, &teams()).unwrap_err();
        assert!(err.to_string().contains("unknown team 999"));
    }

    #[test]
    fn test_bad_timestamp_is_validation_error() {
        let raw = br#"{"team_id":42,"event":"pageview","timestamp":"yesterday"}"#;
        let err = decode_event(raw, &teams()).unwrap_err();
        assert!(matches!(
            err,
            IntakeError::Validation {
                field: "timestamp",
                ..
            }
        ));
    }

    #[test]
    fn test_missing_timestamp_is_validation_error() {
        let raw = br#"{"team_id":42,"event":"pageview"}"#;
        let err = decode_event(raw, &teams()).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_empty_event_name_is_validation_error() {
        let raw = br#"{"team_id":42,"event":"  ","timestamp":"2024-01-01T00:00:00Z"}"#;
        let err = decode_event(raw, &teams()).unwrap_err();
        assert!(matches!(err, IntakeError::Validation { field: "event", .. }));
    }

    #[test]
    fn test_not_json_is_decode_error() {
        let err = decode_event(b"not json at all", &teams()).unwrap_err();
        assert!(matches!(err, IntakeError::Decode(_)));
    }

    #[test]
    fn test_wrong_shapes_are_decode_errors() {
        let cases: [&[u8]; 3] = [
            br#"{"team_id":"42","event":"e","timestamp":"2024-01-01T00:00:00Z"}"#,
            br#"{"team_id":42,"event":"e","timestamp":"2024-01-01T00:00:00Z","properties":[1]}"#,
            br#"[1,2,3]"#,
        ];
        for raw in cases {
            let err = decode_event(raw, &teams()).unwrap_err();
            assert!(matches!(err, IntakeError::Decode(_)), "{err}");
        }
    }

    #[test]
    fn test_event_roundtrips_through_serde() {
        let event = Event::new(42, "pageview", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .with_property("$browser", "Chrome")
            .with_property("count", 3);
        let json = serde_json::to_vec(&event).unwrap();
        let decoded = decode_event(&json, &teams()).unwrap();
        assert_eq!(decoded, event);
    }
}
