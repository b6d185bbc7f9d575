//! Wire envelope for organization events.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Domain prefix used for change events.
pub const CHANGE_DOMAIN: &str = "change";

/// A single organization event as carried on the bus.
///
/// Serialized as `{timestamp, organization, target, event_type, data}` with an
/// RFC3339 timestamp. Older producers that still send `org` / `repo` are
/// accepted on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// When the producer created the event
    pub timestamp: DateTime<Utc>,
    /// Organization the event belongs to
    #[serde(alias = "org")]
    pub organization: String,
    /// Repository or resource the event is about
    #[serde(alias = "repo")]
    pub target: String,
    /// Event type, also the last subject token
    pub event_type: String,
    /// Opaque payload
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(
        organization: impl Into<String>,
        target: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            organization: organization.into(),
            target: target.into(),
            event_type: event_type.into(),
            data: Map::new(),
        }
    }

    /// Attach a data field.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Subject this event is published on: `change.<org>.<event_type>`.
    pub fn subject(&self) -> Result<String> {
        crate::router::subject::event_subject(CHANGE_DOMAIN, &self.organization, &self.event_type)
    }

    /// Key that serializes handling: events with the same key are processed in order.
    #[must_use]
    pub fn ordering_key(&self) -> String {
        format!("{}/{}", self.organization, self.target)
    }

    /// String field from `data`, if present and a string.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Encode as JSON bytes.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON bytes.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::MalformedMessage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_field_names() {
        let event = Event::new("acme", "acme/.github", "template_changed")
            .with_data("files", serde_json::json!(["ci.yml"]));
        let json: Value = serde_json::from_slice(&event.to_payload().unwrap()).unwrap();

        assert_eq!(json["organization"], "acme");
        assert_eq!(json["target"], "acme/.github");
        assert_eq!(json["event_type"], "template_changed");
        assert_eq!(json["data"]["files"][0], "ci.yml");
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_legacy_field_aliases() {
        let raw = br#"{"timestamp":"2024-05-01T10:00:00Z","org":"acme","repo":"acme/site","event_type":"workflow_status","data":{"status":"completed"}}"#;
        let event = Event::from_payload(raw).unwrap();
        assert_eq!(event.organization, "acme");
        assert_eq!(event.target, "acme/site");
        assert_eq!(event.data_str("status"), Some("completed"));
    }

    #[test]
    fn test_missing_data_defaults_empty() {
        let raw = br#"{"timestamp":"2024-05-01T10:00:00Z","organization":"acme","target":"t","event_type":"x"}"#;
        let event = Event::from_payload(raw).unwrap();
        assert!(event.data.is_empty());
    }

    #[test]
    fn test_malformed_payload() {
        let err = Event::from_payload(b"not json").unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
    }

    #[test]
    fn test_subject() {
        let event = Event::new("acme", "acme/.github", "template_changed");
        assert_eq!(event.subject().unwrap(), "change.acme.template_changed");

        let bad = Event::new("ac.me", "t", "template_changed");
        assert!(bad.subject().is_err());
    }
}
