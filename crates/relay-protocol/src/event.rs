//! The event envelope.
//!
//! Events are the unit of relay. Each one carries a type name and an arbitrary
//! JSON `data` object. Enrichment may add `data.statusText` and a top-level
//! `_log_prefix` before fan-out; nothing else is rewritten.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Well-known event type names.
pub mod kinds {
    /// A message that arrived from the tenant's broker subscription.
    pub const MQTT: &str = "mqtt";
    /// Synthetic link-state notification emitted by the relay itself.
    pub const SYSTEM_STATUS: &str = "system_status";
    pub const ARRIVAL: &str = "arrival";
    pub const STATUS: &str = "status";
    pub const EXCEPTION: &str = "exception";
    pub const CONTROL: &str = "control";

    /// Event types accepted from the HTTP ingestion routes.
    pub const SUBMITTABLE: [&str; 4] = [ARRIVAL, STATUS, EXCEPTION, CONTROL];
}

/// A relayed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type, e.g. `"arrival"` or `"mqtt"`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Arbitrary event payload.
    #[serde(default)]
    pub data: Value,

    /// Human-readable time prefix derived from `data.timestamp`.
    #[serde(
        rename = "_log_prefix",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub log_prefix: Option<String>,
}

impl Event {
    /// Create a new event.
    #[must_use]
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            log_prefix: None,
        }
    }

    /// Create an event for a message received from a broker.
    #[must_use]
    pub fn from_broker(data: Value) -> Self {
        Self::new(kinds::MQTT, data)
    }

    /// Create a `system_status` event describing the tenant's broker link.
    #[must_use]
    pub fn system_status(status: &LinkStatus) -> Self {
        let mut data = json!({ "mqtt_status": status.label() });
        if let LinkStatus::Error(detail) = status {
            data["detail"] = Value::String(detail.clone());
        }
        Self::new(kinds::SYSTEM_STATUS, data)
    }
}

/// Connectivity of a tenant's broker link, as reported to sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    /// A broker session is established.
    Connected,
    /// A config exists but no session is established.
    Disconnected,
    /// The tenant has no broker config.
    NotConfigured,
    /// The last connect attempt, or the live session, failed.
    Error(String),
}

impl LinkStatus {
    /// Short label used as `mqtt_status` on the wire.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            LinkStatus::Connected => "connected",
            LinkStatus::Disconnected => "disconnected",
            LinkStatus::NotConfigured => "not_configured",
            LinkStatus::Error(_) => "error",
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Error(detail) => write!(f, "error: {}", detail),
            other => f.write_str(other.label()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = Event::new("arrival", json!({"robot": "r-1"}));
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value, json!({"type": "arrival", "data": {"robot": "r-1"}}));
    }

    #[test]
    fn test_log_prefix_serialized_when_present() {
        let mut event = Event::new("status", json!({}));
        event.log_prefix = Some("[2024/1/2 AM3:04:05]".to_string());

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["_log_prefix"], "[2024/1/2 AM3:04:05]");
    }

    #[test]
    fn test_system_status_event() {
        let event = Event::system_status(&LinkStatus::Connected);
        assert_eq!(event.kind, kinds::SYSTEM_STATUS);
        assert_eq!(event.data, json!({"mqtt_status": "connected"}));

        let event = Event::system_status(&LinkStatus::Error("refused".into()));
        assert_eq!(event.data["mqtt_status"], "error");
        assert_eq!(event.data["detail"], "refused");
    }
}
