//! Broker connection settings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default MQTT port.
pub const DEFAULT_BROKER_PORT: u16 = 1883;

fn default_port() -> u16 {
    DEFAULT_BROKER_PORT
}

/// A tenant's broker connection settings.
///
/// Configs are replaced whole; there is no partial merge. Empty strings are
/// kept as written (so a config reads back exactly as it was stored) but are
/// treated as absent by the accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker host name or address.
    pub host: String,

    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username, if the broker requires credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password paired with `username`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Topic filter to subscribe to after connecting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe_topic: Option<String>,

    /// Fallback topic for outbound events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_topic: Option<String>,

    /// Per-event-type topic overrides.
    #[serde(default)]
    pub topics_by_type: BTreeMap<String, String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

impl BrokerConfig {
    /// Create a config for `host:port` with no credentials or topics.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            subscribe_topic: None,
            publish_topic: None,
            topics_by_type: BTreeMap::new(),
        }
    }

    /// Set credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the subscribe topic.
    #[must_use]
    pub fn with_subscribe_topic(mut self, topic: impl Into<String>) -> Self {
        self.subscribe_topic = Some(topic.into());
        self
    }

    /// Set the fallback publish topic.
    #[must_use]
    pub fn with_publish_topic(mut self, topic: impl Into<String>) -> Self {
        self.publish_topic = Some(topic.into());
        self
    }

    /// Add a per-event-type topic override.
    #[must_use]
    pub fn with_type_topic(mut self, kind: impl Into<String>, topic: impl Into<String>) -> Self {
        self.topics_by_type.insert(kind.into(), topic.into());
        self
    }

    /// Credentials to present, if a username is set.
    ///
    /// A missing password is sent as an empty string.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        non_empty(&self.username).map(|user| (user, self.password.as_deref().unwrap_or("")))
    }

    /// The subscribe topic, if set.
    #[must_use]
    pub fn subscribe_topic(&self) -> Option<&str> {
        non_empty(&self.subscribe_topic)
    }

    /// Resolve the destination topic for an event type.
    ///
    /// The per-type override wins, then the fallback publish topic. `None`
    /// means the event has nowhere to go and should be dropped.
    #[must_use]
    pub fn resolve_topic(&self, kind: &str) -> Option<&str> {
        self.topics_by_type
            .get(kind)
            .map(String::as_str)
            .filter(|t| !t.is_empty())
            .or_else(|| non_empty(&self.publish_topic))
    }
}
