//! WebSocket Message Types
//!
//! Defines the outbound envelope placed on the wire and the inbound
//! control frames a client may send after the handshake.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event payload object
pub type Payload = Map<String, Value>;

/// A broadcastable event with its routing metadata
///
/// Serialized as:
/// `{"type","event","resourceId"?,"userId"?,"teamId"?,"data","timestamp"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Message category (e.g., "session", "notification", "alert", "metrics")
    #[serde(rename = "type")]
    pub kind: String,
    /// Event name (e.g., "session.created")
    pub event: String,
    /// Resource this event concerns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Owning user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Owning team
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    /// Event payload
    #[serde(default)]
    pub data: Payload,
    /// When the event was produced
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Create an unscoped envelope stamped with the current time
    pub fn new(kind: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            event: event.into(),
            resource_id: None,
            user_id: None,
            team_id: None,
            data: Payload::new(),
            timestamp: Utc::now(),
        }
    }

    /// Scope to a resource
    pub fn resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Scope to a user
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Scope to a team
    pub fn team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    /// Replace the payload
    pub fn data(mut self, data: Payload) -> Self {
        self.data = data;
        self
    }

    /// Session lifecycle event (session.created, session.hibernated, ...)
    pub fn session(event: &str, resource_id: &str, user_id: &str, data: Payload) -> Self {
        Self::new("session", event)
            .resource(resource_id)
            .user(user_id)
            .data(data)
    }

    /// Notification event for a single user
    pub fn notification(event: &str, user_id: &str, data: Payload) -> Self {
        Self::new("notification", event).user(user_id).data(data)
    }

    /// Platform alert (unscoped)
    pub fn alert(event: &str, data: Payload) -> Self {
        Self::new("alert", event).data(data)
    }

    /// Metrics snapshot
    pub fn metrics(event: &str, data: Payload) -> Self {
        Self::new("metrics", event).data(data)
    }

    /// Serialize to the wire representation
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Filter fields a client may change after the handshake
///
/// The outer `Option` records whether the key was present at all, the inner
/// one whether it carried a list. `{"eventTypes": null}` is
/// `Some(None)`: unsubscribe clears the field, subscribe leaves it alone.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterPatch {
    /// Resource ids (`sessionIds` is accepted for older clients)
    #[serde(default, alias = "sessionIds", deserialize_with = "present")]
    pub resource_ids: Option<Option<Vec<String>>>,
    /// Event names
    #[serde(default, deserialize_with = "present")]
    pub event_types: Option<Option<Vec<String>>>,
}

impl FilterPatch {
    /// Patch that sets resource ids
    pub fn resources<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resource_ids: Some(Some(ids.into_iter().map(Into::into).collect())),
            event_types: None,
        }
    }

    /// Patch that sets event names
    pub fn events<I, S>(events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resource_ids: None,
            event_types: Some(Some(events.into_iter().map(Into::into).collect())),
        }
    }
}

/// A key that is present deserializes to `Some`, even when its value is null
fn present<'de, D>(deserializer: D) -> Result<Option<Option<Vec<String>>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<Vec<String>>::deserialize(deserializer).map(Some)
}

/// Control frames sent from client to server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Replace the named filter fields
    Subscribe {
        #[serde(default)]
        filters: FilterPatch,
    },
    /// Clear the named filter fields back to unconstrained
    Unsubscribe {
        #[serde(default)]
        filters: FilterPatch,
    },
    /// Any other frame type, ignored
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Parse a control frame, returning `None` for malformed input
    pub fn parse(raw: &[u8]) -> Option<Self> {
        serde_json::from_slice(raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_serialize_omits_unset_scope() {
        let mut data = Payload::new();
        data.insert("state".to_string(), json!("running"));
        let envelope = Envelope::session("session.started", "sess-1", "u1", data);

        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "session");
        assert_eq!(value["event"], "session.started");
        assert_eq!(value["resourceId"], "sess-1");
        assert_eq!(value["userId"], "u1");
        assert!(value.get("teamId").is_none());
        assert_eq!(value["data"]["state"], "running");
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_alert_envelope_is_unscoped() {
        let envelope = Envelope::alert("alert.triggered", Payload::new());
        assert_eq!(envelope.kind, "alert");
        assert!(envelope.user_id.is_none());
        assert!(envelope.resource_id.is_none());
        assert!(envelope.team_id.is_none());
    }

    #[test]
    fn test_client_message_deserialize_subscribe() {
        let json = r#"{"type":"subscribe","filters":{"eventTypes":["alert.triggered"]}}"#;
        let msg = ClientMessage::parse(json.as_bytes()).unwrap();
        match msg {
            ClientMessage::Subscribe { filters } => {
                assert_eq!(filters.event_types, Some(Some(vec!["alert.triggered".to_string()])));
                assert!(filters.resource_ids.is_none());
            }
            _ => panic!("Expected Subscribe"),
        }
    }

    #[test]
    fn test_client_message_session_ids_alias() {
        let json = r#"{"type":"subscribe","filters":{"sessionIds":["s1","s2"]}}"#;
        match ClientMessage::parse(json.as_bytes()).unwrap() {
            ClientMessage::Subscribe { filters } => {
                assert_eq!(filters, FilterPatch::resources(["s1", "s2"]));
            }
            _ => panic!("Expected Subscribe"),
        }
    }

    #[test]
    fn test_client_message_unknown_type() {
        let msg = ClientMessage::parse(br#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unknown);
    }

    #[test]
    fn test_client_message_malformed() {
        assert!(ClientMessage::parse(b"not json").is_none());
        assert!(ClientMessage::parse(br#"{"filters":{}}"#).is_none());
    }

    #[test]
    fn test_unsubscribe_without_filters() {
        let msg = ClientMessage::parse(br#"{"type":"unsubscribe"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Unsubscribe {
                filters: FilterPatch::default()
            }
        );
    }

    #[test]
    fn test_null_filter_value_counts_as_present() {
        let json = r#"{"type":"unsubscribe","filters":{"eventTypes":null}}"#;
        match ClientMessage::parse(json.as_bytes()).unwrap() {
            ClientMessage::Unsubscribe { filters } => {
                assert_eq!(filters.event_types, Some(None));
                assert_eq!(filters.resource_ids, None);
            }
            _ => panic!("Expected Unsubscribe"),
        }
    }
}
