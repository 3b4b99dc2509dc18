//! Subscription filters
//!
//! A filter is a per-connection predicate over envelope metadata. Empty
//! sets and unset ids mean "no constraint on that axis"; an envelope that
//! leaves a scoping field unset is likewise unconstrained on that axis.

use std::collections::HashSet;

use super::messages::{Envelope, FilterPatch};

/// Which events a connection wants to receive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    /// Accepted event names (empty = all)
    pub event_types: HashSet<String>,
    /// Owning user
    pub user_id: Option<String>,
    /// Owning team
    pub team_id: Option<String>,
    /// Accepted resource ids (empty = all)
    pub resource_ids: HashSet<String>,
}

impl SubscriptionFilter {
    /// Filter that accepts every envelope
    pub fn unconstrained() -> Self {
        Self::default()
    }

    /// Restrict to a user
    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Restrict to a team
    pub fn for_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    /// Restrict to a set of event names
    pub fn with_event_types<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = events.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to a set of resources
    pub fn with_resource_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Decide whether `envelope` should be delivered
    pub fn matches(&self, envelope: &Envelope) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&envelope.event) {
            return false;
        }

        if let (Some(wanted), Some(actual)) = (&self.user_id, &envelope.user_id) {
            if wanted != actual {
                return false;
            }
        }

        if let Some(resource) = &envelope.resource_id {
            if !self.resource_ids.is_empty() && !self.resource_ids.contains(resource) {
                return false;
            }
        }

        if let (Some(wanted), Some(actual)) = (&self.team_id, &envelope.team_id) {
            if wanted != actual {
                return false;
            }
        }

        true
    }

    /// Apply a `subscribe` frame: fields given a list are replaced
    pub fn apply_subscribe(&mut self, patch: FilterPatch) {
        if let Some(Some(ids)) = patch.resource_ids {
            self.resource_ids = ids.into_iter().collect();
        }
        if let Some(Some(events)) = patch.event_types {
            self.event_types = events.into_iter().collect();
        }
    }

    /// Apply an `unsubscribe` frame: named fields are cleared, whatever
    /// their value
    pub fn apply_unsubscribe(&mut self, patch: &FilterPatch) {
        if patch.resource_ids.is_some() {
            self.resource_ids.clear();
        }
        if patch.event_types.is_some() {
            self.event_types.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str) -> Envelope {
        Envelope::new("session", name)
    }

    #[test]
    fn test_unconstrained_matches_everything() {
        let filter = SubscriptionFilter::unconstrained();
        assert!(filter.matches(&event("session.created")));
        assert!(filter.matches(&event("alert.triggered").user("u9").team("t1")));
        assert!(filter.matches(&event("metrics.sessions").resource("r1")));
    }

    #[test]
    fn test_event_type_and_user_scenario() {
        let filter = SubscriptionFilter::unconstrained()
            .with_event_types(["session.created"])
            .for_user("u1");

        assert!(filter.matches(&event("session.created").user("u1")));
        assert!(!filter.matches(&event("session.created").user("u2")));
        assert!(!filter.matches(&event("session.deleted").user("u1")));
    }

    #[test]
    fn test_resource_filter() {
        let filter = SubscriptionFilter::unconstrained().with_resource_ids(["s1", "s2"]);
        assert!(filter.matches(&event("session.updated").resource("s2")));
        assert!(!filter.matches(&event("session.updated").resource("s3")));
    }

    #[test]
    fn test_team_filter() {
        let filter = SubscriptionFilter::unconstrained().for_team("t1");
        assert!(filter.matches(&event("session.updated").team("t1")));
        assert!(!filter.matches(&event("session.updated").team("t2")));
    }

    #[test]
    fn test_absent_envelope_scope_is_permissive() {
        let filter = SubscriptionFilter::unconstrained()
            .for_user("u1")
            .for_team("t1")
            .with_resource_ids(["s1"]);
        assert!(filter.matches(&event("alert.triggered")));
    }

    #[test]
    fn test_subscribe_replaces_named_fields_only() {
        let mut filter = SubscriptionFilter::unconstrained()
            .for_user("u1")
            .with_resource_ids(["old"]);

        filter.apply_subscribe(FilterPatch::events(["alert.triggered"]));

        assert!(filter.resource_ids.contains("old"));
        assert_eq!(filter.event_types.len(), 1);
        assert_eq!(filter.user_id.as_deref(), Some("u1"));

        filter.apply_subscribe(FilterPatch::resources(["new"]));
        assert!(!filter.resource_ids.contains("old"));
        assert!(filter.resource_ids.contains("new"));

        // A null value leaves the field as it was
        filter.apply_subscribe(FilterPatch {
            resource_ids: Some(None),
            event_types: None,
        });
        assert!(filter.resource_ids.contains("new"));
    }

    #[test]
    fn test_unsubscribe_clears_named_fields() {
        let mut filter = SubscriptionFilter::unconstrained()
            .with_event_types(["alert.triggered"])
            .with_resource_ids(["s1"]);

        filter.apply_unsubscribe(&FilterPatch {
            resource_ids: None,
            event_types: Some(Some(Vec::new())),
        });
        assert!(filter.event_types.is_empty());
        assert!(!filter.resource_ids.is_empty());
        assert!(filter.matches(&event("session.created")));
    }

    #[test]
    fn test_unsubscribe_with_null_value_clears_field() {
        let mut filter = SubscriptionFilter::unconstrained()
            .with_event_types(["alert.triggered"])
            .with_resource_ids(["s1"]);

        let json = r#"{"type":"unsubscribe","filters":{"eventTypes":null}}"#;
        match crate::websocket::messages::ClientMessage::parse(json.as_bytes()) {
            Some(crate::websocket::messages::ClientMessage::Unsubscribe { filters }) => {
                filter.apply_unsubscribe(&filters);
            }
            other => panic!("Expected Unsubscribe, got {:?}", other),
        }

        assert!(filter.event_types.is_empty());
        assert!(filter.resource_ids.contains("s1"));
        assert!(filter.matches(&event("session.created").resource("s1")));
    }
}
