//! Core event types for Switchyard.
//!
//! A producer submits a [`NewEvent`]; the router turns it into an [`Event`]
//! by assigning a lane, a [`Priority`] and a routing identifier. The routed
//! [`Event`] is what travels through the priority queues, the retry path and,
//! eventually, the dead-letter store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Scheduling priority. Each priority has its own queue and consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// All priorities, in scheduling-preference order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of operational event. Handlers are registered per kind.
///
/// The set is closed: an unrecognized `type` string fails deserialization,
/// so it is rejected at ingest or config-load time instead of being queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Build,
    Test,
    Deploy,
    Alert,
    /// Synthetic liveness probe emitted by the health monitor.
    Health,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Build,
        EventKind::Test,
        EventKind::Deploy,
        EventKind::Alert,
        EventKind::Health,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Build => "build",
            EventKind::Test => "test",
            EventKind::Deploy => "deploy",
            EventKind::Alert => "alert",
            EventKind::Health => "health",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event as submitted by a producer.
///
/// # Example
///
/// ```json
/// {
///   "type": "deploy",
///   "lane": "deploy",
///   "priority": "high",
///   "data": { "service": "billing", "version": "1.4.2" }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Requested lane; unknown or disabled lanes fall back to the default lane.
    #[serde(default)]
    pub lane: String,

    /// Explicit priority, overriding the lane default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,

    /// Arbitrary JSON payload handed to the handler. Must not be null.
    #[serde(default)]
    pub data: Value,
}

impl NewEvent {
    pub fn new(kind: EventKind, lane: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            lane: lane.into(),
            priority: None,
            data,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// A routed event flowing through the queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Routing identifier, stable across retries.
    pub id: String,

    #[serde(rename = "type")]
    pub kind: EventKind,

    pub lane: String,

    pub priority: Priority,

    pub payload: Value,

    pub created_at: DateTime<Utc>,

    /// Refreshed every time the event is pushed onto a queue.
    pub routed_at: DateTime<Utc>,

    /// Only ever incremented by the retry scheduler.
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Event {
    /// True once the event has been stamped for the dead-letter store.
    pub fn is_dead_lettered(&self) -> bool {
        self.failed_at.is_some() && self.failure_reason.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_event_deserialize() {
        let json_str = r#"{
            "type": "build",
            "lane": "ci",
            "data": {"commit": "abc123"}
        }"#;

        let event: NewEvent = serde_json::from_str(json_str).unwrap();
        assert_eq!(event.kind, EventKind::Build);
        assert_eq!(event.lane, "ci");
        assert!(event.priority.is_none());
        assert_eq!(event.data["commit"], "abc123");
    }

    #[test]
    fn test_new_event_with_priority() {
        let json_str = r#"{"type": "deploy", "lane": "deploy", "priority": "high", "data": {}}"#;

        let event: NewEvent = serde_json::from_str(json_str).unwrap();
        assert_eq!(event.priority, Some(Priority::High));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json_str = r#"{"type": "coffee", "lane": "ci", "data": {}}"#;
        assert!(serde_json::from_str::<NewEvent>(json_str).is_err());
    }

    #[test]
    fn test_event_serialize_camel_case() {
        let now = Utc::now();
        let event = Event {
            id: "ci-1-abcdef01".to_string(),
            kind: EventKind::Test,
            lane: "ci".to_string(),
            priority: Priority::Low,
            payload: json!({"suite": "unit"}),
            created_at: now,
            routed_at: now,
            retry_count: 2,
            failed_at: None,
            failure_reason: None,
        };

        let json_str = serde_json::to_string(&event).unwrap();
        assert!(json_str.contains("\"type\":\"test\""));
        assert!(json_str.contains("\"priority\":\"low\""));
        assert!(json_str.contains("retryCount"));
        assert!(json_str.contains("routedAt"));
        // failure fields are omitted until the event is dead-lettered
        assert!(!json_str.contains("failedAt"));
        assert!(!json_str.contains("failureReason"));
        assert!(!event.is_dead_lettered());

        let back: Event = serde_json::from_str(&json_str).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(Priority::ALL.map(|p| p.index()), [0, 1, 2]);
    }
}
