//! Lifecycle notifications.
//!
//! Every routed, processed, retried, dead-lettered and dropped event, and
//! every health cycle, is published on a [`Bus`]. Subscribers (the audit
//! trail, tests, anything embedding the coordinator) receive clones.
//!
//! ```text
//! Router ─────┐
//! Processor ──┼──► Bus (broadcast) ──► AuditTrail
//! Retry ──────┤                   └──► other subscribers
//! Health ─────┘
//! ```
//!
//! Publishing never blocks. With no live receiver a notification is simply
//! discarded; slow receivers observe `RecvError::Lagged` and skip ahead.

use crate::event::Event;
use crate::health::HealthRecord;
use std::time::Duration;
use tokio::sync::broadcast;

/// Default broadcast capacity.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// A lifecycle notification.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Pushed onto a priority queue (fresh or re-routed after a retry delay).
    Routed(Event),

    /// Handler completed successfully.
    Processed(Event),

    /// Handler failed; the event will be re-routed after `delay`.
    RetryScheduled { event: Event, delay: Duration },

    /// Retries exhausted; the event was written to the dead-letter store.
    DeadLettered(Event),

    /// Permanently discarded without retry.
    Dropped {
        event_id: Option<String>,
        reason: String,
    },

    HealthChecked(HealthRecord),
}

impl Notification {
    /// Stable notification name, e.g. `event:routed`.
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Routed(_) => "event:routed",
            Notification::Processed(_) => "event:processed",
            Notification::RetryScheduled { .. } => "event:retry_scheduled",
            Notification::DeadLettered(_) => "event:dead_letter",
            Notification::Dropped { .. } => "event:dropped",
            Notification::HealthChecked(_) => "health:checked",
        }
    }
}

/// Broadcast channel for [`Notification`]s. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Notification>,
}

impl Bus {
    /// Capacity is shared by all receivers and clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }

    /// A receiver only sees notifications published after it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = Bus::new(4);
        bus.publish(Notification::Dropped {
            event_id: None,
            reason: "nobody listening".to_string(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives() {
        let bus = Bus::new(4);
        let mut rx = bus.subscribe();

        bus.publish(Notification::Dropped {
            event_id: Some("ci-1-deadbeef".to_string()),
            reason: "no handler".to_string(),
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.name(), "event:dropped");
    }

    #[test]
    fn test_capacity_clamped() {
        let bus = Bus::new(0);
        let _rx = bus.subscribe();
        bus.publish(Notification::Dropped {
            event_id: None,
            reason: "x".to_string(),
        });
    }
}
