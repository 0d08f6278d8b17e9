//! Event Router - the entry point of the pipeline.
//!
//! The [`EventRouter`] normalizes a producer's [`NewEvent`], assigns it a
//! lane, a priority and a routing identifier, and pushes it onto the tail of
//! its priority queue.
//!
//! # Resolution
//!
//! ```text
//! lane:     requested lane ── unknown/disabled? ──► default lane (warn)
//! priority: explicit ──► lane default_priority ──► normal
//! id:       {lane}-{unix millis}-{8 hex}
//! ```
//!
//! # Failure
//!
//! If the queue store cannot be reached the call fails with
//! [`RouteError::QueueUnavailable`]. Nothing is buffered locally, so a caller
//! never mistakes backpressure for success.

use crate::config::LaneConfig;
use crate::event::{Event, NewEvent};
use crate::metrics::MetricsRegistry;
use crate::notify::{Bus, Notification};
use crate::store::{QueueKeys, QueueStore, StoreError};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that can occur during routing.
#[derive(Error, Debug)]
pub enum RouteError {
    /// The queue store could not be reached; the event was not queued.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(#[source] StoreError),

    /// The event is missing required content.
    #[error("invalid event: {0}")]
    Validation(String),

    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Routes events onto their priority queues.
///
/// Designed to be wrapped in `Arc` and shared by the API surface, the retry
/// scheduler and the health monitor.
pub struct EventRouter {
    store: Arc<dyn QueueStore>,
    keys: QueueKeys,
    lanes: BTreeMap<String, LaneConfig>,
    default_lane: String,
    metrics: Arc<MetricsRegistry>,
    bus: Bus,
}

impl EventRouter {
    pub fn new(
        store: Arc<dyn QueueStore>,
        keys: QueueKeys,
        lanes: BTreeMap<String, LaneConfig>,
        default_lane: impl Into<String>,
        metrics: Arc<MetricsRegistry>,
        bus: Bus,
    ) -> Self {
        Self {
            store,
            keys,
            lanes,
            default_lane: default_lane.into(),
            metrics,
            bus,
        }
    }

    /// Route a new producer event.
    ///
    /// Returns the routed [`Event`] as it was written to the queue.
    pub async fn route_event(&self, new_event: NewEvent) -> Result<Event, RouteError> {
        if new_event.data.is_null() {
            return Err(RouteError::Validation("event data is required".to_string()));
        }

        let lane = self.resolve_lane(&new_event.lane)?;
        let priority = new_event
            .priority
            .or(lane.default_priority)
            .unwrap_or_default();

        let now = Utc::now();
        let event = Event {
            id: routing_id(&lane.name),
            kind: new_event.kind,
            lane: lane.name.clone(),
            priority,
            payload: new_event.data,
            created_at: now,
            routed_at: now,
            retry_count: 0,
            failed_at: None,
            failure_reason: None,
        };

        self.push(&event).await?;
        self.metrics.record_routed(&event.lane, event.priority);

        info!(
            route_id = %event.id,
            event_type = %event.kind,
            lane = %event.lane,
            priority = %event.priority,
            "Event routed"
        );
        self.bus.publish(Notification::Routed(event.clone()));

        Ok(event)
    }

    /// Put a previously routed event back on its queue after a retry delay.
    ///
    /// Lane, priority, routing id and retry count are kept as they are; only
    /// `routed_at` is refreshed. Producer-facing counters are not touched, so
    /// `total_events` keeps counting distinct events.
    pub async fn reroute(&self, mut event: Event) -> Result<Event, RouteError> {
        event.routed_at = Utc::now();
        self.push(&event).await?;

        debug!(
            route_id = %event.id,
            priority = %event.priority,
            retry_count = event.retry_count,
            "Event re-routed"
        );
        self.bus.publish(Notification::Routed(event.clone()));

        Ok(event)
    }

    /// Resolve a requested lane against the static lane set.
    fn resolve_lane(&self, requested: &str) -> Result<&LaneConfig, RouteError> {
        match self.lanes.get(requested) {
            Some(lane) if lane.enabled => Ok(lane),
            found => {
                warn!(
                    requested_lane = %requested,
                    default_lane = %self.default_lane,
                    disabled = found.is_some(),
                    "Unknown or disabled lane, falling back to default"
                );
                self.lanes.get(&self.default_lane).ok_or_else(|| {
                    RouteError::Validation(format!(
                        "default lane '{}' is not configured",
                        self.default_lane
                    ))
                })
            }
        }
    }

    async fn push(&self, event: &Event) -> Result<(), RouteError> {
        let payload = serde_json::to_string(event)?;
        let key = self.keys.queue(event.priority);

        self.store.push(key, payload).await.map_err(|e| {
            error!(
                route_id = %event.id,
                key = %key,
                error = %e,
                "Failed to push event to queue"
            );
            RouteError::QueueUnavailable(e)
        })
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }
}

/// Build a routing identifier for correlation: lane, wall-clock millis and a
/// short random suffix. Not intended to be unguessable.
fn routing_id(lane: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", lane, Utc::now().timestamp_millis(), &suffix[..8])
}
