//! Health Monitor - a liveness probe that travels the real pipeline.
//!
//! Every `health.interval_ms` the [`HealthMonitor`] routes a synthetic
//! high-priority [`EventKind::Health`] event. It goes through the same router,
//! consumer loop and retry path as production traffic, so a broken pipeline
//! shows up as the probe itself failing, retrying or dead-lettering.
//!
//! When the probe is consumed, the [`HealthHandler`] reads one metrics
//! snapshot plus the depth of every queue and overwrites the single
//! "latest" [`HealthRecord`] in the store with a short expiry.

use crate::event::{Event, EventKind, NewEvent, Priority};
use crate::handlers::{Handler, HandlerError, HandlerResult};
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::notify::{Bus, Notification};
use crate::router::EventRouter;
use crate::store::{QueueKeys, QueueStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// The pipeline runs but the dead-letter store is not empty.
    Degraded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub high: u64,
    pub normal: u64,
    pub low: u64,
    pub deadletter: u64,
}

/// The persisted "latest" health record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    /// Routing id of the probe event that produced this record.
    pub probe_id: String,
    pub node: String,
    pub queue_depths: QueueDepths,
    pub metrics: MetricsSnapshot,
}

/// Handler bound to [`EventKind::Health`].
pub struct HealthHandler {
    store: Arc<dyn QueueStore>,
    keys: QueueKeys,
    metrics: Arc<MetricsRegistry>,
    bus: Bus,
    record_ttl: Duration,
    node: String,
}

impl HealthHandler {
    pub fn new(
        store: Arc<dyn QueueStore>,
        keys: QueueKeys,
        metrics: Arc<MetricsRegistry>,
        bus: Bus,
        record_ttl: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            metrics,
            bus,
            record_ttl,
            node: node_name(),
        }
    }

    async fn depth(&self, key: &str) -> Result<u64, HandlerError> {
        self.store
            .length(key)
            .await
            .map_err(|e| HandlerError::failed(format!("queue depth unavailable for {key}: {e}")))
    }

    async fn queue_depths(&self) -> Result<QueueDepths, HandlerError> {
        Ok(QueueDepths {
            high: self.depth(self.keys.queue(Priority::High)).await?,
            normal: self.depth(self.keys.queue(Priority::Normal)).await?,
            low: self.depth(self.keys.queue(Priority::Low)).await?,
            deadletter: self.depth(self.keys.dead_letter()).await?,
        })
    }
}

#[async_trait]
impl Handler for HealthHandler {
    fn name(&self) -> &str {
        "health"
    }

    async fn handle(&self, event: &Event) -> Result<HandlerResult, HandlerError> {
        let metrics = self.metrics.snapshot();
        let queue_depths = self.queue_depths().await?;

        let status = if queue_depths.deadletter > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let record = HealthRecord {
            timestamp: Utc::now(),
            status,
            probe_id: event.id.clone(),
            node: self.node.clone(),
            queue_depths,
            metrics,
        };

        let payload = serde_json::to_string(&record)?;
        self.store
            .set_with_expiry(self.keys.health(), payload, self.record_ttl)
            .await
            .map_err(|e| HandlerError::failed(format!("failed to persist health record: {e}")))?;

        info!(
            probe_id = %record.probe_id,
            status = ?record.status,
            high = record.queue_depths.high,
            normal = record.queue_depths.normal,
            low = record.queue_depths.low,
            deadletter = record.queue_depths.deadletter,
            "Health checked"
        );

        let depths = serde_json::to_value(&record.queue_depths)?;
        self.bus.publish(Notification::HealthChecked(record));

        Ok(HandlerResult::with_metadata(
            self.name(),
            "health record persisted",
            depths,
        ))
    }
}

/// Read the latest persisted health record, if it has not expired.
pub async fn latest_record(
    store: &dyn QueueStore,
    keys: &QueueKeys,
) -> Result<Option<HealthRecord>, crate::store::StoreError> {
    let Some(raw) = store.get(keys.health()).await? else {
        return Ok(None);
    };

    match serde_json::from_str(&raw) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(error = %e, "Ignoring unreadable health record");
            Ok(None)
        }
    }
}

/// Periodically routes a synthetic health probe.
pub struct HealthMonitor {
    router: Arc<EventRouter>,
    interval: Duration,
    lane: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(router: Arc<EventRouter>, interval: Duration, lane: impl Into<String>) -> Self {
        Self {
            router,
            interval,
            lane: lane.into(),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Start the probe timer. The first probe fires one interval from now.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }

        let router = self.router.clone();
        let cancel = self.cancel.clone();
        let interval = self.interval;
        let lane = self.lane.clone();

        info!(
            interval_ms = interval.as_millis() as u64,
            lane = %lane,
            "Health monitor started"
        );

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        probe(&router, &lane).await;
                    }
                    _ = cancel.cancelled() => {
                        debug!("Health monitor shutting down");
                        break;
                    }
                }
            }
        }));
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Health monitor task failed");
            }
            info!("Health monitor stopped");
        }
    }
}

async fn probe(router: &EventRouter, lane: &str) {
    let probe = NewEvent::new(
        EventKind::Health,
        lane,
        json!({ "probe": true, "node": node_name() }),
    )
    .with_priority(Priority::High);

    match router.route_event(probe).await {
        Ok(event) => debug!(probe_id = %event.id, "Health probe routed"),
        Err(e) => error!(error = %e, "Failed to route health probe"),
    }
}

fn node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
