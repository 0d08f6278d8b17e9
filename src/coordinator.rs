//! Coordinator - the composition root.
//!
//! Builds every component from one [`SwitchyardConfig`] and owns their
//! lifecycle:
//!
//! ```text
//! initialize ─► store ─► metrics / bus ─► router ─► retry ─► processor
//!                                                        └─► health monitor
//! start      ─► audit trail, consumer loops, probe timer
//! stop       ─► probe timer, consumer loops, pending retries, audit, store
//! ```
//!
//! The store is released last so that in-flight handlers and flushed retries
//! can still reach it.

use crate::audit::AuditTrail;
use crate::config::{ConfigError, StoreBackend, SwitchyardConfig};
use crate::event::{Event, EventKind, NewEvent};
use crate::handlers::Handler;
use crate::health::{self, HealthHandler, HealthMonitor, HealthRecord};
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::notify::{Bus, Notification, DEFAULT_BUS_CAPACITY};
use crate::processor::EventProcessor;
use crate::retry::{RetryPolicy, RetryScheduler};
use crate::router::{EventRouter, RouteError};
use crate::store::{MemoryQueueStore, QueueKeys, QueueStore, RedisQueueStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("queue store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("coordinator is already running")]
    AlreadyRunning,

    #[error("coordinator has been stopped and cannot be restarted")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

/// Components whose start/stop must be serialized.
struct Lifecycle {
    phase: Phase,
    processor: EventProcessor,
    health: HealthMonitor,
    audit: Option<AuditTrail>,
    audit_task: Option<JoinHandle<()>>,
}

pub struct Coordinator {
    store: Arc<dyn QueueStore>,
    keys: QueueKeys,
    metrics: Arc<MetricsRegistry>,
    bus: Bus,
    router: Arc<EventRouter>,
    retry: Arc<RetryScheduler>,
    audit_cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl Coordinator {
    /// Connect to the configured store and build the pipeline.
    pub async fn initialize(config: SwitchyardConfig) -> Result<Self, CoordinatorError> {
        config.validate()?;

        let store: Arc<dyn QueueStore> = match config.store.backend {
            StoreBackend::Redis => Arc::new(RedisQueueStore::connect(&config.store.url).await?),
            StoreBackend::Memory => {
                warn!("Using in-memory queue store, queued events do not survive a restart");
                Arc::new(MemoryQueueStore::new())
            }
        };

        Self::with_store(config, store)
    }

    /// Build the pipeline on top of an existing store.
    pub fn with_store(
        config: SwitchyardConfig,
        store: Arc<dyn QueueStore>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;

        let keys = QueueKeys::new(&config.store.key_prefix);
        let metrics = Arc::new(MetricsRegistry::new(config.lanes.keys()));
        let bus = Bus::new(DEFAULT_BUS_CAPACITY);

        let router = Arc::new(EventRouter::new(
            store.clone(),
            keys.clone(),
            config.lanes.clone(),
            config.default_lane.clone(),
            metrics.clone(),
            bus.clone(),
        ));

        let retry = Arc::new(RetryScheduler::new(
            RetryPolicy::from(&config.retry),
            router.clone(),
            store.clone(),
            metrics.clone(),
            bus.clone(),
            config.processor.error_backoff(),
        ));

        let mut processor = EventProcessor::new(
            store.clone(),
            keys.clone(),
            retry.clone(),
            metrics.clone(),
            bus.clone(),
            &config.processor,
        );
        for (kind, handler) in config.build_handlers() {
            processor.register(kind, handler);
        }
        processor.register(
            EventKind::Health,
            Arc::new(HealthHandler::new(
                store.clone(),
                keys.clone(),
                metrics.clone(),
                bus.clone(),
                config.health.record_ttl(),
            )),
        );

        let health = HealthMonitor::new(
            router.clone(),
            config.health.interval(),
            config.health_lane(),
        );

        info!(
            backend = ?config.store.backend,
            prefix = %config.store.key_prefix,
            lanes = config.lanes.len(),
            default_lane = %config.default_lane,
            max_retries = config.retry.max_retries,
            "Coordinator initialized"
        );

        let audit = config
            .audit
            .enabled
            .then(|| AuditTrail::from_config(&config.audit));

        Ok(Self {
            store,
            keys,
            metrics,
            bus,
            router,
            retry,
            audit_cancel: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle {
                phase: Phase::Idle,
                processor,
                health,
                audit,
                audit_task: None,
            }),
        })
    }

    /// Bind (or replace) the handler for an event type. Takes effect on start.
    pub fn register_handler(&mut self, kind: EventKind, handler: Arc<dyn Handler>) {
        self.lifecycle.get_mut().processor.register(kind, handler);
    }

    /// Start the audit trail, the consumer loops and the probe timer.
    pub async fn start(&self) -> Result<(), CoordinatorError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match lifecycle.phase {
            Phase::Running => return Err(CoordinatorError::AlreadyRunning),
            Phase::Stopped => return Err(CoordinatorError::Stopped),
            Phase::Idle => {}
        }

        if let Some(trail) = lifecycle.audit.take() {
            lifecycle.audit_task = Some(trail.spawn(self.bus.subscribe(), self.audit_cancel.clone()));
        }

        lifecycle.processor.start();
        lifecycle.health.start();
        lifecycle.phase = Phase::Running;

        info!("Switchyard started");
        Ok(())
    }

    /// Stop everything in dependency order.
    ///
    /// With `graceful` pending retries are pushed back to their queues
    /// immediately, waiting out a store outage if one is in progress;
    /// otherwise they are abandoned and counted as dropped. In-flight
    /// handlers always run to completion. Calling `stop` twice is a no-op.
    pub async fn stop(&self, graceful: bool) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.phase == Phase::Stopped {
            return;
        }

        info!(graceful = graceful, "Stopping Switchyard");

        lifecycle.health.stop().await;
        lifecycle.processor.stop().await;
        self.retry.shutdown(graceful).await;

        self.audit_cancel.cancel();
        if let Some(audit) = lifecycle.audit_task.take() {
            if let Err(e) = audit.await {
                warn!(error = %e, "Audit trail task failed");
            }
        }

        self.store.close().await;
        lifecycle.phase = Phase::Stopped;

        let snapshot = self.metrics.snapshot();
        info!(
            total = snapshot.total_events,
            processed = snapshot.processed_events,
            failed = snapshot.failed_events,
            retried = snapshot.retried_events,
            dead_lettered = snapshot.dead_letter_events,
            dropped = snapshot.dropped_events,
            "Switchyard stopped"
        );
    }

    /// Route a producer event onto its priority queue.
    pub async fn route_event(&self, event: NewEvent) -> Result<Event, RouteError> {
        self.router.route_event(event).await
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The oldest `limit` dead-lettered events. Read-only.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<Event>, CoordinatorError> {
        let raw = self.store.range(self.keys.dead_letter(), limit).await?;

        Ok(raw
            .iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable dead-letter entry");
                    None
                }
            })
            .collect())
    }

    pub async fn latest_health(&self) -> Result<Option<HealthRecord>, CoordinatorError> {
        Ok(health::latest_record(self.store.as_ref(), &self.keys).await?)
    }

    /// Check store connectivity.
    pub async fn ping(&self) -> Result<(), CoordinatorError> {
        Ok(self.store.ping().await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Priority;
    use serde_json::json;
    use std::time::Duration;

    fn memory_config() -> SwitchyardConfig {
        let mut config = SwitchyardConfig::default();
        config.store.backend = StoreBackend::Memory;
        config.audit.enabled = false;
        config.processor.pop_timeout_ms = 100;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_routes_and_processes() {
        let coordinator = Coordinator::initialize(memory_config()).await.unwrap();
        coordinator.start().await.unwrap();

        let event = coordinator
            .route_event(NewEvent::new(EventKind::Deploy, "deploy", json!({"v": 1})))
            .await
            .unwrap();
        assert_eq!(event.priority, Priority::High);

        tokio::time::sleep(Duration::from_millis(500)).await;
        coordinator.stop(true).await;

        let metrics = coordinator.get_metrics();
        assert_eq!(metrics.total_events, 1);
        assert_eq!(metrics.processed_events, 1);
        assert!(matches!(
            coordinator.start().await,
            Err(CoordinatorError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_start_twice_and_restart_rejected() {
        let coordinator = Coordinator::initialize(memory_config()).await.unwrap();
        coordinator.start().await.unwrap();
        assert!(matches!(
            coordinator.start().await,
            Err(CoordinatorError::AlreadyRunning)
        ));

        coordinator.stop(false).await;
        coordinator.stop(false).await;
        assert!(matches!(
            coordinator.start().await,
            Err(CoordinatorError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = memory_config();
        config.default_lane = "nowhere".to_string();

        assert!(matches!(
            Coordinator::initialize(config).await,
            Err(CoordinatorError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_dead_letters_skips_unreadable_entries() {
        let store = Arc::new(MemoryQueueStore::new());
        let coordinator = Coordinator::with_store(memory_config(), store.clone()).unwrap();

        let mut event = coordinator
            .route_event(NewEvent::new(EventKind::Alert, "monitoring", json!({})))
            .await
            .unwrap();
        event.failure_reason = Some("boom".to_string());

        store
            .push("switchyard:queue:deadletter", "garbage".to_string())
            .await
            .unwrap();
        store
            .push(
                "switchyard:queue:deadletter",
                serde_json::to_string(&event).unwrap(),
            )
            .await
            .unwrap();

        let dead = coordinator.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, event.id);
        assert_eq!(store.length("switchyard:queue:deadletter").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_route_fails_when_store_down() {
        let store = Arc::new(MemoryQueueStore::new());
        let coordinator = Coordinator::with_store(memory_config(), store.clone()).unwrap();
        store.set_offline(true);

        let result = coordinator
            .route_event(NewEvent::new(EventKind::Build, "build", json!({})))
            .await;
        assert!(matches!(result, Err(RouteError::QueueUnavailable(_))));
        assert!(coordinator.ping().await.is_err());
        assert_eq!(coordinator.get_metrics().total_events, 0);
    }
}
