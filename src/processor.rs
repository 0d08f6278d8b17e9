//! Event Processor - one consumer loop per priority.
//!
//! ```text
//! start()
//!   ├─► consume(high)   ── BLPOP queue:high   ──┐
//!   ├─► consume(normal) ── BLPOP queue:normal ──┼─► handler[event.type]
//!   └─► consume(low)    ── BLPOP queue:low    ──┘      │
//!                                                      ├─ Ok  ─► processed++, event:processed
//!                                                      └─ Err ─► RetryScheduler
//! ```
//!
//! A loop only ever drains its own priority's queue, so a low-priority
//! backlog never delays high-priority work. Within one queue, order is
//! strict FIFO.
//!
//! # Shutdown
//!
//! `stop()` cancels a token that each loop checks between iterations. The
//! blocking pop is bounded by `pop_timeout`, so a loop notices promptly; an
//! in-flight handler is always allowed to finish. The pop itself is never
//! raced against cancellation, since dropping a pop mid-flight could lose an
//! element the store already handed out.

use crate::config::ProcessorConfig;
use crate::event::{Event, EventKind, Priority};
use crate::handlers::{Handler, HandlerError, HandlerRegistry, HandlerResult};
use crate::metrics::MetricsRegistry;
use crate::notify::{Bus, Notification};
use crate::retry::RetryScheduler;
use crate::store::{QueueKeys, QueueStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Owns the consumer loops and the handler registry.
pub struct EventProcessor {
    store: Arc<dyn QueueStore>,
    keys: QueueKeys,
    handlers: HandlerRegistry,
    retry: Arc<RetryScheduler>,
    metrics: Arc<MetricsRegistry>,
    bus: Bus,
    pop_timeout: Duration,
    handler_timeout: Option<Duration>,
    error_backoff: Duration,
    cancel: CancellationToken,
    loops: Vec<JoinHandle<()>>,
}

impl EventProcessor {
    pub fn new(
        store: Arc<dyn QueueStore>,
        keys: QueueKeys,
        retry: Arc<RetryScheduler>,
        metrics: Arc<MetricsRegistry>,
        bus: Bus,
        config: &ProcessorConfig,
    ) -> Self {
        Self {
            store,
            keys,
            handlers: HandlerRegistry::new(),
            retry,
            metrics,
            bus,
            pop_timeout: config.pop_timeout(),
            handler_timeout: config.handler_timeout(),
            error_backoff: config.error_backoff(),
            cancel: CancellationToken::new(),
            loops: Vec::new(),
        }
    }

    /// Bind a handler. Registrations after `start()` apply on the next start.
    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn Handler>) {
        self.handlers.register(kind, handler);
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn is_running(&self) -> bool {
        !self.loops.is_empty()
    }

    /// Launch one consumer loop per priority.
    pub fn start(&mut self) {
        if self.is_running() {
            warn!("Processor already running");
            return;
        }

        for kind in self.handlers.unhandled_kinds() {
            warn!(
                event_type = %kind,
                "No handler registered, events of this type will be dropped"
            );
        }

        self.cancel = CancellationToken::new();
        let consumer = Arc::new(Consumer {
            store: self.store.clone(),
            keys: self.keys.clone(),
            handlers: self.handlers.clone(),
            retry: self.retry.clone(),
            metrics: self.metrics.clone(),
            bus: self.bus.clone(),
            pop_timeout: self.pop_timeout,
            handler_timeout: self.handler_timeout,
            error_backoff: self.error_backoff,
            cancel: self.cancel.clone(),
        });

        for priority in Priority::ALL {
            self.loops.push(tokio::spawn(consumer.clone().run(priority)));
        }

        info!(
            loops = self.loops.len(),
            handlers = self.handlers.len(),
            pop_timeout_ms = self.pop_timeout.as_millis() as u64,
            "Processor started"
        );
    }

    /// Signal every loop to stop and wait for them to exit.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        for handle in self.loops.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Consumer loop terminated abnormally");
            }
        }

        info!("Processor stopped");
    }
}

/// State shared by the consumer loops.
struct Consumer {
    store: Arc<dyn QueueStore>,
    keys: QueueKeys,
    handlers: HandlerRegistry,
    retry: Arc<RetryScheduler>,
    metrics: Arc<MetricsRegistry>,
    bus: Bus,
    pop_timeout: Duration,
    handler_timeout: Option<Duration>,
    error_backoff: Duration,
    cancel: CancellationToken,
}

impl Consumer {
    async fn run(self: Arc<Self>, priority: Priority) {
        let key = self.keys.queue(priority).to_string();
        info!(priority = %priority, key = %key, "Consumer loop started");

        let mut processed: u64 = 0;

        while !self.cancel.is_cancelled() {
            match self.cycle(&key).await {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(
                        priority = %priority,
                        error = %e,
                        "Consumer cycle failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.error_backoff) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }
            }
        }

        info!(
            priority = %priority,
            events = processed,
            "Consumer loop stopped"
        );
    }

    /// One pop+dispatch cycle. Returns whether an element was consumed.
    async fn cycle(&self, key: &str) -> Result<bool, StoreError> {
        let Some(raw) = self.store.blocking_pop(key, self.pop_timeout).await? else {
            return Ok(false);
        };

        let event: Event = match serde_json::from_str(&raw) {
            Ok(event) => event,
            Err(e) => {
                // poison message: never retried
                warn!(
                    key = %key,
                    error = %e,
                    raw_len = raw.len(),
                    "Dropping malformed queue entry"
                );
                self.metrics.record_dropped();
                self.bus.publish(Notification::Dropped {
                    event_id: None,
                    reason: format!("malformed payload: {e}"),
                });
                return Ok(true);
            }
        };

        self.dispatch(event).await;
        Ok(true)
    }

    async fn dispatch(&self, event: Event) {
        let Some(handler) = self.handlers.get(event.kind) else {
            warn!(
                route_id = %event.id,
                event_type = %event.kind,
                "No handler registered for event type, dropping"
            );
            self.metrics.record_dropped();
            self.bus.publish(Notification::Dropped {
                event_id: Some(event.id.clone()),
                reason: format!("no handler registered for '{}'", event.kind),
            });
            return;
        };

        debug!(
            route_id = %event.id,
            event_type = %event.kind,
            handler = %handler.name(),
            retry_count = event.retry_count,
            "Dispatching event"
        );

        match self.invoke(handler.as_ref(), &event).await {
            Ok(result) => {
                self.metrics.record_processed();
                debug!(
                    route_id = %event.id,
                    handler = %result.handler_name,
                    message = %result.message,
                    metadata = ?result.metadata,
                    "Event processed"
                );
                self.bus.publish(Notification::Processed(event));
            }
            Err(e) => {
                self.retry.handle_failure(event, &e);
            }
        }
    }

    async fn invoke(
        &self,
        handler: &dyn Handler,
        event: &Event,
    ) -> Result<HandlerResult, HandlerError> {
        match self.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, handler.handle(event))
                .await
                .unwrap_or_else(|_| Err(HandlerError::Timeout(limit.as_millis() as u64))),
            None => handler.handle(event).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaneConfig;
    use crate::event::NewEvent;
    use crate::handlers::LogHandler;
    use crate::retry::RetryPolicy;
    use crate::router::EventRouter;
    use crate::store::MemoryQueueStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct Fixture {
        processor: EventProcessor,
        router: Arc<EventRouter>,
        store: Arc<MemoryQueueStore>,
        metrics: Arc<MetricsRegistry>,
        retry: Arc<RetryScheduler>,
    }

    fn fixture(max_retries: u32, handler_timeout_ms: u64) -> Fixture {
        let store = Arc::new(MemoryQueueStore::new());
        let lanes = [LaneConfig::new("build", None)]
            .into_iter()
            .map(|lane| (lane.name.clone(), lane))
            .collect();
        let metrics = Arc::new(MetricsRegistry::new(["build"]));
        let bus = Bus::default();
        let keys = QueueKeys::new("test");
        let router = Arc::new(EventRouter::new(
            store.clone(),
            keys.clone(),
            lanes,
            "build",
            metrics.clone(),
            bus.clone(),
        ));
        let retry = Arc::new(RetryScheduler::new(
            RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(100),
                multiplier: 2.0,
                max_delay: Duration::from_secs(60),
            },
            router.clone(),
            store.clone(),
            metrics.clone(),
            bus.clone(),
            Duration::from_millis(100),
        ));
        let config = ProcessorConfig {
            pop_timeout_ms: 50,
            handler_timeout_ms,
            error_backoff_ms: 100,
        };
        let processor = EventProcessor::new(
            store.clone(),
            keys,
            retry.clone(),
            metrics.clone(),
            bus,
            &config,
        );
        Fixture {
            processor,
            router,
            store,
            metrics,
            retry,
        }
    }

    struct FailingHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Handler for FailingHandler {
        fn name(&self) -> &str {
            "failing"
        }

        async fn handle(&self, _event: &Event) -> Result<HandlerResult, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::failed("boom"))
        }
    }

    struct SlowHandler {
        delay: Duration,
        finished: AtomicBool,
    }

    #[async_trait]
    impl Handler for SlowHandler {
        fn name(&self) -> &str {
            "slow"
        }

        async fn handle(&self, _event: &Event) -> Result<HandlerResult, HandlerError> {
            tokio::time::sleep(self.delay).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(HandlerResult::success("slow", "done"))
        }
    }

    async fn route(router: &EventRouter, kind: EventKind) -> Event {
        router
            .route_event(NewEvent::new(kind, "build", json!({})))
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_processes_successful_event() {
        let mut f = fixture(3, 0);
        f.processor.register(EventKind::Build, Arc::new(LogHandler::new()));
        f.processor.start();
        assert!(f.processor.is_running());

        route(&f.router, EventKind::Build).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        f.processor.stop().await;

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.total_events, 1);
        assert_eq!(snapshot.processed_events, 1);
        assert!(!f.processor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_retries_then_dead_letters() {
        let mut f = fixture(2, 0);
        let handler = Arc::new(FailingHandler {
            calls: AtomicU32::new(0),
        });
        f.processor.register(EventKind::Build, handler.clone());
        f.processor.start();

        let event = route(&f.router, EventKind::Build).await;
        // 100ms + 200ms of backoff, plus slack
        tokio::time::sleep(Duration::from_secs(2)).await;
        f.processor.stop().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        let dead = f.store.range("test:queue:deadletter", 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        let dead: Event = serde_json::from_str(&dead[0]).unwrap();
        assert_eq!(dead.id, event.id);
        assert_eq!(dead.retry_count, 2);
        assert_eq!(dead.failure_reason.as_deref(), Some("boom"));

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.retried_events, 2);
        assert_eq!(snapshot.dead_letter_events, 1);
        assert_eq!(snapshot.processed_events, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_type_dropped_not_retried() {
        let mut f = fixture(3, 0);
        f.processor.register(EventKind::Build, Arc::new(LogHandler::new()));
        f.processor.start();

        route(&f.router, EventKind::Deploy).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        f.processor.stop().await;

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.dropped_events, 1);
        assert_eq!(snapshot.retried_events, 0);
        assert_eq!(snapshot.dead_letter_events, 0);
        assert_eq!(f.retry.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_entry_skipped_and_loop_continues() {
        let mut f = fixture(3, 0);
        f.processor.register(EventKind::Build, Arc::new(LogHandler::new()));

        f.store
            .push("test:queue:normal", "{not json".to_string())
            .await
            .unwrap();
        route(&f.router, EventKind::Build).await;

        f.processor.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        f.processor.stop().await;

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.dropped_events, 1);
        assert_eq!(snapshot.processed_events, 1);
        assert_eq!(snapshot.dead_letter_events, 0);
        assert_eq!(f.store.length("test:queue:normal").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_goes_through_retry() {
        let mut f = fixture(0, 100);
        f.processor.register(
            EventKind::Build,
            Arc::new(SlowHandler {
                delay: Duration::from_secs(10),
                finished: AtomicBool::new(false),
            }),
        );
        f.processor.start();

        route(&f.router, EventKind::Build).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        f.processor.stop().await;

        let dead = f.store.range("test:queue:deadletter", 1).await.unwrap();
        let dead: Event = serde_json::from_str(&dead[0]).unwrap();
        assert_eq!(
            dead.failure_reason.as_deref(),
            Some("handler timed out after 100ms")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_inflight_handler_finish() {
        let mut f = fixture(3, 0);
        let handler = Arc::new(SlowHandler {
            delay: Duration::from_secs(3),
            finished: AtomicBool::new(false),
        });
        f.processor.register(EventKind::Build, handler.clone());
        f.processor.start();

        route(&f.router, EventKind::Build).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!handler.finished.load(Ordering::SeqCst));

        f.processor.stop().await;

        assert!(handler.finished.load(Ordering::SeqCst));
        assert_eq!(f.metrics.snapshot().processed_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_outage_does_not_kill_loops() {
        let mut f = fixture(3, 0);
        f.processor.register(EventKind::Build, Arc::new(LogHandler::new()));
        f.processor.start();

        f.store.set_offline(true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        f.store.set_offline(false);

        route(&f.router, EventKind::Build).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        f.processor.stop().await;

        assert_eq!(f.metrics.snapshot().processed_events, 1);
    }
}
