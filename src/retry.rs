//! Retry Scheduler - bounded retries with exponential backoff.
//!
//! Called by the processor whenever a handler fails. With `n` being the
//! event's current `retry_count`:
//!
//! ```text
//! n < max_retries   retry_count = n + 1
//!                   delay = base_delay × multiplier^n   (clamped to max_delay)
//!                   after delay: EventRouter::reroute(event)
//!
//! n >= max_retries  failed_at = now, failure_reason = error message
//!                   push to the dead-letter list (never expires)
//! ```
//!
//! Delays and store writes run on their own tracked tasks, so the consumer
//! loop that saw the failure keeps draining its queue while the event waits.
//! A write that hits a store outage is attempted again every
//! `processor.error_backoff_ms` until it lands. Counters move only once it
//! has. An event still held when shutdown abandons pending work is counted
//! as dropped and announced with `event:dropped`.

use crate::config::RetryConfig;
use crate::event::Event;
use crate::handlers::HandlerError;
use crate::metrics::MetricsRegistry;
use crate::notify::{Bus, Notification};
use crate::router::{EventRouter, RouteError};
use crate::store::QueueStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Retry budget and backoff curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor per failed attempt (`>= 1.0` for non-decreasing delays).
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before re-routing an event that has already been retried
    /// `retry_count` times. The first retry (`retry_count = 0`) waits exactly
    /// `base_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs < 0.0 || secs > self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// What the scheduler decided for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-routed after `delay`; `attempt` is the new `retry_count`.
    Retry { attempt: u32, delay: Duration },
    /// Handed to the dead-letter writer.
    DeadLettered,
}

/// Where a consumed event is headed next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Queue,
    DeadLetter,
}

impl Target {
    fn as_str(&self) -> &'static str {
        match self {
            Target::Queue => "queue",
            Target::DeadLetter => "deadletter",
        }
    }
}

enum PushFailure {
    /// The store could not be reached; the push is attempted again.
    Unavailable(String),
    /// The event itself cannot be written.
    Rejected(String),
}

/// Holds consumed events until they are back in the store.
struct Delivery {
    router: Arc<EventRouter>,
    store: Arc<dyn QueueStore>,
    metrics: Arc<MetricsRegistry>,
    bus: Bus,
    store_backoff: Duration,
    abandon: CancellationToken,
}

impl Delivery {
    async fn push(&self, event: &Event, target: Target) -> Result<(), PushFailure> {
        match target {
            Target::Queue => match self.router.reroute(event.clone()).await {
                Ok(_) => Ok(()),
                Err(RouteError::QueueUnavailable(e)) => Err(PushFailure::Unavailable(e.to_string())),
                Err(e) => Err(PushFailure::Rejected(e.to_string())),
            },
            Target::DeadLetter => {
                let payload = serde_json::to_string(event)
                    .map_err(|e| PushFailure::Rejected(e.to_string()))?;
                self.store
                    .push(self.router.keys().dead_letter(), payload)
                    .await
                    .map_err(|e| PushFailure::Unavailable(e.to_string()))
            }
        }
    }

    /// Push until it lands. Only shutdown without flush gives up on it.
    async fn deliver(&self, event: Event, target: Target) {
        let mut attempts: u32 = 0;

        loop {
            match self.push(&event, target).await {
                Ok(()) => return self.delivered(event, target),
                Err(PushFailure::Rejected(reason)) => return self.discard(event, reason),
                Err(PushFailure::Unavailable(reason)) => {
                    attempts += 1;
                    warn!(
                        route_id = %event.id,
                        target = target.as_str(),
                        attempts = attempts,
                        backoff_ms = self.store_backoff.as_millis() as u64,
                        error = %reason,
                        "Queue store unavailable, holding event"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(self.store_backoff) => {}
                        _ = self.abandon.cancelled() => {
                            return self.discard(
                                event,
                                format!("abandoned at shutdown while the store was unavailable: {reason}"),
                            );
                        }
                    }
                }
            }
        }
    }

    fn delivered(&self, event: Event, target: Target) {
        match target {
            Target::Queue => {
                self.metrics.record_retried();
                debug!(
                    route_id = %event.id,
                    retry_count = event.retry_count,
                    "Retry re-routed"
                );
            }
            Target::DeadLetter => {
                self.metrics.record_dead_lettered();
                error!(
                    route_id = %event.id,
                    event_type = %event.kind,
                    lane = %event.lane,
                    retry_count = event.retry_count,
                    reason = event.failure_reason.as_deref().unwrap_or_default(),
                    "Retries exhausted, event moved to dead-letter store"
                );
                self.bus.publish(Notification::DeadLettered(event));
            }
        }
    }

    fn discard(&self, event: Event, reason: String) {
        error!(route_id = %event.id, reason = %reason, "Dropping consumed event");
        self.metrics.record_dropped();
        self.bus.publish(Notification::Dropped {
            event_id: Some(event.id),
            reason,
        });
    }
}

/// Decides retry versus dead-letter and owns every consumed event until it
/// is written back to the store.
///
/// A failed write is attempted again every `store_backoff`, so a short store
/// outage delays the event instead of losing it.
pub struct RetryScheduler {
    policy: RetryPolicy,
    delivery: Arc<Delivery>,
    tracker: TaskTracker,
    flush: CancellationToken,
}

impl RetryScheduler {
    pub fn new(
        policy: RetryPolicy,
        router: Arc<EventRouter>,
        store: Arc<dyn QueueStore>,
        metrics: Arc<MetricsRegistry>,
        bus: Bus,
        store_backoff: Duration,
    ) -> Self {
        Self {
            policy,
            delivery: Arc::new(Delivery {
                router,
                store,
                metrics,
                bus,
                store_backoff,
                abandon: CancellationToken::new(),
            }),
            tracker: TaskTracker::new(),
            flush: CancellationToken::new(),
        }
    }

    /// Number of events waiting on a backoff delay or a store write.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Handle one failed handler invocation.
    ///
    /// The write back to the store happens on a tracked task, so this never
    /// blocks the consumer loop.
    pub fn handle_failure(&self, mut event: Event, error: &HandlerError) -> RetryDecision {
        let retry_count = event.retry_count;

        if self.policy.should_retry(retry_count) {
            let delay = self.policy.delay_for(retry_count);
            event.retry_count = retry_count + 1;

            warn!(
                route_id = %event.id,
                event_type = %event.kind,
                attempt = event.retry_count,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Handler failed, scheduling retry"
            );

            self.delivery.bus.publish(Notification::RetryScheduled {
                event: event.clone(),
                delay,
            });

            let attempt = event.retry_count;
            self.schedule(event, delay);

            return RetryDecision::Retry { attempt, delay };
        }

        event.failed_at = Some(Utc::now());
        event.failure_reason = Some(error.to_string());

        let delivery = self.delivery.clone();
        self.tracker.spawn(async move {
            delivery.deliver(event, Target::DeadLetter).await;
        });

        RetryDecision::DeadLettered
    }

    fn schedule(&self, event: Event, delay: Duration) {
        let delivery = self.delivery.clone();
        let flush = self.flush.clone();

        self.tracker.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = flush.cancelled() => {
                    debug!(route_id = %event.id, "Flushing pending retry early");
                }
                _ = delivery.abandon.cancelled() => {
                    delivery.discard(event, "pending retry abandoned at shutdown".to_string());
                    return;
                }
            }

            delivery.deliver(event, Target::Queue).await;
        });
    }

    /// Settle all pending events.
    ///
    /// With `flush` the remaining delays are skipped and every waiting event
    /// is pushed back onto its queue before this returns; while the store is
    /// down this keeps waiting for it. Without it the waiting events are
    /// dropped and counted as such.
    pub async fn shutdown(&self, flush: bool) {
        let pending = self.tracker.len();
        self.tracker.close();

        if flush {
            self.flush.cancel();
        } else {
            self.delivery.abandon.cancel();
        }
        self.tracker.wait().await;

        info!(pending = pending, flushed = flush, "Retry scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaneConfig;
    use crate::event::{EventKind, NewEvent, Priority};
    use crate::store::{MemoryQueueStore, QueueKeys};
    use serde_json::json;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
        }
    }

    struct Fixture {
        scheduler: RetryScheduler,
        router: Arc<EventRouter>,
        store: Arc<MemoryQueueStore>,
        metrics: Arc<MetricsRegistry>,
        bus: Bus,
    }

    fn fixture(max_retries: u32) -> Fixture {
        let store = Arc::new(MemoryQueueStore::new());
        let lanes = [LaneConfig::new("build", Some(Priority::Normal))]
            .into_iter()
            .map(|lane| (lane.name.clone(), lane))
            .collect();
        let metrics = Arc::new(MetricsRegistry::new(["build"]));
        let bus = Bus::default();
        let router = Arc::new(EventRouter::new(
            store.clone(),
            QueueKeys::new("test"),
            lanes,
            "build",
            metrics.clone(),
            bus.clone(),
        ));
        let scheduler = RetryScheduler::new(
            policy(max_retries),
            router.clone(),
            store.clone(),
            metrics.clone(),
            bus.clone(),
            Duration::from_millis(500),
        );
        Fixture {
            scheduler,
            router,
            store,
            metrics,
            bus,
        }
    }

    /// Route an event and take it off the queue, as a consumer would.
    async fn consumed_event(f: &Fixture) -> Event {
        let event = f
            .router
            .route_event(NewEvent::new(EventKind::Build, "build", json!({})))
            .await
            .unwrap();
        f.store
            .blocking_pop("test:queue:normal", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        event
    }

    #[test]
    fn test_delay_sequence() {
        let p = policy(3);
        assert_eq!(p.delay_for(0), Duration::from_millis(1000));
        assert_eq!(p.delay_for(1), Duration::from_millis(2000));
        assert_eq!(p.delay_for(2), Duration::from_millis(4000));
    }

    #[test]
    fn test_delay_non_decreasing() {
        for multiplier in [1.0, 1.5, 2.0, 3.0] {
            let p = RetryPolicy {
                multiplier,
                ..policy(20)
            };
            let mut previous = Duration::ZERO;
            for n in 0..20 {
                let delay = p.delay_for(n);
                assert!(
                    delay >= previous,
                    "multiplier {multiplier}: delay {n} shrank"
                );
                previous = delay;
            }
        }
    }

    #[test]
    fn test_delay_clamped() {
        let p = RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..policy(100)
        };
        assert_eq!(p.delay_for(10), Duration::from_secs(5));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_policy_from_config() {
        let p = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.base_delay, Duration::from_millis(1000));
        assert_eq!(p.multiplier, 2.0);
    }

    /// Let spawned delivery tasks run without advancing the clock far.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reroutes_once_with_incremented_count() {
        let f = fixture(3);
        let event = consumed_event(&f).await;

        let decision = f
            .scheduler
            .handle_failure(event.clone(), &HandlerError::failed("boom"));

        assert_eq!(
            decision,
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
        // nothing re-queued or counted until the delay elapses
        assert_eq!(f.store.length("test:queue:normal").await.unwrap(), 0);
        assert_eq!(f.scheduler.pending(), 1);
        assert_eq!(f.metrics.snapshot().retried_events, 0);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let queued = f.store.range("test:queue:normal", 10).await.unwrap();
        assert_eq!(queued.len(), 1);
        let requeued: Event = serde_json::from_str(&queued[0]).unwrap();
        assert_eq!(requeued.id, event.id);
        assert_eq!(requeued.retry_count, 1);
        assert!(requeued.failed_at.is_none());

        assert_eq!(f.store.length("test:queue:deadletter").await.unwrap(), 0);
        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.retried_events, 1);
        assert_eq!(snapshot.dead_letter_events, 0);
        assert_eq!(snapshot.total_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_goes_to_dead_letter() {
        let f = fixture(3);
        let mut event = consumed_event(&f).await;
        event.retry_count = 3;

        let decision = f
            .scheduler
            .handle_failure(event.clone(), &HandlerError::failed("still broken"));
        assert_eq!(decision, RetryDecision::DeadLettered);
        settle().await;

        let dead = f.store.range("test:queue:deadletter", 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        let dead: Event = serde_json::from_str(&dead[0]).unwrap();
        assert_eq!(dead.id, event.id);
        assert_eq!(dead.retry_count, 3);
        assert!(dead.is_dead_lettered());
        assert_eq!(dead.failure_reason.as_deref(), Some("still broken"));

        // never re-routed again
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.store.length("test:queue:normal").await.unwrap(), 0);
        assert_eq!(f.scheduler.pending(), 0);

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.failed_events, 1);
        assert_eq!(snapshot.dead_letter_events, 1);
        assert_eq!(snapshot.retried_events, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_dead_letters_immediately() {
        let f = fixture(0);
        let event = consumed_event(&f).await;

        let decision = f
            .scheduler
            .handle_failure(event, &HandlerError::Timeout(100));
        assert_eq!(decision, RetryDecision::DeadLettered);
        settle().await;

        let dead = f.store.range("test:queue:deadletter", 1).await.unwrap();
        let dead: Event = serde_json::from_str(&dead[0]).unwrap();
        assert_eq!(
            dead.failure_reason.as_deref(),
            Some("handler timed out after 100ms")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_write_waits_for_store() {
        let f = fixture(0);
        let event = consumed_event(&f).await;
        f.store.set_offline(true);

        f.scheduler
            .handle_failure(event.clone(), &HandlerError::failed("boom"));

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(f.scheduler.pending(), 1);
        assert_eq!(f.metrics.snapshot().dead_letter_events, 0);

        f.store.set_offline(false);
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(f.scheduler.pending(), 0);
        let dead = f.store.range("test:queue:deadletter", 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        let dead: Event = serde_json::from_str(&dead[0]).unwrap();
        assert_eq!(dead.id, event.id);

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.dead_letter_events, 1);
        assert_eq!(snapshot.dropped_events, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reroute_waits_for_store() {
        let f = fixture(3);
        let event = consumed_event(&f).await;
        f.store.set_offline(true);

        f.scheduler
            .handle_failure(event.clone(), &HandlerError::failed("boom"));

        // delay elapsed, store still down
        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert_eq!(f.scheduler.pending(), 1);
        assert_eq!(f.metrics.snapshot().retried_events, 0);

        f.store.set_offline(false);
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(f.scheduler.pending(), 0);
        let queued = f.store.range("test:queue:normal", 10).await.unwrap();
        assert_eq!(queued.len(), 1);
        let requeued: Event = serde_json::from_str(&queued[0]).unwrap();
        assert_eq!(requeued.id, event.id);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(f.metrics.snapshot().retried_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_write_counts_as_dropped() {
        let f = fixture(0);
        let event = consumed_event(&f).await;
        let mut rx = f.bus.subscribe();
        f.store.set_offline(true);

        f.scheduler
            .handle_failure(event.clone(), &HandlerError::failed("boom"));
        tokio::time::sleep(Duration::from_millis(1200)).await;
        f.scheduler.shutdown(false).await;

        assert_eq!(f.scheduler.pending(), 0);
        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.dropped_events, 1);
        assert_eq!(snapshot.dead_letter_events, 0);

        let mut dropped = None;
        while let Ok(notification) = rx.try_recv() {
            if let Notification::Dropped { event_id, .. } = notification {
                dropped = event_id;
            }
        }
        assert_eq!(dropped, Some(event.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending_retries() {
        let f = fixture(3);
        let mut event = consumed_event(&f).await;
        event.retry_count = 2;

        f.scheduler
            .handle_failure(event, &HandlerError::failed("boom"));

        let start = tokio::time::Instant::now();
        f.scheduler.shutdown(true).await;

        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(f.store.length("test:queue:normal").await.unwrap(), 1);
        assert_eq!(f.scheduler.pending(), 0);
        assert_eq!(f.metrics.snapshot().retried_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_without_flush_abandons() {
        let f = fixture(3);
        let event = consumed_event(&f).await;

        f.scheduler
            .handle_failure(event, &HandlerError::failed("boom"));
        f.scheduler.shutdown(false).await;

        assert_eq!(f.store.length("test:queue:normal").await.unwrap(), 0);
        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.retried_events, 0);
        assert_eq!(snapshot.dropped_events, 1);
    }
}
