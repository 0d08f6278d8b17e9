//! Process-wide event counters.
//!
//! [`MetricsRegistry`] is shared by the router, the consumer loops and the
//! health monitor. Every mutation is a single relaxed atomic add; reads build
//! a [`MetricsSnapshot`] field by field, so a snapshot may be slightly stale
//! relative to concurrent writers but never takes a global lock.
//!
//! Per-lane counters are created once from the static lane set, which keeps
//! the lane map itself immutable after construction.

use crate::event::Priority;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Point-in-time copy of the counters. Never mutated by callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_events: u64,
    pub processed_events: u64,
    pub failed_events: u64,
    pub retried_events: u64,
    pub dead_letter_events: u64,
    /// Events given up on: unknown type, malformed payload, or a pending
    /// write abandoned at shutdown.
    pub dropped_events: u64,
    pub events_by_lane: BTreeMap<String, u64>,
    pub events_by_priority: BTreeMap<Priority, u64>,
    pub uptime_seconds: u64,
}

/// Shared counters for the whole pipeline.
pub struct MetricsRegistry {
    total: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_letter: AtomicU64,
    dropped: AtomicU64,
    by_lane: HashMap<String, AtomicU64>,
    by_priority: [AtomicU64; 3],
    start_time: Instant,
}

impl MetricsRegistry {
    /// Create a registry with one counter per configured lane.
    pub fn new<I, S>(lanes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            total: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_letter: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            by_lane: lanes
                .into_iter()
                .map(|lane| (lane.into(), AtomicU64::new(0)))
                .collect(),
            by_priority: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            start_time: Instant::now(),
        }
    }

    /// A freshly routed producer event.
    pub fn record_routed(&self, lane: &str, priority: Priority) {
        self.total.fetch_add(1, Ordering::Relaxed);
        // lanes are resolved against the static set before this is called
        if let Some(counter) = self.by_lane.get(lane) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        self.by_priority[priority.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    /// A terminal failure: counts as both failed and dead-lettered.
    pub fn record_dead_lettered(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.dead_letter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_events: self.total.load(Ordering::Relaxed),
            processed_events: self.processed.load(Ordering::Relaxed),
            failed_events: self.failed.load(Ordering::Relaxed),
            retried_events: self.retried.load(Ordering::Relaxed),
            dead_letter_events: self.dead_letter.load(Ordering::Relaxed),
            dropped_events: self.dropped.load(Ordering::Relaxed),
            events_by_lane: self
                .by_lane
                .iter()
                .map(|(lane, count)| (lane.clone(), count.load(Ordering::Relaxed)))
                .collect(),
            events_by_priority: Priority::ALL
                .iter()
                .map(|p| (*p, self.by_priority[p.index()].load(Ordering::Relaxed)))
                .collect(),
            uptime_seconds: self.uptime_seconds(),
        }
    }
}
