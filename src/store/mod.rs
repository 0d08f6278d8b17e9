//! Durable queue storage.
//!
//! The [`QueueStore`] trait is the boundary to the durable transport: one
//! ordered list per priority, one dead-letter list, and a small key/value
//! area for the latest health record. Nothing queued-but-unconsumed is
//! buffered in-process; the store is the single source of truth.
//!
//! # Keys
//!
//! ```text
//! {prefix}:queue:high
//! {prefix}:queue:normal
//! {prefix}:queue:low
//! {prefix}:queue:deadletter
//! {prefix}:health:latest
//! ```

pub mod memory;
pub mod redis;

use crate::event::Priority;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use self::memory::MemoryQueueStore;
pub use self::redis::RedisQueueStore;

/// Errors reaching or talking to the queue store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("queue store connection error: {0}")]
    Connection(String),

    #[error("queue store command error: {0}")]
    Command(String),
}

/// Push / bounded-blocking-pop / length primitives over named FIFO lists.
///
/// Implementations must preserve FIFO order per key and be safe to share
/// between concurrent consumers. At-least-once is the only delivery
/// guarantee required.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append `value` to the tail of the list at `key`.
    async fn push(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Pop the head of the list at `key`, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when the timeout elapses with nothing to pop.
    async fn blocking_pop(&self, key: &str, timeout: Duration)
        -> Result<Option<String>, StoreError>;

    async fn length(&self, key: &str) -> Result<u64, StoreError>;

    /// Read `count` elements from the head of the list without removing them.
    async fn range(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError>;

    /// Overwrite `key` with `value`, expiring after `ttl`.
    async fn set_with_expiry(&self, key: &str, value: String, ttl: Duration)
        -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Release connections. Called once, last, during shutdown.
    async fn close(&self) {}
}

/// Key layout for one deployment, derived from a configurable prefix.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    high: String,
    normal: String,
    low: String,
    dead_letter: String,
    health: String,
}

impl QueueKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            high: format!("{prefix}:queue:high"),
            normal: format!("{prefix}:queue:normal"),
            low: format!("{prefix}:queue:low"),
            dead_letter: format!("{prefix}:queue:deadletter"),
            health: format!("{prefix}:health:latest"),
        }
    }

    pub fn queue(&self, priority: Priority) -> &str {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }

    pub fn dead_letter(&self) -> &str {
        &self.dead_letter
    }

    pub fn health(&self) -> &str {
        &self.health
    }
}
