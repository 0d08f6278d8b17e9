//! In-process queue store.
//!
//! Backs local development (`store.backend = "memory"`) and the test suite.
//! Blocked poppers park on a [`Notify`] and are woken by every push, so a
//! pop returns as soon as an element arrives instead of at the next poll.

use super::{QueueStore, StoreError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    values: HashMap<String, (String, Instant)>,
}

/// A [`QueueStore`] held entirely in memory.
#[derive(Default)]
pub struct MemoryQueueStore {
    state: Mutex<State>,
    pushed: Notify,
    offline: AtomicBool,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Connection("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Command("memory store lock poisoned".to_string()))
    }

    fn try_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.lock()?;
        Ok(state.lists.get_mut(key).and_then(|list| list.pop_front()))
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn push(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.check_online()?;
        self.lock()?
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value);
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn blocking_pop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;

        loop {
            self.check_online()?;

            // Register interest before checking, so a push between the check
            // and the await is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(key)? {
                return Ok(Some(value));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn length(&self, key: &str) -> Result<u64, StoreError> {
        self.check_online()?;
        Ok(self
            .lock()?
            .lists
            .get(key)
            .map(|list| list.len() as u64)
            .unwrap_or(0))
    }

    async fn range(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        Ok(self
            .lock()?
            .lists
            .get(key)
            .map(|list| list.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.check_online()?;
        self.lock()?
            .values
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_online()?;
        let mut state = self.lock()?;
        match state.values.get(key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                state.values.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_online()
    }

    async fn close(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }
}
