//! Handler system for Switchyard.
//!
//! Handlers hold the per-type business logic. The [`Handler`] trait is the
//! contract every one of them implements, and [`HandlerRegistry`] maps each
//! [`EventKind`] to exactly one handler.
//!
//! ## Contract
//!
//! - Return `Ok(HandlerResult)` on success, `Err(HandlerError)` on failure.
//!   A failure is retried with backoff and dead-lettered once retries run out.
//! - Delivery is at-least-once: the same event may be handled more than once,
//!   so handlers must be idempotent.
//! - A handler may be cancelled by the per-invocation timeout, so it must not
//!   leave shared state half-updated across an `.await`.
//!
//! ## Creating Custom Handlers
//!
//! ```rust,ignore
//! use switchyard::{Event, Handler, HandlerError, HandlerResult};
//! use async_trait::async_trait;
//!
//! struct DeployNotifier;
//!
//! #[async_trait]
//! impl Handler for DeployNotifier {
//!     fn name(&self) -> &str {
//!         "deploy-notifier"
//!     }
//!
//!     async fn handle(&self, event: &Event) -> Result<HandlerResult, HandlerError> {
//!         Ok(HandlerResult::success(self.name(), "notified"))
//!     }
//! }
//! ```

pub mod log;

use crate::event::{Event, EventKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub use self::log::LogHandler;

/// Errors a handler can report.
///
/// The `Display` output becomes the dead-letter `failureReason`, so
/// [`HandlerError::Failed`] renders the message unchanged.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    /// The invocation exceeded the configured handler timeout.
    #[error("handler timed out after {0}ms")]
    Timeout(u64),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Result of a successful handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerResult {
    pub handler_name: String,

    pub message: String,

    pub metadata: Option<serde_json::Value>,
}

impl HandlerResult {
    pub fn success(handler_name: &str, message: impl Into<String>) -> Self {
        Self {
            handler_name: handler_name.to_string(),
            message: message.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(
        handler_name: &str,
        message: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            handler_name: handler_name.to_string(),
            message: message.into(),
            metadata: Some(metadata),
        }
    }
}

/// The core Handler trait.
///
/// Handlers must be `Send + Sync`; they are shared by the consumer loops.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Short name used in logs (e.g. "log", "health").
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> Result<HandlerResult, HandlerError>;
}

/// Maps each event kind to its handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous binding.
    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn Handler>) {
        debug!(
            event_type = %kind,
            handler = %handler.name(),
            "Registering handler"
        );
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: EventKind) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Event kinds with no registered handler.
    pub fn unhandled_kinds(&self) -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|kind| !self.handlers.contains_key(kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct TestHandler;

    #[async_trait]
    impl Handler for TestHandler {
        fn name(&self) -> &str {
            "test"
        }

        async fn handle(&self, _event: &Event) -> Result<HandlerResult, HandlerError> {
            Ok(HandlerResult::success("test", "Test executed"))
        }
    }

    #[test]
    fn test_registry() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register(EventKind::Build, Arc::new(TestHandler));

        assert!(registry.contains(EventKind::Build));
        assert!(registry.get(EventKind::Build).is_some());
        assert!(registry.get(EventKind::Deploy).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.unhandled_kinds().len(), EventKind::ALL.len() - 1);
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = HandlerRegistry::new();
        registry.register(EventKind::Test, Arc::new(TestHandler));
        registry.register(EventKind::Test, Arc::new(LogHandler::new()));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(EventKind::Test).unwrap().name(), "log");
    }

    #[test]
    fn test_failed_message_is_verbatim() {
        let error = HandlerError::failed("disk full");
        assert_eq!(error.to_string(), "disk full");
        assert_eq!(
            HandlerError::Timeout(250).to_string(),
            "handler timed out after 250ms"
        );
    }

    #[test]
    fn test_handler_result() {
        let result = HandlerResult::success("test", "Done");
        assert_eq!(result.handler_name, "test");
        assert!(result.metadata.is_none());

        let with_meta = HandlerResult::with_metadata("test", "Done", json!({"count": 42}));
        assert!(with_meta.metadata.is_some());
    }
}
