//! Log Handler - Structured logging of events.
//!
//! The [`LogHandler`] is the stock handler bound through the `[handlers]`
//! config table. It records each event with `tracing` and always succeeds.
//!
//! ```rust,ignore
//! use switchyard::handlers::LogHandler;
//!
//! let handler = LogHandler::with_prefix("deploy");
//! ```

use super::{Handler, HandlerError, HandlerResult};
use crate::event::Event;
use async_trait::async_trait;
use tracing::info;

/// A handler that logs events using structured logging.
#[derive(Debug, Clone)]
pub struct LogHandler {
    prefix: String,
}

impl LogHandler {
    pub fn new() -> Self {
        Self {
            prefix: "event".to_string(),
        }
    }

    /// The prefix distinguishes log handlers bound to different kinds.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LogHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, event: &Event) -> Result<HandlerResult, HandlerError> {
        info!(
            prefix = %self.prefix,
            route_id = %event.id,
            event_type = %event.kind,
            lane = %event.lane,
            priority = %event.priority,
            retry_count = event.retry_count,
            payload = %event.payload,
            "[{}] Handled: {}/{}",
            self.prefix,
            event.lane,
            event.kind
        );

        Ok(HandlerResult::success(
            self.name(),
            format!(
                "Logged event {} ({}/{}) with prefix '{}'",
                event.id, event.lane, event.kind, self.prefix
            ),
        ))
    }
}
