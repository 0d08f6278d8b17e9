//! # Switchyard
//!
//! An asynchronous, priority-aware event routing and processing pipeline.
//! Producers submit typed events; each is assigned a lane and a priority,
//! queued in a shared store, and consumed by independent per-priority loops
//! that dispatch to type-specific handlers. Failures are retried with
//! exponential backoff and moved to a dead-letter store once retries run out.
//!
//! ## Architecture
//!
//! ```text
//! Producer -> Coordinator -> Router -> queue:{high,normal,low}
//!                                          |
//!                 Processor loops (one per priority) -> Handler
//!                                          |
//!                            RetryScheduler -> Router | queue:deadletter
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Event data model
//! - [`store`]: Queue store contract with Redis and in-memory backends
//! - [`router`]: Lane and priority assignment
//! - [`processor`]: Per-priority consumer loops
//! - [`retry`]: Backoff policy and dead-lettering
//! - [`handlers`]: Handler trait and built-in handlers
//! - [`health`]: Synthetic probe and health records
//! - [`coordinator`]: Composition root and lifecycle

pub mod audit;
pub mod config;
pub mod coordinator;
pub mod event;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod notify;
pub mod processor;
pub mod retry;
pub mod router;
pub mod shutdown;
pub mod store;

// Re-export commonly used types at crate root
pub use config::SwitchyardConfig;
pub use coordinator::{Coordinator, CoordinatorError};
pub use event::{Event, EventKind, NewEvent, Priority};
pub use handlers::{Handler, HandlerError, HandlerResult};
pub use metrics::MetricsSnapshot;
pub use notify::Notification;
pub use router::RouteError;
pub use store::{MemoryQueueStore, QueueStore, RedisQueueStore};
