//! Graceful shutdown coordination for the Switchyard service.
//!
//! A [`ShutdownSignal`] is triggered once, either by SIGINT/SIGTERM or
//! programmatically, and every clone observes it. The service binary uses it
//! to stop accepting HTTP requests and then to bound how long the pipeline
//! may take to drain.
//!
//! # Example
//!
//! ```rust,ignore
//! use switchyard::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! tokio::spawn(shutdown.clone().listen());
//!
//! axum::serve(listener, app)
//!     .with_graceful_shutdown(shutdown.clone().triggered())
//!     .await?;
//!
//! shutdown.drain(coordinator.stop(true)).await;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Default drain timeout in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
    timeout: Duration,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGINT or SIGTERM, then trigger.
    ///
    /// If a handler cannot be installed that signal is simply never observed.
    pub async fn listen(self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.clone().triggered() => return,
        }

        self.trigger();
    }

    /// Resolves once shutdown has been triggered, even if that happened
    /// before this was called.
    pub async fn triggered(self) {
        let mut receiver = self.sender.subscribe();
        if self.is_shutdown() {
            return;
        }
        let _ = receiver.recv().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger shutdown. Only the first call notifies receivers.
    pub fn trigger(&self) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutdown triggered");
        let _ = self.sender.send(());
    }

    /// Run a drain future bounded by the shutdown timeout.
    ///
    /// Returns `true` if it completed in time.
    pub async fn drain<F: Future>(&self, fut: F) -> bool {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "Shutdown timeout reached, forcing shutdown"
                );
                false
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_signal_creation() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.timeout(), Duration::from_secs(30));
        assert!(!signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();
        let mut receiver = signal.subscribe();

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(100), receiver.recv()).await;
        assert!(result.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_triggered_after_the_fact() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.trigger();

        let result =
            tokio::time::timeout(Duration::from_millis(50), signal.clone().triggered()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_clone_receives_signal() {
        let signal = ShutdownSignal::new();
        let signal2 = signal.clone();

        let mut receiver1 = signal.subscribe();
        let mut receiver2 = signal2.subscribe();

        signal2.trigger();

        assert!(receiver1.recv().await.is_ok());
        assert!(receiver2.recv().await.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let signal = ShutdownSignal::with_timeout(Duration::from_secs(5));

        assert!(signal.drain(async {}).await);
        assert!(
            !signal
                .drain(tokio::time::sleep(Duration::from_secs(60)))
                .await
        );
    }
}
