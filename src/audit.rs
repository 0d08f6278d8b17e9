//! Audit trail - per-event JSON artifacts.
//!
//! Subscribes to the notification bus and writes one file per dead-lettered
//! event and per health cycle (and optionally per routed event) into the
//! configured directory. File names are derived from the routing identifier
//! and the relevant timestamp so a given artifact is always written to the
//! same path.
//!
//! The trail is observability only. A failed write is logged and forgotten.

use crate::config::AuditConfig;
use crate::notify::Notification;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Writes audit artifacts for lifecycle notifications.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    dir: PathBuf,
    include_routed: bool,
}

impl AuditTrail {
    pub fn new(dir: impl Into<PathBuf>, include_routed: bool) -> Self {
        Self {
            dir: dir.into(),
            include_routed,
        }
    }

    pub fn from_config(config: &AuditConfig) -> Self {
        Self::new(&config.dir, config.routed)
    }

    /// File name for a notification, or `None` if it is not audited.
    pub fn artifact_name(&self, notification: &Notification) -> Option<String> {
        match notification {
            Notification::DeadLettered(event) => {
                let failed_at = event.failed_at.unwrap_or(event.routed_at);
                Some(format!(
                    "deadletter_{}_{}.json",
                    event.id,
                    failed_at.timestamp_millis()
                ))
            }
            Notification::HealthChecked(record) => Some(format!(
                "health_{}_{}.json",
                record.probe_id,
                record.timestamp.timestamp_millis()
            )),
            Notification::Routed(event) if self.include_routed => Some(format!(
                "routed_{}_{}.json",
                event.id,
                event.routed_at.timestamp_millis()
            )),
            _ => None,
        }
    }

    /// Write the artifact for one notification, if it is audited.
    pub async fn record(&self, notification: &Notification) -> std::io::Result<Option<PathBuf>> {
        let Some(name) = self.artifact_name(notification) else {
            return Ok(None);
        };

        let body = match notification {
            Notification::DeadLettered(event) | Notification::Routed(event) => to_json(event)?,
            Notification::HealthChecked(record) => to_json(record)?,
            _ => return Ok(None),
        };

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(name);
        tokio::fs::write(&path, body).await?;

        debug!(
            notification = notification.name(),
            path = %path.display(),
            "Audit artifact written"
        );
        Ok(Some(path))
    }

    /// Consume notifications until cancelled.
    ///
    /// Notifications already buffered when the token fires are still drained.
    pub fn spawn(
        self,
        mut rx: broadcast::Receiver<Notification>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(dir = %self.dir.display(), routed = self.include_routed, "Audit trail started");

            loop {
                tokio::select! {
                    biased;
                    received = rx.recv() => match received {
                        Ok(notification) => {
                            if let Err(e) = self.record(&notification).await {
                                warn!(
                                    notification = notification.name(),
                                    error = %e,
                                    "Failed to write audit artifact"
                                );
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped = skipped, "Audit trail lagged, notifications skipped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }

            info!("Audit trail stopped");
        })
    }
}

fn to_json<T: Serialize>(value: &T) -> std::io::Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(std::io::Error::other)
}
