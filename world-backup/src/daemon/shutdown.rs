//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A backup that is already writing its archive is allowed to finish; no new
//! backups start once the host has been disabled.

use crate::executor::BackupManager;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// How long shutdown waits for an in-flight backup
pub const DEFAULT_GRACE: Duration = Duration::from_secs(300);

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    /// Get a shutdown receiver
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Wait for SIGTERM or SIGINT, then notify subscribers
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.notify();
    }

    /// Notify subscribers without waiting for a signal
    pub fn notify(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("No tasks were listening for shutdown: {}", e);
        }
    }

    /// Wait for a running backup to finish, up to `grace`
    pub async fn shutdown(&self, manager: &BackupManager, grace: Duration) {
        info!("Graceful shutdown initiated");

        if manager.is_running() {
            info!("Waiting for the running backup to finish...");
        }
        if !manager.wait_until_idle(grace).await {
            warn!(
                "Backup still running after {}s, exiting anyway",
                grace.as_secs()
            );
        }
        if manager.uploader().is_uploading() {
            warn!("An upload is still in progress and will be interrupted");
        }

        info!("Graceful shutdown complete");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
