//! Timers that run independently of request traffic

use crate::backup::BackupReconciler;
use crate::config::SleepPolicy;
use crate::supervisor::GatewaySupervisor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// How often the idle policy is evaluated
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Push the backup every `interval` until shutdown.
///
/// The first push happens one full interval after arming, so it never
/// overlaps the restore that runs before the loop starts.
pub async fn backup_loop(
    reconciler: Arc<BackupReconciler>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "Backup schedule armed");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let outcome = reconciler.push().await;
                if outcome.success {
                    info!(last_sync = outcome.last_sync.as_deref().unwrap_or(""), "Scheduled backup completed");
                } else {
                    error!(
                        error = outcome.error.as_deref().unwrap_or(""),
                        details = outcome.details.as_deref().unwrap_or(""),
                        "Scheduled backup failed"
                    );
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("Backup schedule stopped");
                    break;
                }
            }
        }
    }
}

/// Apply `policy` every `check_interval` until shutdown
pub async fn idle_loop(
    supervisor: Arc<GatewaySupervisor>,
    policy: SleepPolicy,
    check_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if policy.duration().is_none() {
        debug!("Idle stop disabled");
        return;
    }
    loop {
        tokio::select! {
            _ = tokio::time::sleep(check_interval) => {
                supervisor.stop_if_idle(policy).await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
