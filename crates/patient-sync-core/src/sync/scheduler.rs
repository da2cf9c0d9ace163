//! Background task that decides when sync passes run.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::SyncCoordinator;
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::SyncError;

/// Run passes on reconnect, on every sweep tick while online, and when a
/// scheduled retry falls due. Returns when `shutdown` flips or its sender is
/// dropped.
pub(crate) async fn run_scheduler(
    coordinator: Arc<SyncCoordinator>,
    monitor: Arc<ConnectivityMonitor>,
    mut transitions: broadcast::Receiver<Connectivity>,
    mut shutdown: watch::Receiver<bool>,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick is immediate; startup does not sync.
    sweep.tick().await;
    // After a failed pass, wait for the next sweep instead of hammering retries.
    let mut retries_paused = false;

    loop {
        let retry_in = if retries_paused {
            None
        } else {
            match coordinator.next_retry_at() {
                Ok(at) => at.map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)),
                Err(e) => {
                    warn!(error = %e, "could not read retry schedule");
                    None
                }
            }
        };

        let reason = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            transition = transitions.recv() => match transition {
                Ok(Connectivity::Online) => {
                    resume_retries(&coordinator);
                    "reconnected"
                }
                Ok(Connectivity::Offline) => continue,
                Err(RecvError::Lagged(_)) if monitor.is_online() => {
                    resume_retries(&coordinator);
                    "reconnected"
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            _ = sweep.tick() => {
                retries_paused = false;
                if !monitor.is_online() {
                    continue;
                }
                "sweep"
            }
            _ = tokio::time::sleep(retry_in.unwrap_or_default()), if retry_in.is_some() && monitor.is_online() => {
                "retry due"
            }
            // A pass run elsewhere may have scheduled retries.
            _ = coordinator.pass_finished() => continue,
        };

        debug!(reason, "starting background sync");
        match coordinator.run_pass().await {
            Ok(report) => {
                retries_paused = false;
                if !report.is_clean() {
                    debug!(?report, "background sync left work behind");
                }
            }
            Err(SyncError::ShutDown) => break,
            Err(e) => {
                warn!(error = %e, reason, "background sync failed");
                retries_paused = true;
            }
        }
    }
    info!("sync scheduler stopped");
}

/// Backoff accrued while offline should not delay the reconnect pass.
fn resume_retries(coordinator: &SyncCoordinator) {
    if let Err(e) = coordinator.resume_retries() {
        warn!(error = %e, "could not clear retry backoff");
    }
}
