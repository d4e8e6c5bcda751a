//! Background sweep that reclaims builds whose worker stopped heart-
//! beating, and marks workers offline once their own check-ins go
//! stale.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::Config;
use crate::domain::WorkerStatus;
use crate::store::{Store, WorkerPatch};

/// Runs the periodic sweep until `shutdown` fires. Each tick failure is
/// logged and the loop continues rather than exiting the process over a
/// transient database hiccup.
pub async fn run(store: Store, config: Arc<Config>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(config.monitor_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = sweep_once(&store, &config).await {
                    tracing::error!(error = ?err, "heartbeat sweep failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("heartbeat monitor shutting down");
                    return;
                }
            }
        }
    }
}

async fn sweep_once(store: &Store, config: &Config) -> Result<(), sqlx::Error> {
    reclaim_stuck_builds(store, config.build_timeout()).await?;
    let offlined = store
        .mark_offline_if_stale(config.worker_offline_timeout())
        .await?;
    if offlined > 0 {
        tracing::info!(count = offlined, "marked workers offline after stale check-in");
    }
    Ok(())
}

/// Fails builds whose heartbeat aged out, then brings their worker back
/// to `idle` and bumps its failure counter, so a crashed worker process
/// doesn't leave its build owner permanently `building`.
async fn reclaim_stuck_builds(store: &Store, timeout: Duration) -> Result<(), sqlx::Error> {
    let stuck = store.mark_stuck_builds_as_failed(timeout).await?;
    for build in &stuck {
        let Some(worker_id) = &build.worker_id else {
            continue;
        };
        let now = chrono::Utc::now();
        let patch = WorkerPatch::default()
            .status(WorkerStatus::Idle)
            .touch(now)
            .failed();
        if let Err(err) = store.update_worker(store.pool(), worker_id, patch).await {
            tracing::warn!(worker_id, build_id = %build.id, error = ?err, "failed to release worker after heartbeat timeout");
        }
    }
    if !stuck.is_empty() {
        tracing::warn!(count = stuck.len(), "failed builds after heartbeat timeout");
    }
    Ok(())
}
