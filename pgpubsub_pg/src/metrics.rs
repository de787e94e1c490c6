//! The metrics surface.
//!
//! Publishes queue length and oldest-pending age for the channels this
//! process listens to, on a fixed interval, through the `metrics` facade.
//! When no recorder is installed the gauges are no-ops. Observations use a
//! plain read query and take no row locks, so they cannot starve the claim
//! protocol or the listener loop.

use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use metrics::gauge;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store;

/// Spawns the periodic metrics task for the given channel set.
///
/// Published gauges:
/// - `<prefix>.notifications-queue.len` — stored rows not yet processed;
/// - `<prefix>.notifications-queue.processing-lag` — `now - min(created_at)`
///   in milliseconds, zero when the queue is empty.
pub fn spawn_metrics_task(
    pool: PgPool,
    channels: Vec<String>,
    prefix: String,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let len_gauge = format!("{prefix}.notifications-queue.len");
        let lag_gauge = format!("{prefix}.notifications-queue.processing-lag");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match store::queue_stats(&pool, &channels).await {
                Ok((count, oldest)) => {
                    let lag_ms = oldest
                        .map(|created_at| {
                            (Utc::now() - created_at).num_milliseconds().max(0) as f64
                        })
                        .unwrap_or(0.0);
                    gauge!(len_gauge.clone()).set(count as f64);
                    gauge!(lag_gauge.clone()).set(lag_ms);
                    debug!("queue length {count}, processing lag {lag_ms}ms");
                }
                Err(e) => {
                    // Observation failures are transient; keep the loop alive.
                    warn!("metrics observation failed: {e}");
                }
            }
        }
        debug!("metrics task exited");
    })
}
