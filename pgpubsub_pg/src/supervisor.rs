//! Worker supervision.
//!
//! The supervisor owns the worker set: it starts `N` workers over the same
//! channel selection, replaces crashed workers according to the restart
//! policy, and broadcasts shutdown. Individual worker failures never
//! propagate into the process exit code.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use rand::Rng;
use sqlx::PgPool;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelDescriptor;
use crate::config::ListenerConfig;
use crate::dispatcher::Dispatcher;
use crate::worker::{Worker, WorkerError};

/// Whether a crashed worker is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Spawn a replacement worker with the same channel set (default).
    #[default]
    OnFailure,
    /// Record the failure and let the pool drain.
    Never,
}

/// Supervises a pool of workers.
pub struct Supervisor {
    pool: PgPool,
    dispatcher: Arc<Dispatcher>,
    config: Arc<ListenerConfig>,
    channels: Vec<Arc<ChannelDescriptor>>,
}

impl Supervisor {
    /// Creates a supervisor over the given channel selection.
    pub fn new(
        pool: PgPool,
        dispatcher: Arc<Dispatcher>,
        config: Arc<ListenerConfig>,
        channels: Vec<Arc<ChannelDescriptor>>,
    ) -> Self {
        Self {
            pool,
            dispatcher,
            config,
            channels,
        }
    }

    /// Runs `worker_count` workers until shutdown.
    ///
    /// With [`RestartPolicy::OnFailure`] a crashed worker is replaced after
    /// a jittered, exponentially growing delay; the delay resets once a
    /// worker survives past the maximum. With [`RestartPolicy::Never`] the
    /// supervisor returns when the pool empties.
    pub async fn run(&self, worker_count: usize, shutdown: CancellationToken) {
        let worker_count = worker_count.max(1);
        let mut set: JoinSet<(usize, Duration, Result<(), WorkerError>)> = JoinSet::new();
        let mut next_id = 0usize;
        let mut consecutive_failures = 0u32;
        let mut unrecovered_failures = 0u64;

        for _ in 0..worker_count {
            self.spawn_worker(&mut set, &mut next_id, &shutdown);
        }
        info!("supervisor started {worker_count} workers");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, waiting for workers to drain");
                    while let Some(joined) = set.join_next().await {
                        if let Ok((id, _, Err(e))) = joined {
                            warn!("worker {id} exited with error during shutdown: {e}");
                        }
                    }
                    break;
                }
                joined = set.join_next() => {
                    let Some(joined) = joined else {
                        // Pool drained without a shutdown signal.
                        break;
                    };
                    match joined {
                        Ok((id, _, Ok(()))) => {
                            info!("worker {id} exited cleanly");
                        }
                        Ok((id, ran_for, Err(e))) => {
                            error!("worker {id} died: {e}");
                            if ran_for >= self.config.restart_max_delay {
                                consecutive_failures = 0;
                            }
                            self.handle_failure(
                                &mut set,
                                &mut next_id,
                                &mut consecutive_failures,
                                &mut unrecovered_failures,
                                &shutdown,
                            )
                            .await;
                        }
                        Err(join_error) => {
                            error!("worker task panicked: {join_error}");
                            self.handle_failure(
                                &mut set,
                                &mut next_id,
                                &mut consecutive_failures,
                                &mut unrecovered_failures,
                                &shutdown,
                            )
                            .await;
                        }
                    }
                }
            }
        }

        if unrecovered_failures > 0 {
            warn!("supervisor exiting with {unrecovered_failures} unrecovered worker failures");
        } else {
            info!("supervisor exited");
        }
    }

    async fn handle_failure(
        &self,
        set: &mut JoinSet<(usize, Duration, Result<(), WorkerError>)>,
        next_id: &mut usize,
        consecutive_failures: &mut u32,
        unrecovered_failures: &mut u64,
        shutdown: &CancellationToken,
    ) {
        if self.config.restart_policy == RestartPolicy::Never || shutdown.is_cancelled() {
            *unrecovered_failures += 1;
            return;
        }
        let delay = restart_pause(&self.config, *consecutive_failures);
        *consecutive_failures += 1;
        warn!("restarting worker in {delay:?}");
        sleep(delay).await;
        self.spawn_worker(set, next_id, shutdown);
    }

    fn spawn_worker(
        &self,
        set: &mut JoinSet<(usize, Duration, Result<(), WorkerError>)>,
        next_id: &mut usize,
        shutdown: &CancellationToken,
    ) {
        let id = *next_id;
        *next_id += 1;
        let worker = Worker::new(
            id,
            self.pool.clone(),
            self.dispatcher.clone(),
            self.config.clone(),
            self.channels.clone(),
        );
        let token = shutdown.clone();
        set.spawn(async move {
            let started = Instant::now();
            let result = worker.run(token).await;
            (id, started.elapsed(), result)
        });
    }
}

/// Pause before spawning the replacement for a worker that has failed
/// `failures` consecutive times.
///
/// The pause is the backoff ceiling minus a random slice of up to 20%, so
/// sibling supervisors that all lost their workers to the same outage (a
/// database failover, say) drift apart instead of reconnecting on the same
/// tick. It never exceeds `restart_max_delay`.
pub(crate) fn restart_pause(config: &ListenerConfig, failures: u32) -> Duration {
    backoff_ceiling(config, failures).mul_f64(1.0 - rand::thread_rng().gen_range(0.0..0.2))
}

// Initial delay doubled per consecutive failure, capped at the maximum.
fn backoff_ceiling(config: &ListenerConfig, failures: u32) -> Duration {
    config
        .restart_initial_delay
        .saturating_mul(1u32 << failures.min(31))
        .min(config.restart_max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ceiling_doubles_per_failure_up_to_the_cap() {
        let config = ListenerConfig {
            restart_initial_delay: Duration::from_millis(500),
            restart_max_delay: Duration::from_secs(8),
            ..Default::default()
        };

        assert_eq!(backoff_ceiling(&config, 0), Duration::from_millis(500));
        assert_eq!(backoff_ceiling(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff_ceiling(&config, 4), Duration::from_secs(8));
        assert_eq!(backoff_ceiling(&config, 64), Duration::from_secs(8));
    }

    #[test]
    fn restart_pause_stays_within_the_spread_band() {
        let config = ListenerConfig {
            restart_initial_delay: Duration::from_secs(4),
            restart_max_delay: Duration::from_secs(60),
            ..Default::default()
        };

        for failures in [0, 1, 3] {
            let ceiling = backoff_ceiling(&config, failures);
            let floor = ceiling.mul_f64(0.8);
            for _ in 0..64 {
                let pause = restart_pause(&config, failures);
                assert!(
                    pause >= floor && pause <= ceiling,
                    "pause {pause:?} outside [{floor:?}, {ceiling:?}] after {failures} failures"
                );
            }
        }
    }

    #[test]
    fn default_policy_restarts_on_failure() {
        assert_eq!(RestartPolicy::default(), RestartPolicy::OnFailure);
    }
}
