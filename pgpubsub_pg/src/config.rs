//! Listener runtime configuration.

use std::time::Duration;

use crate::supervisor::RestartPolicy;

/// Configuration for the listener runtime.
///
/// Defaults are suitable for development; deployments typically start from
/// [`ListenerConfig::from_env`] and override fields explicitly.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// How long a worker blocks waiting for notifications before emitting a
    /// heartbeat and re-polling.
    pub poll_deadline: Duration,

    /// Run a recovery scan over the durable channels before processing the
    /// live stream.
    pub recover: bool,

    /// Number of stored rows fetched per recovery batch.
    pub recovery_batch_size: u32,

    /// Whether a crashed worker is replaced.
    pub restart_policy: RestartPolicy,

    /// Delay before the first worker restart; doubles per consecutive
    /// failure up to [`ListenerConfig::restart_max_delay`].
    pub restart_initial_delay: Duration,

    /// Upper bound on the worker restart delay.
    pub restart_max_delay: Duration,

    /// Surface the payload's `context` object to callbacks.
    pub pass_context_to_listeners: bool,

    /// Surface the payload's `extras` object to callbacks.
    pub pass_extras_to_listeners: bool,

    /// Oldest `db_version` this process accepts on trigger payloads.
    /// Older stored rows are left for a future deployment.
    pub min_db_version: Option<String>,

    /// Name of the listener filter to select from the filter registry.
    pub listener_filter: Option<String>,

    /// Prefix for published metric names.
    pub metric_prefix: String,

    /// Interval between metric observations.
    pub metric_interval: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_deadline: Duration::from_secs(5),
            recover: false,
            recovery_batch_size: 500,
            restart_policy: RestartPolicy::OnFailure,
            restart_initial_delay: Duration::from_secs(1),
            restart_max_delay: Duration::from_secs(60),
            pass_context_to_listeners: false,
            pass_extras_to_listeners: false,
            min_db_version: None,
            listener_filter: None,
            metric_prefix: "pgpubsub".into(),
            metric_interval: Duration::from_secs(15),
        }
    }
}

impl ListenerConfig {
    /// Builds a configuration from the `PGPUBSUB_*` environment variables,
    /// leaving everything else at its default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.listener_filter = std::env::var("PGPUBSUB_LISTENER_FILTER").ok();
        config.pass_context_to_listeners = env_flag("PGPUBSUB_PASS_CONTEXT_TO_LISTENERS");
        config.pass_extras_to_listeners = env_flag("PGPUBSUB_PASS_EXTRAS_TO_LISTENERS");
        if let Ok(prefix) = std::env::var("PGPUBSUB_METRIC_PREFIX") {
            config.metric_prefix = prefix;
        }
        config
    }

    /// Compares a payload's `db_version` against the configured minimum.
    ///
    /// Versions compare numerically when both parse as integers,
    /// lexicographically otherwise. Payloads without a version always pass.
    pub fn accepts_db_version(&self, db_version: Option<&str>) -> bool {
        let (Some(min), Some(version)) = (self.min_db_version.as_deref(), db_version) else {
            return true;
        };
        match (version.parse::<i64>(), min.parse::<i64>()) {
            (Ok(version), Ok(min)) => version >= min,
            _ => version >= min,
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("true") | Ok("True") | Ok("1")
    )
}
