/// cluster runtime configuration.
///
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// ceiling on the worker pool; units are tasks, not processes, so the
/// bound is a guard rail rather than a cpu count
pub const MAX_POOL_SIZE: usize = 256;

/// which server flavor a worker pool is fronting; carried into fault
/// reports so the notifier can attribute them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    #[default]
    Web,
    Api,
    Esb,
    Mobile,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// requested pool size; clamped to `MAX_POOL_SIZE` at start
    pub pool_size: usize,
    /// freshness poller interval, default 5 minutes
    pub poll_interval_ms: u64,
    /// forced-termination timer armed when a worker retires after a fault
    pub kill_timeout_ms: u64,
    /// how long shutdown() waits for the pool to drain
    pub shutdown_grace_ms: u64,
    pub server_kind: ServerKind,
    pub backoff: BackoffPolicy,
}

impl Default for ClusterConfig {
    fn default() -> ClusterConfig {
        ClusterConfig {
            pool_size: 1,
            poll_interval_ms: 300_000,
            kill_timeout_ms: 5_000,
            shutdown_grace_ms: 10_000,
            server_kind: ServerKind::Web,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ClusterConfig {
    pub fn with_pool_size(mut self, pool_size: usize) -> ClusterConfig {
        self.pool_size = pool_size;
        self
    }

    /// requested size bounded to something sane, never zero
    pub fn clamped_pool_size(&self) -> usize {
        self.pool_size.max(1).min(MAX_POOL_SIZE)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// respawn backoff: exponential with jitter, reset after a quiet period.
/// keeps a crash loop observable in the logs without letting it respawn
/// unboundedly fast.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
    pub reset_after_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> BackoffPolicy {
        BackoffPolicy {
            base_ms: 200,
            max_ms: 10_000,
            jitter_ms: 100,
            reset_after_ms: 30_000,
        }
    }
}

impl BackoffPolicy {
    /// delay before the nth consecutive respawn (0-based)
    pub fn delay(&self, consecutive: u32) -> Duration {
        let exp = consecutive.min(6);
        let raw = self
            .base_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_ms.max(self.base_ms));

        let jitter = if self.jitter_ms > 0 {
            fastrand::u64(0..=self.jitter_ms)
        } else {
            0
        };

        Duration::from_millis(raw.saturating_add(jitter))
    }

    pub fn reset_after(&self) -> Duration {
        Duration::from_millis(self.reset_after_ms)
    }
}
