//! Engine configuration read from environment variables
//!
//! Every value has a default; `.env` files are loaded by `main` via dotenvy.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::services::retry::RetryPolicy;

pub const ENV_MAINTAINER_TICK: &str = "MAINTAINER_TICK_SECS";
pub const ENV_STALE_THRESHOLD: &str = "STALE_OPERATION_THRESHOLD_SECS";
pub const ENV_MAX_RETRIES: &str = "OPERATION_MAX_RETRIES";
pub const ENV_RETRY_BASE_DELAY: &str = "RETRY_BASE_DELAY_MS";
pub const ENV_RETRY_MAX_DELAY: &str = "RETRY_MAX_DELAY_SECS";
pub const ENV_WORKER_POOL_SIZE: &str = "WORKER_POOL_SIZE";
pub const ENV_BROKER_TIMEOUT: &str = "BROKER_TIMEOUT_SECS";
pub const ENV_PRUNE_FINISHED_CASCADES: &str = "PRUNE_FINISHED_CASCADES";

const DEFAULT_MAINTAINER_TICK_SECS: u64 = 30;
const DEFAULT_STALE_THRESHOLD_SECS: u64 = 300;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_RETRY_MAX_DELAY_SECS: u64 = 60;
const DEFAULT_WORKER_POOL_SIZE: usize = 8;
const DEFAULT_BROKER_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Interval between maintainer ticks
    pub tick_interval: Duration,
    /// In-progress operations without a heartbeat for this long are recovered
    pub stale_threshold: Duration,
    pub retry: RetryPolicy,
    /// Maximum operations executed concurrently
    pub worker_pool_size: usize,
    pub broker_timeout: Duration,
    /// Mark new cascade trees for pruning once finished
    pub prune_finished_cascades: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(DEFAULT_MAINTAINER_TICK_SECS),
            stale_threshold: Duration::from_secs(DEFAULT_STALE_THRESHOLD_SECS),
            retry: RetryPolicy::new(
                DEFAULT_MAX_RETRIES,
                Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
                Duration::from_secs(DEFAULT_RETRY_MAX_DELAY_SECS),
            ),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            broker_timeout: Duration::from_secs(DEFAULT_BROKER_TIMEOUT_SECS),
            prune_finished_cascades: true,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            tick_interval: Duration::from_secs(env_or(ENV_MAINTAINER_TICK, DEFAULT_MAINTAINER_TICK_SECS)),
            stale_threshold: Duration::from_secs(env_or(ENV_STALE_THRESHOLD, DEFAULT_STALE_THRESHOLD_SECS)),
            retry: RetryPolicy::new(
                env_or(ENV_MAX_RETRIES, DEFAULT_MAX_RETRIES),
                Duration::from_millis(env_or(ENV_RETRY_BASE_DELAY, DEFAULT_RETRY_BASE_DELAY_MS)),
                Duration::from_secs(env_or(ENV_RETRY_MAX_DELAY, DEFAULT_RETRY_MAX_DELAY_SECS)),
            ),
            worker_pool_size: env_or(ENV_WORKER_POOL_SIZE, DEFAULT_WORKER_POOL_SIZE),
            broker_timeout: Duration::from_secs(env_or(ENV_BROKER_TIMEOUT, DEFAULT_BROKER_TIMEOUT_SECS)),
            prune_finished_cascades: env::var(ENV_PRUNE_FINISHED_CASCADES)
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
        }
    }

    /// Reject settings under which the maintainer would recover healthy work
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_pool_size == 0 {
            return Err(format!("{} must be greater than 0", ENV_WORKER_POOL_SIZE));
        }
        if self.tick_interval.is_zero() {
            return Err(format!("{} must be greater than 0", ENV_MAINTAINER_TICK));
        }
        if self.stale_threshold <= self.tick_interval {
            return Err(format!(
                "{} ({}s) must exceed the maintainer tick ({}s)",
                ENV_STALE_THRESHOLD,
                self.stale_threshold.as_secs(),
                self.tick_interval.as_secs()
            ));
        }
        if self.stale_threshold <= self.retry.max_delay {
            return Err(format!(
                "{} ({}s) must exceed the maximum retry delay ({}s)",
                ENV_STALE_THRESHOLD,
                self.stale_threshold.as_secs(),
                self.retry.max_delay.as_secs()
            ));
        }
        if self.stale_threshold <= self.broker_timeout {
            return Err(format!(
                "{} ({}s) must exceed the broker timeout ({}s)",
                ENV_STALE_THRESHOLD,
                self.stale_threshold.as_secs(),
                self.broker_timeout.as_secs()
            ));
        }
        Ok(())
    }
}
