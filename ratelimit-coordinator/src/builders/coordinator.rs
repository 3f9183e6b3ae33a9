//! Builder pattern for a [`Coordinator`].

use std::sync::Arc;
use std::time::Duration;

use redis::Client as RedisClient;

use crate::coordinator::Coordinator;
use crate::entities::WaitStrategy;
use crate::errors::Result;
use crate::metrics::{MetricsSink, NoopSink};
use crate::registry::GlobalOptions;

use super::{RedisSettings, DEFAULT_REDIS_HOST, DEFAULT_REDIS_PORT};

/// Builder component for a coordinator instance. All values are optional;
/// defaults are applied if not explicitly specified by the caller.
#[derive(Default)]
pub struct CoordinatorBuilder {
    redis_settings: Option<RedisSettings>,
    check_interval: Option<Duration>,
    max_wait: Option<Duration>,
    jitter: Option<f64>,
    default_wait_strategy: Option<WaitStrategy>,
    fail_open: Option<bool>,
    key_prefix: Option<String>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl CoordinatorBuilder {
    /// Setter for the underlying Redis server settings.
    pub fn with_redis_settings(mut self, redis_settings: RedisSettings) -> Self {
        self.redis_settings = Some(redis_settings);
        self
    }

    /// Setter for the default poll cadence while `shift` is waiting.
    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = Some(check_interval);
        self
    }

    /// Setter for the default ceiling on how long `shift` waits before
    /// failing with `rate_limited`.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Setter for the proportional jitter fraction applied to each
    /// suggested wait. `0.0` disables jitter.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Setter for the default wait strategy, used when no thread-local
    /// override is active.
    pub fn with_default_wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.default_wait_strategy = Some(strategy);
        self
    }

    /// Setter for whether a Redis transport failure during admission is
    /// fail-opened (`true`, the default) or surfaced to the caller.
    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = Some(fail_open);
        self
    }

    /// Setter for the common prefix used by every Redis key this
    /// coordinator touches.
    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(key_prefix.into());
        self
    }

    /// Setter for the metrics sink. Defaults to [`NoopSink`].
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the coordinator, opening (but not yet connecting) the
    /// underlying Redis client.
    pub fn build(self) -> Result<Coordinator> {
        let redis_client = self
            .redis_settings
            .map(|rs| RedisClient::open(format!("redis://{0}:{1}", rs.host, rs.port)))
            .unwrap_or_else(|| {
                RedisClient::open(format!(
                    "redis://{0}:{1}",
                    DEFAULT_REDIS_HOST, DEFAULT_REDIS_PORT
                ))
            })?;

        let mut global = GlobalOptions::new(redis_client);
        if let Some(check_interval) = self.check_interval {
            global.check_interval = check_interval;
        }
        if let Some(max_wait) = self.max_wait {
            global.max_wait = max_wait;
        }
        if let Some(jitter) = self.jitter {
            global.jitter = jitter;
        }
        if let Some(strategy) = self.default_wait_strategy {
            global.default_wait_strategy = strategy;
        }
        if let Some(fail_open) = self.fail_open {
            global.fail_open = fail_open;
        }
        if let Some(key_prefix) = self.key_prefix {
            global.key_prefix = key_prefix;
        }

        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopSink));
        Ok(Coordinator::configure_with_metrics(global, metrics))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn should_build_coordinator_with_default_options() {
        let coordinator = CoordinatorBuilder::default().build();
        assert!(coordinator.is_ok());
    }

    #[test]
    fn should_build_coordinator_with_custom_redis_settings() {
        let coordinator = CoordinatorBuilder::default()
            .with_redis_settings(RedisSettings {
                host: "redis".to_string(),
                port: 1234,
            })
            .with_fail_open(false)
            .with_jitter(0.2)
            .build();
        assert!(coordinator.is_ok());
    }
}
