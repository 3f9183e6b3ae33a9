//! The adaptive (AIMD) controller: discovers a safe rate for a limit
//! whose true ceiling is unknown, through additive-increase probing and
//! multiplicative-decrease on failure, with a confidence-weighted ceiling
//! that hardens against repeated overshoot. See `SPEC_FULL.md` §4.4.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::clock::now_seconds;
use crate::entities::{AdaptiveLimitConfig, Limit, LimitKind};
use crate::errors::{CoordinatorError, Result};
use crate::registry::GlobalOptions;
use crate::scripts::{self, AIMD_FAILURE_SCRIPT, AIMD_SUCCESS_SCRIPT};

/// Reads of `current_rate` are served from this in-process cache; writes
/// (a success or failure script returning a new rate) replace the cached
/// value immediately, so the cache is never more than this bound stale.
const RATE_CACHE_FRESHNESS: Duration = Duration::from_secs(1);

pub struct AdaptiveController {
    global: GlobalOptions,
    cache: Mutex<HashMap<String, (Instant, u32)>>,
}

impl AdaptiveController {
    pub fn new(global: GlobalOptions) -> Self {
        Self {
            global,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The rate currently in effect for `limit`, used as the admission
    /// engine's effective rate argument. Served from the freshness-bounded
    /// cache when possible; otherwise read from Redis (never written
    /// here — an unset `current_rate` key means the controller has not
    /// run a successful probe yet, so the limit's `initial_rate` applies).
    pub fn current_rate(&self, limit: &Limit) -> Result<u32> {
        let config = adaptive_config(limit)?;

        if let Some(cached) = self.fresh_cached(&limit.name) {
            return Ok(cached);
        }

        let key = scripts::current_rate_key(&self.global.key_prefix, &limit.name);
        let mut conn = self.global.redis_client.get_connection()?;
        let raw: Option<u32> = redis::cmd("GET").arg(&key).query(&mut conn)?;
        let rate = raw.unwrap_or(config.initial_rate);
        self.cache_rate(&limit.name, rate);
        Ok(rate)
    }

    /// Runs the success script (§4.4): may raise the rate by
    /// `increase_by`, subject to cooldown, probe window, utilization and
    /// ceiling-confidence gating. Returns the resulting rate (unchanged if
    /// no increase was applied).
    pub fn record_success(&self, limit: &Limit) -> Result<u32> {
        let config = adaptive_config(limit)?;
        let prefix = &self.global.key_prefix;
        let keys = [
            scripts::window_key(prefix, limit),
            scripts::current_rate_key(prefix, &limit.name),
            scripts::last_decrease_key(prefix, &limit.name),
            scripts::last_probe_key(prefix, &limit.name),
            scripts::error_ceiling_key(prefix, &limit.name),
            scripts::ceiling_hits_key(prefix, &limit.name),
            scripts::ceiling_confidence_key(prefix, &limit.name),
        ];
        let args = [
            now_seconds().to_string(),
            config.initial_rate.to_string(),
            config.increase_by.to_string(),
            config
                .max_rate
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-1".to_string()),
            config.probe_window.as_secs_f64().to_string(),
            config.cooldown_after_decrease.as_secs_f64().to_string(),
            config.utilization_threshold.to_string(),
            config.ceiling_threshold.to_string(),
            config.interval.as_secs_f64().to_string(),
        ];

        let mut conn = self.global.redis_client.get_connection()?;
        let new_rate: i64 =
            scripts::invoke_with_reload(&mut conn, &AIMD_SUCCESS_SCRIPT, &keys, &args)?;

        if new_rate > 0 {
            tracing::info!(limit = %limit.name, new_rate, "aimd rate increased");
            self.cache_rate(&limit.name, new_rate as u32);
            Ok(new_rate as u32)
        } else {
            self.current_rate(limit)
        }
    }

    /// Runs the failure script (§4.4): always decreases the rate toward
    /// `min_rate`, tracks the error ceiling and its hit counter.
    pub fn record_failure(&self, limit: &Limit) -> Result<u32> {
        let config = adaptive_config(limit)?;
        let prefix = &self.global.key_prefix;
        let keys = [
            scripts::current_rate_key(prefix, &limit.name),
            scripts::last_decrease_key(prefix, &limit.name),
            scripts::error_ceiling_key(prefix, &limit.name),
            scripts::ceiling_hits_key(prefix, &limit.name),
        ];
        let args = [
            now_seconds().to_string(),
            config.initial_rate.to_string(),
            config.decrease_factor.to_string(),
            config.min_rate.to_string(),
        ];

        let mut conn = self.global.redis_client.get_connection()?;
        let new_rate: i64 =
            scripts::invoke_with_reload(&mut conn, &AIMD_FAILURE_SCRIPT, &keys, &args)?;
        let new_rate = new_rate.max(config.min_rate as i64) as u32;

        tracing::info!(limit = %limit.name, new_rate, "aimd rate decreased");
        self.cache_rate(&limit.name, new_rate);
        Ok(new_rate)
    }

    /// Asserts that `confirmed` rate-limit events were observed for
    /// `limit` recently, per an external classifier. Clamped to `>= 0`.
    pub fn set_confidence(&self, limit: &Limit, confirmed: i64) -> Result<()> {
        let confirmed = confirmed.max(0);
        let key = scripts::ceiling_confidence_key(&self.global.key_prefix, &limit.name);
        let mut conn = self.global.redis_client.get_connection()?;
        redis::cmd("SET").arg(&key).arg(confirmed).query(&mut conn)?;
        Ok(())
    }

    /// Clears the AIMD state for `limit`, reverting the next read of
    /// `current_rate` to `initial_rate`.
    pub fn reset(&self, limit: &Limit) -> Result<()> {
        let prefix = &self.global.key_prefix;
        let keys = [
            scripts::current_rate_key(prefix, &limit.name),
            scripts::last_decrease_key(prefix, &limit.name),
            scripts::last_probe_key(prefix, &limit.name),
            scripts::error_ceiling_key(prefix, &limit.name),
            scripts::ceiling_hits_key(prefix, &limit.name),
            scripts::ceiling_confidence_key(prefix, &limit.name),
        ];
        let mut conn = self.global.redis_client.get_connection()?;
        redis::cmd("DEL").arg(&keys).query(&mut conn)?;
        self.cache.lock().expect("aimd cache poisoned").remove(&limit.name);
        Ok(())
    }

    fn fresh_cached(&self, name: &str) -> Option<u32> {
        let cache = self.cache.lock().expect("aimd cache poisoned");
        cache.get(name).and_then(|(fetched_at, rate)| {
            if fetched_at.elapsed() < RATE_CACHE_FRESHNESS {
                Some(*rate)
            } else {
                None
            }
        })
    }

    fn cache_rate(&self, name: &str, rate: u32) {
        let mut cache = self.cache.lock().expect("aimd cache poisoned");
        cache.insert(name.to_string(), (Instant::now(), rate));
    }
}

fn adaptive_config(limit: &Limit) -> Result<&AdaptiveLimitConfig> {
    match &limit.kind {
        LimitKind::Adaptive(config) => Ok(config),
        LimitKind::Fixed(_) => Err(CoordinatorError::Configuration(format!(
            "{} is not an adaptive limit",
            limit.name
        ))),
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::entities::FixedLimitConfig;

    fn adaptive_limit() -> Limit {
        Limit {
            name: "github_api".to_string(),
            kind: LimitKind::Adaptive(AdaptiveLimitConfig::default()),
        }
    }

    #[rstest]
    fn adaptive_config_rejects_fixed_limits() {
        let limit = Limit {
            name: "x".to_string(),
            kind: LimitKind::Fixed(FixedLimitConfig::default()),
        };
        assert!(adaptive_config(&limit).is_err());
    }

    #[rstest]
    fn adaptive_config_accepts_adaptive_limits() {
        assert!(adaptive_config(&adaptive_limit()).is_ok());
    }

    #[rstest]
    fn cache_hit_within_freshness_window() {
        let global = GlobalOptions::new(redis::Client::open("redis://127.0.0.1:1").unwrap());
        let controller = AdaptiveController::new(global);
        controller.cache_rate("github_api", 7);
        assert_eq!(controller.fresh_cached("github_api"), Some(7));
    }

    #[rstest]
    fn cache_miss_once_stale() {
        let global = GlobalOptions::new(redis::Client::open("redis://127.0.0.1:1").unwrap());
        let controller = AdaptiveController::new(global);
        controller
            .cache
            .lock()
            .unwrap()
            .insert("github_api".to_string(), (Instant::now() - Duration::from_secs(2), 7));
        assert_eq!(controller.fresh_cached("github_api"), None);
    }
}
