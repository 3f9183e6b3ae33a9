//! The process-singleton map of registered limits, plus the global
//! options shared by every limit (Redis connection settings, default
//! wait-strategy, fail-open switch, key prefix).
//!
//! Registration is a well-defined configuration phase. Re-registering an
//! already-registered name overwrites its stored configuration rather than
//! erroring: callers that derive limit names dynamically (one per caller
//! identity, say) can re-register idempotently on every call without
//! tracking what has already been set up. [`Registry::clear_all`] drops
//! every registered limit outright and is intended for test setup.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use redis::Client;

use crate::entities::{AdaptiveLimitConfig, FixedLimitConfig, Limit, LimitKind, WaitStrategy};
use crate::errors::{CoordinatorError, Result};
use crate::scripts::DEFAULT_KEY_PREFIX;

/// Options shared by every limit in a process.
#[derive(Clone)]
pub struct GlobalOptions {
    pub redis_client: Client,
    /// Default cadence at which `shift` re-polls while waiting.
    pub check_interval: Duration,
    /// Default ceiling on how long `shift` will wait before failing.
    pub max_wait: Duration,
    /// Proportional jitter fraction applied to each suggested wait.
    /// `0.0` disables jitter.
    pub jitter: f64,
    /// Default wait strategy when no thread-local override is active.
    pub default_wait_strategy: WaitStrategy,
    /// Whether a Redis transport failure during admission is fail-opened
    /// (admit without recording a slot) or surfaced as an error.
    pub fail_open: bool,
    /// Common prefix for every Redis key this coordinator touches.
    pub key_prefix: String,
}

impl GlobalOptions {
    pub fn new(redis_client: Client) -> Self {
        Self {
            redis_client,
            check_interval: Duration::from_millis(250),
            max_wait: Duration::from_secs(30),
            jitter: 0.1,
            default_wait_strategy: WaitStrategy::Poll,
            fail_open: true,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

/// Lowercases and underscore-joins a limit name so that `"Stripe API"`,
/// `"stripe_api"` and `"stripe-api"` all address the same limit.
pub fn normalize_name(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_sep = false;
    for ch in input.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep && !out.is_empty() {
            out.push('_');
            last_was_sep = true;
        }
    }
    if out.ends_with('_') {
        out.pop();
    }
    out
}

fn validate_fixed(config: &FixedLimitConfig) -> Result<()> {
    if config.rate < 1 {
        return Err(CoordinatorError::Configuration(
            "rate must be >= 1".to_string(),
        ));
    }
    if config.interval <= Duration::ZERO {
        return Err(CoordinatorError::Configuration(
            "interval must be > 0".to_string(),
        ));
    }
    if let Some(ci) = config.check_interval {
        if ci < Duration::ZERO {
            return Err(CoordinatorError::Configuration(
                "check_interval must be >= 0".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_adaptive(config: &AdaptiveLimitConfig) -> Result<()> {
    if config.interval <= Duration::ZERO {
        return Err(CoordinatorError::Configuration(
            "interval must be > 0".to_string(),
        ));
    }
    if config.initial_rate < 1 || config.min_rate < 1 {
        return Err(CoordinatorError::Configuration(
            "initial_rate and min_rate must be >= 1".to_string(),
        ));
    }
    if config.min_rate > config.initial_rate {
        return Err(CoordinatorError::Configuration(
            "min_rate must be <= initial_rate".to_string(),
        ));
    }
    if let Some(max_rate) = config.max_rate {
        if max_rate < config.initial_rate {
            return Err(CoordinatorError::Configuration(
                "max_rate must be >= initial_rate".to_string(),
            ));
        }
    }
    if !(config.decrease_factor > 0.0 && config.decrease_factor < 1.0) {
        return Err(CoordinatorError::Configuration(
            "decrease_factor must be in (0, 1)".to_string(),
        ));
    }
    if config.probe_window <= Duration::ZERO {
        return Err(CoordinatorError::Configuration(
            "probe_window must be > 0".to_string(),
        ));
    }
    if config.cooldown_after_decrease <= Duration::ZERO {
        return Err(CoordinatorError::Configuration(
            "cooldown_after_decrease must be > 0".to_string(),
        ));
    }
    if config.increase_by < 1 {
        return Err(CoordinatorError::Configuration(
            "increase_by must be >= 1".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&config.utilization_threshold) {
        return Err(CoordinatorError::Configuration(
            "utilization_threshold must be in [0, 1]".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&config.ceiling_threshold) {
        return Err(CoordinatorError::Configuration(
            "ceiling_threshold must be in [0, 1]".to_string(),
        ));
    }
    if let Some(ci) = config.check_interval {
        if ci < Duration::ZERO {
            return Err(CoordinatorError::Configuration(
                "check_interval must be >= 0".to_string(),
            ));
        }
    }
    Ok(())
}

/// The named-limit store. A thin `RwLock<HashMap<...>>` guarded by
/// validation at insertion time; reads never block writers for long since
/// writes only happen during the configuration phase.
#[derive(Default)]
pub struct Registry {
    limits: RwLock<HashMap<String, Arc<Limit>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_fixed(&self, name: &str, config: FixedLimitConfig) -> Result<Arc<Limit>> {
        validate_fixed(&config)?;
        self.insert(name, LimitKind::Fixed(config))
    }

    pub fn register_adaptive(
        &self,
        name: &str,
        config: AdaptiveLimitConfig,
    ) -> Result<Arc<Limit>> {
        validate_adaptive(&config)?;
        self.insert(name, LimitKind::Adaptive(config))
    }

    fn insert(&self, name: &str, kind: LimitKind) -> Result<Arc<Limit>> {
        let normalized = normalize_name(name);
        if normalized.is_empty() {
            return Err(CoordinatorError::Configuration(
                "limit name must contain at least one alphanumeric character".to_string(),
            ));
        }
        let limit = Arc::new(Limit {
            name: normalized.clone(),
            kind,
        });
        let mut limits = self.limits.write().expect("registry lock poisoned");
        limits.insert(normalized, limit.clone());
        Ok(limit)
    }

    /// Fetches a previously registered limit, or an [`CoordinatorError::UnknownLimit`]
    /// error.
    pub fn fetch(&self, name: &str) -> Result<Arc<Limit>> {
        let normalized = normalize_name(name);
        let limits = self.limits.read().expect("registry lock poisoned");
        limits
            .get(&normalized)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnknownLimit(normalized))
    }

    pub fn enumerate(&self) -> Vec<Arc<Limit>> {
        let limits = self.limits.read().expect("registry lock poisoned");
        limits.values().cloned().collect()
    }

    /// Drops every registered limit. Does not touch any Redis state; use
    /// [`crate::coordinator::Coordinator::reset`] for that.
    pub fn clear_all(&self) {
        let mut limits = self.limits.write().expect("registry lock poisoned");
        limits.clear();
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::already_normalized("stripe_api", "stripe_api")]
    #[case::spaces("Stripe API", "stripe_api")]
    #[case::hyphens("stripe-api", "stripe_api")]
    #[case::mixed_separators("  Stripe--API  ", "stripe_api")]
    #[case::repeated_seps("stripe___api", "stripe_api")]
    fn should_normalize_names_to_the_same_form(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_name(input), expected);
    }

    #[rstest]
    fn should_reject_fixed_limit_with_zero_rate() {
        let result = validate_fixed(&FixedLimitConfig {
            rate: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(CoordinatorError::Configuration(_))));
    }

    #[rstest]
    fn should_reject_adaptive_limit_with_min_above_initial() {
        let result = validate_adaptive(&AdaptiveLimitConfig {
            initial_rate: 5,
            min_rate: 10,
            ..Default::default()
        });
        assert!(matches!(result, Err(CoordinatorError::Configuration(_))));
    }

    #[rstest]
    #[case::zero(0.0)]
    #[case::one(1.0)]
    #[case::negative(-0.1)]
    fn should_reject_adaptive_limit_with_decrease_factor_out_of_range(#[case] df: f64) {
        let result = validate_adaptive(&AdaptiveLimitConfig {
            decrease_factor: df,
            ..Default::default()
        });
        assert!(matches!(result, Err(CoordinatorError::Configuration(_))));
    }

    #[rstest]
    fn fetching_unknown_limit_is_a_caller_error() {
        let registry = Registry::new();
        let result = registry.fetch("never_registered");
        assert!(matches!(result, Err(CoordinatorError::UnknownLimit(_))));
    }

    #[rstest]
    fn two_names_normalizing_the_same_address_the_same_limit() {
        let registry = Registry::new();
        registry
            .register_fixed("Stripe API", FixedLimitConfig::default())
            .unwrap();
        assert!(registry.fetch("stripe_api").is_ok());
        assert!(registry.fetch("stripe-api").is_ok());
    }
}
