//! The top-level façade: owns the registry, the admission/wait machinery
//! and the adaptive controller for one process, and exposes the public
//! operations listed in `SPEC_FULL.md` §6.

use std::sync::Arc;

use crate::aimd::AdaptiveController;
use crate::entities::{
    AdaptiveLimitConfig, FixedLimitConfig, Limit, RawInt, ResetKind, ResetValue, ScalarOrList,
    WaitStrategy,
};
use crate::errors::Result;
use crate::metrics::{MetricsSink, NoopSink};
use crate::overrides;
use crate::registry::{GlobalOptions, Registry};
use crate::wait::{self, WaitOrchestrator};

/// One coordinator per process (typically behind a process-wide
/// `static`/`OnceCell` owned by the host application). Cloning is cheap:
/// the registry and adaptive cache are reference-counted internally.
pub struct Coordinator {
    global: GlobalOptions,
    registry: Arc<Registry>,
    aimd: Arc<AdaptiveController>,
    metrics: Arc<dyn MetricsSink>,
}

impl Coordinator {
    /// Builds a coordinator from already-validated global options, with
    /// the no-op metrics sink. Use [`crate::builders::coordinator::CoordinatorBuilder`]
    /// for the ergonomic entrypoint.
    pub fn configure(global: GlobalOptions) -> Self {
        Self::configure_with_metrics(global, Arc::new(NoopSink))
    }

    pub fn configure_with_metrics(global: GlobalOptions, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            aimd: Arc::new(AdaptiveController::new(global.clone())),
            registry: Arc::new(Registry::new()),
            global,
            metrics,
        }
    }

    pub fn register_fixed(&self, name: &str, config: FixedLimitConfig) -> Result<Arc<Limit>> {
        let limit = self.registry.register_fixed(name, config)?;
        self.metrics.record_registry_meta(&limit.name, "fixed");
        Ok(limit)
    }

    pub fn register_adaptive(&self, name: &str, config: AdaptiveLimitConfig) -> Result<Arc<Limit>> {
        let limit = self.registry.register_adaptive(name, config)?;
        self.metrics.record_registry_meta(&limit.name, "adaptive");
        Ok(limit)
    }

    /// Blocks (or fails immediately, per the active wait strategy) until
    /// `name` admits a call.
    pub fn shift(&self, name: &str) -> Result<Arc<Limit>> {
        let limit = self.registry.fetch(name)?;
        let rate = self.effective_rate(&limit)?;
        let orchestrator = WaitOrchestrator::new(self.global.clone(), self.metrics.as_ref());
        orchestrator.shift(&limit, rate, |_wait| {})?;
        Ok(limit)
    }

    /// Reports that the call admitted by the matching `shift` succeeded,
    /// letting the adaptive controller consider an increase. A no-op for
    /// fixed limits.
    pub fn record_success(&self, name: &str) -> Result<()> {
        let limit = self.registry.fetch(name)?;
        if limit.kind.is_adaptive() {
            self.aimd.record_success(&limit)?;
        }
        Ok(())
    }

    /// Reports that the call admitted by the matching `shift` failed,
    /// letting the adaptive controller back off. A no-op for fixed
    /// limits.
    pub fn record_failure(&self, name: &str) -> Result<()> {
        let limit = self.registry.fetch(name)?;
        if limit.kind.is_adaptive() {
            self.aimd.record_failure(&limit)?;
        }
        Ok(())
    }

    pub fn set_confidence(&self, name: &str, confirmed_events: i64) -> Result<()> {
        let limit = self.registry.fetch(name)?;
        self.aimd.set_confidence(&limit, confirmed_events)
    }

    pub fn register_override(
        &self,
        name: &str,
        remaining: ScalarOrList<RawInt>,
        reset: ResetValue,
        reset_kind: ResetKind,
    ) -> Result<bool> {
        overrides::register_override(
            &self.global,
            self.metrics.as_ref(),
            name,
            remaining,
            reset,
            reset_kind,
        )
    }

    /// Clears the sliding window, any active override and (for adaptive
    /// limits) the AIMD state for `name`, reverting it to its registered
    /// initial configuration.
    pub fn reset(&self, name: &str) -> Result<()> {
        let limit = self.registry.fetch(name)?;
        let orchestrator = WaitOrchestrator::new(self.global.clone(), self.metrics.as_ref());
        orchestrator.reset(&limit)?;
        if limit.kind.is_adaptive() {
            self.aimd.reset(&limit)?;
        }
        Ok(())
    }

    pub fn scoped_wait_strategy<R>(&self, strategy: WaitStrategy, body: impl FnOnce() -> R) -> R {
        wait::scoped_wait_strategy(strategy, body)
    }

    pub fn current_wait_strategy(&self) -> Option<WaitStrategy> {
        wait::current_wait_strategy()
    }

    fn effective_rate(&self, limit: &Limit) -> Result<u32> {
        match &limit.kind {
            crate::entities::LimitKind::Fixed(c) => Ok(c.rate),
            crate::entities::LimitKind::Adaptive(_) => self.aimd.current_rate(limit),
        }
    }
}

impl Clone for Coordinator {
    fn clone(&self) -> Self {
        Self {
            global: self.global.clone(),
            registry: self.registry.clone(),
            aimd: self.aimd.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn test_global() -> GlobalOptions {
        GlobalOptions::new(redis::Client::open("redis://127.0.0.1:6379").unwrap())
    }

    #[rstest]
    fn registering_a_fixed_limit_makes_it_fetchable() {
        let coordinator = Coordinator::configure(test_global());
        coordinator
            .register_fixed("test_fixed_limit", FixedLimitConfig::default())
            .unwrap();
        assert!(coordinator.registry.fetch("test_fixed_limit").is_ok());
    }

    #[rstest]
    fn fetching_an_unregistered_limit_is_an_error() {
        let coordinator = Coordinator::configure(test_global());
        assert!(coordinator.shift("never_registered").is_err());
    }

    #[rstest]
    fn scoped_wait_strategy_is_visible_through_the_coordinator() {
        let coordinator = Coordinator::configure(test_global());
        assert_eq!(coordinator.current_wait_strategy(), None);
        coordinator.scoped_wait_strategy(WaitStrategy::Raise, || {
            assert_eq!(coordinator.current_wait_strategy(), Some(WaitStrategy::Raise));
        });
        assert_eq!(coordinator.current_wait_strategy(), None);
    }
}
