//! The wait orchestrator: turns the admission engine's instantaneous
//! decisions into `shift`, a blocking-or-raising primitive, plus the
//! thread-local wait-strategy override. See `SPEC_FULL.md` §4.2.

use std::cell::Cell;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::admission::AdmissionEngine;
use crate::entities::{Limit, WaitStrategy};
use crate::errors::{CoordinatorError, Result};
use crate::metrics::MetricsSink;
use crate::registry::GlobalOptions;

thread_local! {
    static WAIT_STRATEGY_OVERRIDE: Cell<Option<WaitStrategy>> = Cell::new(None);
}

/// Returns the thread-local wait-strategy override currently in effect,
/// if any.
pub fn current_wait_strategy() -> Option<WaitStrategy> {
    WAIT_STRATEGY_OVERRIDE.with(|cell| cell.get())
}

/// Applies `strategy` as the thread-local override for the duration of
/// `body`, restoring whatever was active before on exit, whether `body`
/// returns normally or unwinds.
pub fn scoped_wait_strategy<R>(strategy: WaitStrategy, body: impl FnOnce() -> R) -> R {
    let _guard = WaitStrategyGuard::enter(strategy);
    body()
}

struct WaitStrategyGuard {
    previous: Option<WaitStrategy>,
}

impl WaitStrategyGuard {
    fn enter(strategy: WaitStrategy) -> Self {
        let previous = WAIT_STRATEGY_OVERRIDE.with(|cell| cell.replace(Some(strategy)));
        Self { previous }
    }
}

impl Drop for WaitStrategyGuard {
    fn drop(&mut self) {
        WAIT_STRATEGY_OVERRIDE.with(|cell| cell.set(self.previous));
    }
}

fn resolve_strategy(global: &GlobalOptions) -> WaitStrategy {
    current_wait_strategy().unwrap_or(global.default_wait_strategy)
}

/// Applies proportional jitter: `w + U(0,1) * jitter * w`. `jitter <= 0`
/// is a no-op.
fn apply_jitter(wait: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return wait;
    }
    let factor = rand::thread_rng().gen_range(0.0..1.0) * jitter;
    wait + Duration::from_secs_f64(wait.as_secs_f64() * factor)
}

pub struct WaitOrchestrator<'a> {
    global: GlobalOptions,
    engine: AdmissionEngine,
    metrics: &'a dyn MetricsSink,
}

impl<'a> WaitOrchestrator<'a> {
    pub fn new(global: GlobalOptions, metrics: &'a dyn MetricsSink) -> Self {
        let engine = AdmissionEngine::new(global.clone());
        Self {
            global,
            engine,
            metrics,
        }
    }

    /// Blocks (or fails immediately, per the active strategy) until
    /// `limit` admits a call, calling `on_wait` with each raw pre-jitter
    /// suggested wait along the way.
    pub fn shift(&self, limit: &Limit, rate: u32, mut on_wait: impl FnMut(Duration)) -> Result<()> {
        let start = Instant::now();
        let max_wait = limit.kind.max_wait().unwrap_or(self.global.max_wait);
        let check_interval = limit.kind.check_interval().unwrap_or(self.global.check_interval);
        let strategy = resolve_strategy(&self.global);

        loop {
            let decision = self.engine.attempt(limit, rate)?;

            if decision.allowed {
                if limit.kind.metrics_enabled() {
                    self.metrics.record_allowed(&limit.name);
                }
                return Ok(());
            }

            on_wait(decision.wait);
            let jittered = apply_jitter(decision.wait, self.global.jitter);
            let elapsed = start.elapsed();

            if decision.is_override && decision.wait > max_wait {
                return self.fail_blocked(limit, jittered);
            }

            if elapsed > max_wait {
                return self.fail_blocked(limit, jittered);
            }

            if strategy == WaitStrategy::Raise {
                return self.fail_blocked(limit, jittered);
            }

            let sleep_for = jittered.min(check_interval);
            thread::sleep(sleep_for);
        }
    }

    fn fail_blocked(&self, limit: &Limit, retry_after: Duration) -> Result<()> {
        if limit.kind.metrics_enabled() {
            self.metrics.record_blocked(&limit.name);
        }
        Err(CoordinatorError::RateLimited { retry_after })
    }

    /// Clears every piece of state the coordinator keeps for `limit`:
    /// the sliding-window set, any active override, and (if adaptive)
    /// the AIMD keys.
    pub fn reset(&self, limit: &Limit) -> Result<()> {
        let mut conn = self.global.redis_client.get_connection()?;
        let window_key = crate::scripts::window_key(&self.global.key_prefix, limit);
        let override_key = crate::scripts::override_key(&self.global.key_prefix, &limit.name);
        redis::cmd("DEL")
            .arg(&window_key)
            .arg(&override_key)
            .query(&mut conn)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn no_override_defaults_to_global() {
        assert_eq!(current_wait_strategy(), None);
    }

    #[rstest]
    fn scoped_override_applies_and_restores() {
        assert_eq!(current_wait_strategy(), None);
        scoped_wait_strategy(WaitStrategy::Raise, || {
            assert_eq!(current_wait_strategy(), Some(WaitStrategy::Raise));
        });
        assert_eq!(current_wait_strategy(), None);
    }

    #[rstest]
    fn scoped_override_restores_even_on_panic() {
        let result = std::panic::catch_unwind(|| {
            scoped_wait_strategy(WaitStrategy::Raise, || {
                panic!("boom");
            });
        });
        assert!(result.is_err());
        assert_eq!(current_wait_strategy(), None);
    }

    #[rstest]
    fn nested_scopes_restore_the_outer_value() {
        scoped_wait_strategy(WaitStrategy::Poll, || {
            scoped_wait_strategy(WaitStrategy::Raise, || {
                assert_eq!(current_wait_strategy(), Some(WaitStrategy::Raise));
            });
            assert_eq!(current_wait_strategy(), Some(WaitStrategy::Poll));
        });
        assert_eq!(current_wait_strategy(), None);
    }

    #[rstest]
    fn zero_jitter_is_a_no_op() {
        let wait = Duration::from_secs(2);
        assert_eq!(apply_jitter(wait, 0.0), wait);
    }

    #[rstest]
    fn jitter_never_reduces_the_wait() {
        let wait = Duration::from_secs(2);
        let jittered = apply_jitter(wait, 0.5);
        assert!(jittered >= wait);
        assert!(jittered <= wait + wait.mul_f64(0.5));
    }
}
