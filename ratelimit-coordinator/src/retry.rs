//! The job-retry adapter: lets a background worker shed rate-limited
//! work back onto its own queue instead of blocking a thread through
//! `shift`. See `SPEC_FULL.md` §4.5.

use std::time::Duration;

use crate::errors::CoordinatorError;
use crate::wait::scoped_wait_strategy;
use crate::entities::WaitStrategy;

/// How many times a job may be re-enqueued after a rate-limit failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempts {
    Bounded(u32),
    Unbounded,
}

impl Attempts {
    fn exhausted(self, attempt: u32) -> bool {
        match self {
            Attempts::Bounded(max) => attempt >= max,
            Attempts::Unbounded => false,
        }
    }
}

/// The two primitives a host work queue must provide for [`JobRetry`] to
/// integrate with it: re-enqueuing the same job after a delay, and
/// reporting how many times it has already been attempted.
pub trait ReenqueueSink {
    /// Schedules another execution of the current job after `delay`.
    fn reenqueue_after(&self, delay: Duration);

    /// How many times the current job has been attempted so far,
    /// including the one in progress.
    fn attempt_count(&self) -> u32;
}

/// Wraps an operation so that a `rate_limited` failure from `shift`
/// is turned into a re-enqueue through `sink` rather than propagated to
/// the caller, up to `attempts` tries.
pub struct JobRetry<S: ReenqueueSink> {
    sink: S,
    attempts: Attempts,
    fallback_wait: Duration,
}

impl<S: ReenqueueSink> JobRetry<S> {
    pub fn new(sink: S, attempts: Attempts, fallback_wait: Duration) -> Self {
        Self {
            sink,
            attempts,
            fallback_wait,
        }
    }

    /// Runs `body` under the raise wait strategy (restored on exit
    /// whether `body` returns normally or propagates an error). On
    /// `CoordinatorError::RateLimited`, re-enqueues through `sink` and
    /// swallows the error so the current execution completes
    /// successfully; any other error, or exhausted attempts, is
    /// re-raised unchanged.
    pub fn run<T, E>(
        &self,
        body: impl FnOnce() -> Result<T, E>,
    ) -> Result<Option<T>, E>
    where
        E: From<CoordinatorError> + AsRateLimited,
    {
        let result = scoped_wait_strategy(WaitStrategy::Raise, body);

        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) => match err.as_rate_limited() {
                Some(retry_after) => {
                    let attempt = self.sink.attempt_count();
                    if self.attempts.exhausted(attempt) {
                        Err(err)
                    } else {
                        let delay = retry_after.unwrap_or(self.fallback_wait);
                        self.sink.reenqueue_after(delay);
                        Ok(None)
                    }
                }
                None => Err(err),
            },
        }
    }
}

/// Lets [`JobRetry::run`] recognize a rate-limit failure inside a
/// caller-defined error type without forcing that type to be
/// `CoordinatorError` itself. `None` means "not a rate-limit failure";
/// `Some(retry_after)` carries the hint, which is itself optional.
pub trait AsRateLimited {
    fn as_rate_limited(&self) -> Option<Option<Duration>>;
}

impl AsRateLimited for CoordinatorError {
    fn as_rate_limited(&self) -> Option<Option<Duration>> {
        match self {
            CoordinatorError::RateLimited { retry_after } => Some(Some(*retry_after)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use rstest::rstest;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        reenqueued_after: RefCell<Option<Duration>>,
        attempt: u32,
    }

    impl ReenqueueSink for RecordingSink {
        fn reenqueue_after(&self, delay: Duration) {
            *self.reenqueued_after.borrow_mut() = Some(delay);
        }

        fn attempt_count(&self) -> u32 {
            self.attempt
        }
    }

    #[rstest]
    fn successful_body_passes_through() {
        let retry = JobRetry::new(RecordingSink::default(), Attempts::Bounded(3), Duration::from_secs(1));
        let result: Result<Option<i32>, CoordinatorError> = retry.run(|| Ok(42));
        assert_eq!(result.unwrap(), Some(42));
    }

    #[rstest]
    fn rate_limited_failure_reenqueues_with_its_own_hint() {
        let sink = RecordingSink {
            attempt: 0,
            ..Default::default()
        };
        let retry = JobRetry::new(sink, Attempts::Bounded(3), Duration::from_secs(9));
        let result: Result<Option<i32>, CoordinatorError> = retry.run(|| {
            Err(CoordinatorError::RateLimited {
                retry_after: Duration::from_secs(5),
            })
        });
        assert_eq!(result.unwrap(), None);
        assert_eq!(*retry.sink.reenqueued_after.borrow(), Some(Duration::from_secs(5)));
    }

    #[rstest]
    fn rate_limited_failure_without_hint_uses_fallback() {
        let sink = RecordingSink {
            attempt: 0,
            ..Default::default()
        };
        let retry = JobRetry::new(sink, Attempts::Unbounded, Duration::from_secs(9));
        let result: Result<Option<i32>, CoordinatorError> = retry.run(|| {
            Err::<i32, _>(CoordinatorError::Configuration("unrelated".to_string()))
        });
        assert!(result.is_err());
    }

    #[rstest]
    fn exhausted_attempts_reraise_instead_of_reenqueueing() {
        let sink = RecordingSink {
            attempt: 3,
            ..Default::default()
        };
        let retry = JobRetry::new(sink, Attempts::Bounded(3), Duration::from_secs(1));
        let result: Result<Option<i32>, CoordinatorError> = retry.run(|| {
            Err(CoordinatorError::RateLimited {
                retry_after: Duration::from_secs(2),
            })
        });
        assert!(matches!(result, Err(CoordinatorError::RateLimited { .. })));
    }

    #[rstest]
    fn unbounded_attempts_never_exhaust() {
        assert!(!Attempts::Unbounded.exhausted(1_000_000));
    }
}
