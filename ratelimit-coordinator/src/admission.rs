//! The sliding-window admission engine: one atomic Redis round-trip per
//! call that decides allow, wait, or reject, distinguishing override-
//! driven rejection from window-driven rejection. See `SPEC_FULL.md`
//! §4.1.

use std::time::Duration;

use uuid::Uuid;

use crate::clock::now_seconds;
use crate::entities::{AdmissionDecision, Limit};
use crate::errors::{CoordinatorError, Result};
use crate::registry::GlobalOptions;
use crate::scripts::{self, ADMISSION_SCRIPT};

/// Runs the admission script against a single limit.
pub struct AdmissionEngine {
    global: GlobalOptions,
}

impl AdmissionEngine {
    pub fn new(global: GlobalOptions) -> Self {
        Self { global }
    }

    /// Decides whether a call against `limit` is admitted right now, at
    /// the given effective `rate` (the configured rate for a fixed limit,
    /// or the AIMD controller's cached current rate for an adaptive one).
    ///
    /// On a Redis transport error this fails open (admits without
    /// recording a slot) unless [`GlobalOptions::fail_open`] is `false`,
    /// in which case the error is surfaced to the caller instead.
    pub fn attempt(&self, limit: &Limit, rate: u32) -> Result<AdmissionDecision> {
        match self.try_attempt(limit, rate) {
            Ok(decision) => Ok(decision),
            Err(CoordinatorError::Infrastructure(err)) => {
                if self.global.fail_open {
                    tracing::warn!(
                        limit = %limit.name,
                        error = %err,
                        "redis unreachable, failing open"
                    );
                    Ok(AdmissionDecision {
                        allowed: true,
                        wait: Duration::ZERO,
                        is_override: false,
                    })
                } else {
                    Err(CoordinatorError::Infrastructure(err))
                }
            }
            Err(other) => Err(other),
        }
    }

    fn try_attempt(&self, limit: &Limit, rate: u32) -> Result<AdmissionDecision> {
        let mut conn = self.global.redis_client.get_connection()?;
        let now = now_seconds();
        let token = generate_token(now);

        let window_key = scripts::window_key(&self.global.key_prefix, limit);
        let override_key = scripts::override_key(&self.global.key_prefix, &limit.name);
        let interval = limit.kind.interval().as_secs_f64();

        let reply: Vec<String> = scripts::invoke_with_reload(
            &mut conn,
            &ADMISSION_SCRIPT,
            &[window_key, override_key],
            &[now.to_string(), interval.to_string(), rate.to_string(), token],
        )?;

        parse_decision(&reply)
    }
}

fn parse_decision(reply: &[String]) -> Result<AdmissionDecision> {
    let [allowed, wait, is_override] = reply else {
        return Err(CoordinatorError::ScriptContractViolation(format!(
            "expected a 3-element admission reply, got {reply:?}"
        )));
    };

    let allowed = parse_bool_flag(allowed)?;
    let is_override = parse_bool_flag(is_override)?;
    let wait_secs: f64 = wait
        .parse()
        .map_err(|_| CoordinatorError::ScriptContractViolation(format!("bad wait value {wait}")))?;

    Ok(AdmissionDecision {
        allowed,
        wait: Duration::from_secs_f64(wait_secs.max(0.0)),
        is_override,
    })
}

fn parse_bool_flag(raw: &str) -> Result<bool> {
    match raw {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(CoordinatorError::ScriptContractViolation(format!(
            "expected a 0/1 flag, got {other}"
        ))),
    }
}

/// Globally-unique call token: a real-time prefix (for human-readable
/// ordering in `redis-cli ZRANGE`) plus fresh randomness, so concurrent
/// callers across the fleet never collide as sorted-set members.
fn generate_token(now: f64) -> String {
    format!("{now:.6}-{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn parses_an_allow_reply() {
        let decision = parse_decision(&["1".to_string(), "0".to_string(), "0".to_string()]).unwrap();
        assert!(decision.allowed);
        assert!(!decision.is_override);
        assert_eq!(decision.wait, Duration::ZERO);
    }

    #[rstest]
    fn parses_a_reject_with_wait_reply() {
        let decision =
            parse_decision(&["0".to_string(), "1.5".to_string(), "0".to_string()]).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.wait, Duration::from_secs_f64(1.5));
    }

    #[rstest]
    fn parses_an_override_exhausted_reply() {
        let decision =
            parse_decision(&["0".to_string(), "3.0".to_string(), "1".to_string()]).unwrap();
        assert!(!decision.allowed);
        assert!(decision.is_override);
    }

    #[rstest]
    fn rejects_a_malformed_reply() {
        let result = parse_decision(&["1".to_string()]);
        assert!(matches!(
            result,
            Err(CoordinatorError::ScriptContractViolation(_))
        ));
    }

    #[rstest]
    fn tokens_generated_for_the_same_instant_are_still_unique() {
        let a = generate_token(1000.0);
        let b = generate_token(1000.0);
        assert_ne!(a, b);
        assert!(a.starts_with("1000.000000-"));
    }
}
