//! The override layer: a fixed-window counter with a TTL that, while
//! active, fully replaces the sliding window for a limit. See
//! `SPEC_FULL.md` §4.3.

use std::time::{Duration, SystemTime};

use crate::clock::now_seconds;
use crate::entities::{RawInt, ResetKind, ResetValue, ScalarOrList};
use crate::errors::Result;
use crate::metrics::MetricsSink;
use crate::registry::GlobalOptions;
use crate::scripts;

const MAX_RELATIVE_SECONDS: i64 = 86_400;

/// Registers a temporary override for `name`. Returns `false` (and writes
/// nothing) when `remaining` cannot be parsed as a non-negative integer,
/// or when the computed TTL is not strictly positive; otherwise writes
/// the override key and returns `true`.
pub fn register_override(
    global: &GlobalOptions,
    metrics: &dyn MetricsSink,
    name: &str,
    remaining: ScalarOrList<RawInt>,
    reset: ResetValue,
    reset_kind: ResetKind,
) -> Result<bool> {
    let Some(remaining) = resolve_remaining(&remaining) else {
        return Ok(false);
    };

    let Some(ttl_seconds) = resolve_ttl_seconds(&reset, reset_kind) else {
        return Ok(false);
    };

    if ttl_seconds <= 0 {
        return Ok(false);
    }

    let normalized = crate::registry::normalize_name(name);
    let key = scripts::override_key(&global.key_prefix, &normalized);
    let mut conn = global.redis_client.get_connection()?;
    redis::cmd("SET")
        .arg(&key)
        .arg(remaining)
        .arg("EX")
        .arg(ttl_seconds)
        .query(&mut conn)?;

    tracing::info!(limit = %normalized, remaining, ttl_seconds, "override registered");
    metrics.record_override(&normalized, remaining, Duration::from_secs(ttl_seconds as u64));
    Ok(true)
}

fn resolve_remaining(remaining: &ScalarOrList<RawInt>) -> Option<i64> {
    let value = remaining.resolve()?.parse()?;
    if value < 0 {
        None
    } else {
        Some(value)
    }
}

fn resolve_ttl_seconds(reset: &ResetValue, reset_kind: ResetKind) -> Option<i64> {
    match (reset_kind, reset) {
        (ResetKind::Seconds, ResetValue::Number(value)) => {
            let seconds = value.resolve()?.parse()?;
            if seconds > MAX_RELATIVE_SECONDS {
                None
            } else {
                Some(seconds)
            }
        }
        (ResetKind::Unix, ResetValue::Number(value)) => {
            let epoch = value.resolve()?.parse()?;
            Some(epoch - now_seconds() as i64)
        }
        (ResetKind::DateTime, ResetValue::Instant(instant)) => Some(seconds_until(*instant)),
        // A string/int reset value paired with `DateTime`, or an instant
        // paired with `Seconds`/`Unix`, is a mismatched input: reject
        // rather than silently reinterpret it.
        _ => None,
    }
}

fn seconds_until(instant: SystemTime) -> i64 {
    match instant.duration_since(SystemTime::now()) {
        Ok(remaining) => remaining.as_secs() as i64,
        Err(elapsed) => -(elapsed.duration().as_secs() as i64),
    }
}

/// Reads the TTL remaining on an already-registered override, if any,
/// without consuming a slot. Used by the wait orchestrator to tell an
/// exhausted override (§4.2 step 5) apart from a window-driven wait.
pub fn remaining_ttl(global: &GlobalOptions, name: &str) -> Result<Option<Duration>> {
    let normalized = crate::registry::normalize_name(name);
    let key = scripts::override_key(&global.key_prefix, &normalized);
    let mut conn = global.redis_client.get_connection()?;
    let ttl_ms: i64 = redis::cmd("PTTL").arg(&key).query(&mut conn)?;
    if ttl_ms > 0 {
        Ok(Some(Duration::from_millis(ttl_ms as u64)))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn scalar_remaining_resolves() {
        assert_eq!(
            resolve_remaining(&ScalarOrList::Scalar(RawInt::Int(5))),
            Some(5)
        );
    }

    #[rstest]
    fn single_element_list_unwraps_to_scalar() {
        assert_eq!(
            resolve_remaining(&ScalarOrList::List(vec![RawInt::Text("5".to_string())])),
            Some(5)
        );
    }

    #[rstest]
    fn multi_element_list_does_not_resolve() {
        assert_eq!(
            resolve_remaining(&ScalarOrList::List(vec![
                RawInt::Int(1),
                RawInt::Int(2)
            ])),
            None
        );
    }

    #[rstest]
    fn negative_remaining_does_not_resolve() {
        assert_eq!(resolve_remaining(&ScalarOrList::Scalar(RawInt::Int(-1))), None);
    }

    #[rstest]
    fn non_numeric_remaining_does_not_resolve() {
        assert_eq!(
            resolve_remaining(&ScalarOrList::Scalar(RawInt::Text("nope".to_string()))),
            None
        );
    }

    #[rstest]
    fn seconds_kind_rejects_values_over_one_day() {
        let reset = ResetValue::Number(ScalarOrList::Scalar(RawInt::Int(90_000)));
        assert_eq!(resolve_ttl_seconds(&reset, ResetKind::Seconds), None);
    }

    #[rstest]
    fn seconds_kind_accepts_values_within_one_day() {
        let reset = ResetValue::Number(ScalarOrList::Scalar(RawInt::Int(3600)));
        assert_eq!(resolve_ttl_seconds(&reset, ResetKind::Seconds), Some(3600));
    }

    #[rstest]
    fn unix_kind_computes_relative_ttl() {
        let now = now_seconds() as i64;
        let reset = ResetValue::Number(ScalarOrList::Scalar(RawInt::Int(now + 120)));
        let ttl = resolve_ttl_seconds(&reset, ResetKind::Unix).unwrap();
        assert!((115..=120).contains(&ttl));
    }

    #[rstest]
    fn datetime_kind_rejects_a_bare_integer() {
        let reset = ResetValue::Number(ScalarOrList::Scalar(RawInt::Int(120)));
        assert_eq!(resolve_ttl_seconds(&reset, ResetKind::DateTime), None);
    }

    #[rstest]
    fn datetime_kind_accepts_a_concrete_instant() {
        let instant = SystemTime::now() + Duration::from_secs(60);
        let reset = ResetValue::Instant(instant);
        let ttl = resolve_ttl_seconds(&reset, ResetKind::DateTime).unwrap();
        assert!((55..=60).contains(&ttl));
    }
}
