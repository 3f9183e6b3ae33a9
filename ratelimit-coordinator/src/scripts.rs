//! Redis key layout and the three server-side scripts that back the
//! coordinator: admission, AIMD success, AIMD failure.
//!
//! Every state-mutating operation on a limit's keys happens inside one of
//! these scripts so no other process can observe partial state between,
//! say, the override check and the sliding-window check of a single
//! admission attempt.

use once_cell::sync::Lazy;
use redis::Script;

use crate::entities::{Limit, LimitKind};
use crate::errors::{CoordinatorError, Result};

pub const DEFAULT_KEY_PREFIX: &str = "rate_limit";

/// Builds the sliding-window set key for a limit. Fixed limits fold their
/// rate into the key (two fixed limits of different rates sharing a name
/// would be a configuration error caught at registration, but the key
/// shape still disambiguates); adaptive limits omit the rate so the same
/// physical set survives a runtime rate change.
pub fn window_key(prefix: &str, limit: &Limit) -> String {
    match &limit.kind {
        LimitKind::Fixed(c) => format!(
            "{prefix}:{}:{}:{}",
            limit.name,
            c.rate,
            c.interval.as_secs_f64()
        ),
        LimitKind::Adaptive(c) => {
            format!("{prefix}:{}:{}", limit.name, c.interval.as_secs_f64())
        }
    }
}

pub fn override_key(prefix: &str, name: &str) -> String {
    format!("{prefix}:{name}:override")
}

fn adaptive_prefix(prefix: &str) -> String {
    format!("{prefix}:adaptive")
}

pub fn current_rate_key(prefix: &str, name: &str) -> String {
    format!("{}:{name}:current_rate", adaptive_prefix(prefix))
}

pub fn last_decrease_key(prefix: &str, name: &str) -> String {
    format!("{}:{name}:last_decrease", adaptive_prefix(prefix))
}

pub fn last_probe_key(prefix: &str, name: &str) -> String {
    format!("{}:{name}:last_probe", adaptive_prefix(prefix))
}

pub fn error_ceiling_key(prefix: &str, name: &str) -> String {
    format!("{}:{name}:error_ceiling", adaptive_prefix(prefix))
}

pub fn ceiling_hits_key(prefix: &str, name: &str) -> String {
    format!("{}:{name}:ceiling_hits", adaptive_prefix(prefix))
}

pub fn ceiling_confidence_key(prefix: &str, name: &str) -> String {
    format!("{}:{name}:ceiling_confidence", adaptive_prefix(prefix))
}

/// Phase 1 (override) then phase 2 (sliding window). See `SPEC_FULL.md`
/// §4.1. KEYS: [1]=window set, [2]=override counter. ARGV: [1]=now,
/// [2]=interval, [3]=rate, [4]=token. Returns `{allowed, wait, is_override}`
/// as a 3-element array of strings.
const ADMISSION_SCRIPT_SRC: &str = r#"
local window_key = KEYS[1]
local override_key = KEYS[2]

local now = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local token = ARGV[4]

local ttl_ms = redis.call("PTTL", override_key)
if ttl_ms and ttl_ms > 0 then
  local raw = redis.call("GET", override_key)
  local v = tonumber(raw)
  if v ~= nil then
    if v > 0 then
      redis.call("DECRBY", override_key, 1)
      return {"1", "0", "0"}
    else
      return {"0", tostring(ttl_ms / 1000.0), "1"}
    end
  end
end

redis.call("ZREMRANGEBYSCORE", window_key, "-inf", "(" .. tostring(now - interval))
local count = redis.call("ZCARD", window_key)

if count < rate then
  redis.call("ZADD", window_key, now, token)
  redis.call("EXPIRE", window_key, math.ceil(interval) + 1)
  return {"1", "0", "0"}
end

local oldest = redis.call("ZRANGE", window_key, 0, 0, "WITHSCORES")
if oldest[2] == nil then
  return {"0", tostring(interval), "0"}
end

local s_min = tonumber(oldest[2])
local wait = s_min + interval - now
if wait < 0 then
  wait = 0
end
return {"0", tostring(wait), "0"}
"#;

/// KEYS: [1]=window set, [2]=current_rate, [3]=last_decrease, [4]=last_probe,
/// [5]=error_ceiling, [6]=ceiling_hits, [7]=ceiling_confidence. ARGV:
/// [1]=now, [2]=initial_rate, [3]=increase_by, [4]=max_rate (-1 for
/// unbounded), [5]=probe_window, [6]=cooldown_after_decrease,
/// [7]=utilization_threshold, [8]=ceiling_threshold, [9]=interval. Returns
/// the new rate, or 0 if no increase was applied.
const AIMD_SUCCESS_SCRIPT_SRC: &str = r#"
local now = tonumber(ARGV[1])
local initial_rate = tonumber(ARGV[2])
local increase_by = tonumber(ARGV[3])
local max_rate = tonumber(ARGV[4])
local probe_window = tonumber(ARGV[5])
local cooldown = tonumber(ARGV[6])
local util_threshold = tonumber(ARGV[7])
local ceiling_threshold = tonumber(ARGV[8])
local interval = tonumber(ARGV[9])

local rate = tonumber(redis.call("GET", KEYS[2]))
if rate == nil then
  redis.call("SET", KEYS[2], initial_rate)
  redis.call("SET", KEYS[4], now)
  return 0
end

local last_decrease = tonumber(redis.call("GET", KEYS[3]))
if last_decrease ~= nil and (now - last_decrease) < cooldown then
  return 0
end

local last_probe = tonumber(redis.call("GET", KEYS[4]))
if last_probe ~= nil and (now - last_probe) < probe_window then
  return 0
end

redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", "(" .. tostring(now - interval))
local count = redis.call("ZCARD", KEYS[1])
local utilization = count / rate

if utilization < util_threshold then
  return 0
end

local error_ceiling = tonumber(redis.call("GET", KEYS[5]))
if error_ceiling ~= nil and (rate + increase_by) >= error_ceiling then
  local ceiling_hits = tonumber(redis.call("GET", KEYS[6])) or 0
  local ceiling_confidence = tonumber(redis.call("GET", KEYS[7])) or 0
  local dynamic_threshold = ceiling_threshold + 0.02 * ceiling_hits + 0.05 * ceiling_confidence
  if dynamic_threshold > 1.0 then
    dynamic_threshold = 1.0
  end
  if utilization < dynamic_threshold then
    return 0
  end
end

local new_rate = rate + increase_by
if max_rate >= 0 and new_rate > max_rate then
  new_rate = max_rate
end

redis.call("SET", KEYS[2], new_rate)
redis.call("SET", KEYS[4], now)
return new_rate
"#;

/// KEYS: [1]=current_rate, [2]=last_decrease, [3]=error_ceiling,
/// [4]=ceiling_hits. ARGV: [1]=now, [2]=initial_rate, [3]=decrease_factor,
/// [4]=min_rate. Returns the new rate.
const AIMD_FAILURE_SCRIPT_SRC: &str = r#"
local now = tonumber(ARGV[1])
local initial_rate = tonumber(ARGV[2])
local decrease_factor = tonumber(ARGV[3])
local min_rate = tonumber(ARGV[4])

local old = tonumber(redis.call("GET", KEYS[1]))
if old == nil then
  old = initial_rate
end

local error_ceiling = tonumber(redis.call("GET", KEYS[3]))
if error_ceiling ~= nil and math.abs(old - error_ceiling) <= 0.2 * error_ceiling then
  redis.call("INCR", KEYS[4])
else
  redis.call("SET", KEYS[4], 1)
end
redis.call("SET", KEYS[3], old)

local new_rate = math.ceil(old * decrease_factor)
if new_rate < min_rate then
  new_rate = min_rate
end

redis.call("SET", KEYS[1], new_rate)
redis.call("SET", KEYS[2], now)
return new_rate
"#;

/// A script bundled with its own source, so the engine can reload it by
/// `SCRIPT LOAD` if Redis ever reports the cached digest unknown (a
/// server restart or an operator-issued `SCRIPT FLUSH`).
pub struct LuaScript {
    script: Script,
    source: &'static str,
}

impl LuaScript {
    fn new(source: &'static str) -> Self {
        Self {
            script: Script::new(source),
            source,
        }
    }

    pub fn hash(&self) -> &str {
        self.script.get_hash()
    }
}

pub static ADMISSION_SCRIPT: Lazy<LuaScript> = Lazy::new(|| LuaScript::new(ADMISSION_SCRIPT_SRC));
pub static AIMD_SUCCESS_SCRIPT: Lazy<LuaScript> =
    Lazy::new(|| LuaScript::new(AIMD_SUCCESS_SCRIPT_SRC));
pub static AIMD_FAILURE_SCRIPT: Lazy<LuaScript> =
    Lazy::new(|| LuaScript::new(AIMD_FAILURE_SCRIPT_SRC));

/// Invokes `script` by digest (`EVALSHA`), reloading it once via
/// `SCRIPT LOAD` and retrying on `NOSCRIPT`. A second `NOSCRIPT` in the
/// same attempt is a [`CoordinatorError::ScriptContractViolation`]: the
/// library must not silently corrupt state by guessing.
pub fn invoke_with_reload<T: redis::FromRedisValue>(
    conn: &mut redis::Connection,
    script: &LuaScript,
    keys: &[String],
    args: &[String],
) -> Result<T> {
    match eval_sha(conn, script.hash(), keys, args) {
        Ok(value) => Ok(value),
        Err(err) if err.kind() == redis::ErrorKind::NoScriptError => {
            tracing::warn!(hash = script.hash(), "script unknown to redis, reloading");
            let mut load = redis::cmd("SCRIPT");
            load.arg("LOAD").arg(script.source);
            let _: String = load.query(conn)?;
            match eval_sha(conn, script.hash(), keys, args) {
                Ok(value) => Ok(value),
                Err(err) if err.kind() == redis::ErrorKind::NoScriptError => {
                    Err(CoordinatorError::ScriptContractViolation(
                        "script missing from redis immediately after reload".to_string(),
                    ))
                }
                Err(err) => Err(CoordinatorError::Infrastructure(err)),
            }
        }
        Err(err) => Err(CoordinatorError::Infrastructure(err)),
    }
}

fn eval_sha<T: redis::FromRedisValue>(
    conn: &mut redis::Connection,
    hash: &str,
    keys: &[String],
    args: &[String],
) -> redis::RedisResult<T> {
    let mut cmd = redis::cmd("EVALSHA");
    cmd.arg(hash).arg(keys.len());
    for key in keys {
        cmd.arg(key);
    }
    for arg in args {
        cmd.arg(arg);
    }
    cmd.query(conn)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::entities::{AdaptiveLimitConfig, FixedLimitConfig};

    #[rstest]
    fn fixed_window_key_includes_rate_and_interval() {
        let limit = Limit {
            name: "stripe_api".to_string(),
            kind: LimitKind::Fixed(FixedLimitConfig {
                rate: 10,
                interval: Duration::from_secs(60),
                ..Default::default()
            }),
        };
        assert_eq!(
            window_key(DEFAULT_KEY_PREFIX, &limit),
            "rate_limit:stripe_api:10:60"
        );
    }

    #[rstest]
    fn adaptive_window_key_omits_rate() {
        let limit = Limit {
            name: "github_api".to_string(),
            kind: LimitKind::Adaptive(AdaptiveLimitConfig {
                interval: Duration::from_secs(60),
                ..Default::default()
            }),
        };
        assert_eq!(
            window_key(DEFAULT_KEY_PREFIX, &limit),
            "rate_limit:github_api:60"
        );
    }

    #[rstest]
    fn adaptive_keys_are_distinct_and_prefixed() {
        let keys = [
            current_rate_key(DEFAULT_KEY_PREFIX, "x"),
            last_decrease_key(DEFAULT_KEY_PREFIX, "x"),
            last_probe_key(DEFAULT_KEY_PREFIX, "x"),
            error_ceiling_key(DEFAULT_KEY_PREFIX, "x"),
            ceiling_hits_key(DEFAULT_KEY_PREFIX, "x"),
            ceiling_confidence_key(DEFAULT_KEY_PREFIX, "x"),
        ];
        let unique: std::collections::HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
        for k in keys {
            assert!(k.starts_with("rate_limit:adaptive:x:"));
        }
    }
}
