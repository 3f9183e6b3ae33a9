//! Core value types shared across the coordinator: limit definitions, the
//! wait strategy, and the small vocabulary used by the override layer to
//! describe upstream quota hints.

use std::time::{Duration, SystemTime};

/// Per-context choice between polling (sleep) and immediate rejection with
/// a retry hint.
///
/// The active strategy is resolved as the first defined of: a thread-local
/// override (see [`crate::wait::scoped_wait_strategy`]), then the global
/// default carried on [`crate::registry::GlobalOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Sleep between admission attempts until allowed or `max_wait` elapses.
    Poll,
    /// Never sleep; fail immediately with a retry hint on the first
    /// rejection.
    Raise,
}

/// Configuration for a fixed sliding-window limit.
#[derive(Debug, Clone)]
pub struct FixedLimitConfig {
    /// Maximum number of calls admitted per `interval`. Must be >= 1.
    pub rate: u32,
    /// Width of the sliding window. Must be > 0.
    pub interval: Duration,
    /// Per-limit override of the poll cadence. `None` inherits the global
    /// default.
    pub check_interval: Option<Duration>,
    /// Per-limit override of the maximum time `shift` will wait. `None`
    /// inherits the global default. `Some(Duration::ZERO)` means "never
    /// wait", equivalent to the raise strategy.
    pub max_wait: Option<Duration>,
    /// Whether calls against this limit are reported to the metrics sink.
    pub metrics_enabled: bool,
}

impl Default for FixedLimitConfig {
    fn default() -> Self {
        Self {
            rate: 5,
            interval: Duration::from_secs(15),
            check_interval: None,
            max_wait: None,
            metrics_enabled: true,
        }
    }
}

/// Configuration for an adaptive (AIMD) limit.
#[derive(Debug, Clone)]
pub struct AdaptiveLimitConfig {
    /// Width of the window used to measure utilization and to admit calls.
    pub interval: Duration,
    /// Starting rate before any probing has occurred.
    pub initial_rate: u32,
    /// Rate will never be decreased below this floor.
    pub min_rate: u32,
    /// Rate will never be increased above this ceiling, if set.
    pub max_rate: Option<u32>,
    /// Additive step applied on a qualifying success probe.
    pub increase_by: u32,
    /// Multiplicative factor applied on failure. Must be in (0, 1).
    pub decrease_factor: f64,
    /// Minimum elapsed time since the last probe before another additive
    /// increase is considered.
    pub probe_window: Duration,
    /// Minimum elapsed time since the last decrease before any increase is
    /// considered.
    pub cooldown_after_decrease: Duration,
    /// Minimum observed utilization required before an increase is
    /// considered at all.
    pub utilization_threshold: f64,
    /// Base utilization required to probe past a previously observed
    /// error ceiling.
    pub ceiling_threshold: f64,
    /// Per-limit override of the poll cadence. `None` inherits the global
    /// default.
    pub check_interval: Option<Duration>,
    /// Per-limit override of the maximum time `shift` will wait.
    pub max_wait: Option<Duration>,
    /// Whether calls against this limit are reported to the metrics sink.
    pub metrics_enabled: bool,
}

impl AdaptiveLimitConfig {
    /// Range shorthand: derive a complete adaptive configuration from a
    /// closed integer range `[lo, hi]`, per the documented defaults.
    ///
    /// `initial_rate = ceil((lo + hi) / 2)`, `min_rate = lo`,
    /// `max_rate = hi`, `increase_by = max(1, (hi - lo) / 20)`. The
    /// remaining AIMD parameters are left at [`AdaptiveLimitConfig`]'s own
    /// defaults.
    pub fn from_range(lo: u32, hi: u32, interval: Duration) -> Self {
        let initial_rate = (lo + hi).div_ceil(2);
        let increase_by = ((hi.saturating_sub(lo)) / 20).max(1);
        Self {
            interval,
            initial_rate,
            min_rate: lo,
            max_rate: Some(hi),
            increase_by,
            ..Self::default_with_interval(interval)
        }
    }

    fn default_with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }
}

impl Default for AdaptiveLimitConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            initial_rate: 5,
            min_rate: 1,
            max_rate: None,
            increase_by: 1,
            decrease_factor: 0.5,
            probe_window: Duration::from_secs(30),
            cooldown_after_decrease: Duration::from_secs(30),
            utilization_threshold: 0.5,
            ceiling_threshold: 0.8,
            check_interval: None,
            max_wait: None,
            metrics_enabled: true,
        }
    }
}

/// The two limit kinds. Fixed limits carry no extra state beyond their
/// configuration; adaptive limits additionally own their AIMD rate cache.
#[derive(Debug, Clone)]
pub enum LimitKind {
    Fixed(FixedLimitConfig),
    Adaptive(AdaptiveLimitConfig),
}

impl LimitKind {
    pub fn check_interval(&self) -> Option<Duration> {
        match self {
            LimitKind::Fixed(c) => c.check_interval,
            LimitKind::Adaptive(c) => c.check_interval,
        }
    }

    pub fn max_wait(&self) -> Option<Duration> {
        match self {
            LimitKind::Fixed(c) => c.max_wait,
            LimitKind::Adaptive(c) => c.max_wait,
        }
    }

    pub fn metrics_enabled(&self) -> bool {
        match self {
            LimitKind::Fixed(c) => c.metrics_enabled,
            LimitKind::Adaptive(c) => c.metrics_enabled,
        }
    }

    pub fn interval(&self) -> Duration {
        match self {
            LimitKind::Fixed(c) => c.interval,
            LimitKind::Adaptive(c) => c.interval,
        }
    }

    pub fn is_adaptive(&self) -> bool {
        matches!(self, LimitKind::Adaptive(_))
    }
}

/// A named admission policy, normalized and immutable once registered.
#[derive(Debug, Clone)]
pub struct Limit {
    /// Normalized (lowercase, underscore-joined ascii) name.
    pub name: String,
    pub kind: LimitKind,
}

/// Outcome of a single admission attempt against the decision script.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionDecision {
    pub allowed: bool,
    /// Suggested wait, meaningful only when `allowed` is false.
    pub wait: Duration,
    /// Whether the decision (allow or reject) was driven by an active
    /// override rather than the sliding window.
    pub is_override: bool,
}

/// How to interpret the `reset` value passed to
/// [`crate::overrides::register_override`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// `reset` is a relative number of seconds, capped at one day.
    Seconds,
    /// `reset` is an absolute Unix epoch-seconds timestamp.
    Unix,
    /// `reset` is a concrete calendar instant.
    DateTime,
}

/// A scalar or a single-element wrapper around one, as upstream header
/// parsers commonly produce (`vec!["120"]` instead of `"120"`).
#[derive(Debug, Clone)]
pub enum ScalarOrList<T> {
    Scalar(T),
    List(Vec<T>),
}

impl<T: Clone> ScalarOrList<T> {
    /// Unwraps a bare scalar or a one-element list to its single value;
    /// any other shape (empty, or more than one element) resolves to
    /// `None`.
    pub fn resolve(&self) -> Option<T> {
        match self {
            ScalarOrList::Scalar(v) => Some(v.clone()),
            ScalarOrList::List(v) if v.len() == 1 => Some(v[0].clone()),
            ScalarOrList::List(_) => None,
        }
    }
}

impl<T> From<T> for ScalarOrList<T> {
    fn from(value: T) -> Self {
        ScalarOrList::Scalar(value)
    }
}

impl<T> From<Vec<T>> for ScalarOrList<T> {
    fn from(value: Vec<T>) -> Self {
        ScalarOrList::List(value)
    }
}

/// A loosely-typed integer, as it tends to arrive from header parsing:
/// either already numeric, or still a string that needs parsing.
#[derive(Debug, Clone)]
pub enum RawInt {
    Int(i64),
    Text(String),
}

impl RawInt {
    pub fn parse(&self) -> Option<i64> {
        match self {
            RawInt::Int(n) => Some(*n),
            RawInt::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// The `reset` argument to `register_override`, shaped by `reset_kind`.
#[derive(Debug, Clone)]
pub enum ResetValue {
    /// Valid for [`ResetKind::Seconds`] and [`ResetKind::Unix`].
    Number(ScalarOrList<RawInt>),
    /// Valid only for [`ResetKind::DateTime`]; a concrete instant, never a
    /// string or bare integer, so it cannot be silently misread as the
    /// wrong unit.
    Instant(SystemTime),
}
