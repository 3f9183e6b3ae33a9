//! The metrics sink interface: a fixed, side-effect-free set of
//! observation hooks the core calls into at defined points. The core must
//! never let a sink failure change an admission decision, so every hook
//! returns nothing and is expected to be infallible (a sink that can fail
//! internally must swallow its own errors).
//!
//! Aggregating, storing or exposing these observations (Prometheus,
//! StatsD, the dashboard) is out of scope here; this module only defines
//! the seam and ships two trivial implementations.

use std::time::Duration;

/// Pluggable observation sink. Implementations must be cheap and must not
/// block the admission path for long; a sink doing expensive work should
/// hand off to a background channel itself.
pub trait MetricsSink: Send + Sync {
    /// A call against `limit` was admitted.
    fn record_allowed(&self, limit: &str) {
        let _ = limit;
    }

    /// A call against `limit` was blocked (either it failed with
    /// `rate_limited`, or it was about to wait).
    fn record_blocked(&self, limit: &str) {
        let _ = limit;
    }

    /// An override was registered for `limit`.
    fn record_override(&self, limit: &str, remaining: i64, ttl: Duration) {
        let _ = (limit, remaining, ttl);
    }

    /// Metadata about a limit at registration time (its kind, its rate).
    fn record_registry_meta(&self, limit: &str, kind: &str) {
        let _ = (limit, kind);
    }
}

/// Default sink: every hook is a no-op. Used when the host application
/// does not wire in anything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {}

/// Turns each hook into a structured `tracing` event. Gives a consumer
/// useful signal with zero external wiring; routing those events into an
/// actual metrics backend remains the host application's job.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record_allowed(&self, limit: &str) {
        tracing::debug!(limit, "call admitted");
    }

    fn record_blocked(&self, limit: &str) {
        tracing::debug!(limit, "call blocked");
    }

    fn record_override(&self, limit: &str, remaining: i64, ttl: Duration) {
        tracing::info!(limit, remaining, ttl = ?ttl, "override registered");
    }

    fn record_registry_meta(&self, limit: &str, kind: &str) {
        tracing::info!(limit, kind, "limit registered");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn noop_sink_never_panics() {
        let sink = NoopSink;
        sink.record_allowed("x");
        sink.record_blocked("x");
        sink.record_override("x", 5, Duration::from_secs(1));
        sink.record_registry_meta("x", "fixed");
    }
}
