//! Error types reported across the coordinator's public surface.
//!
//! Rate-limited is the only kind callers normally catch; the rest are
//! programming or operational faults. See `SPEC_FULL.md` §7.

use std::time::Duration;

use thiserror::Error;

/// Errors that can be produced by the coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Invalid ranges or missing required fields, raised at registration.
    #[error("invalid limit configuration: {0}")]
    Configuration(String),

    /// Addressing a name that was never registered.
    #[error("unknown limit: {0}")]
    UnknownLimit(String),

    /// The call could not be admitted within `max_wait`, or was rejected
    /// immediately under the raise strategy.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// A Redis transport failure that was not fail-opened (or was
    /// promoted to an error after exhausting the NOSCRIPT reload).
    #[error("redis transport error: {0}")]
    Infrastructure(#[from] redis::RedisError),

    /// The admission or AIMD script returned a reply shape the engine did
    /// not expect, or a second NOSCRIPT was reported within one attempt.
    #[error("script contract violation: {0}")]
    ScriptContractViolation(String),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
