//! Error types for admission control.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while configuring or running the admission gate.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// More than one policy binding matched a single request.
    ///
    /// Bindings must partition traffic unambiguously, so this is a deployment
    /// bug rather than a runtime condition.
    #[error("multiple rate limit policies matched this request (bindings {matched:?})")]
    ConfigurationConflict {
        /// Indices of the bindings that matched, in registration order.
        matched: Vec<usize>,
    },

    /// A policy was constructed with unusable parameters.
    #[error("invalid rate limit policy: {0}")]
    InvalidPolicy(&'static str),

    /// The request was rejected because the caller's bucket is full.
    #[error("rate limit exceeded ({remaining} remaining), retry after {retry_after:?}")]
    Rejected {
        /// Remaining allowance at the time of the decision.
        remaining: i64,
        /// Time until the bucket next leaks.
        retry_after: Duration,
    },
}

impl From<RateLimitError> for reqwest_middleware::Error {
    fn from(err: RateLimitError) -> Self {
        reqwest_middleware::Error::Middleware(err.into())
    }
}
