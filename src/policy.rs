//! Leaky bucket policy parameters.

use std::time::Duration;

use crate::error::RateLimitError;

/// Default prefix prepended to every diagnostic header name.
pub const DEFAULT_HEADER_PREFIX: &str = "X-";

/// Parameters governing one leaky bucket.
///
/// A bucket fills by [`request_cost`](Self::request_cost) per admitted request
/// and drains by [`leak_amount`](Self::leak_amount) every
/// [`leak_rate`](Self::leak_rate). Requests are admitted while the bucket holds
/// fewer than [`max_requests`](Self::max_requests) units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakyBucketPolicy {
    /// Bucket capacity.
    pub max_requests: u64,
    /// Length of one decay tick.
    pub leak_rate: Duration,
    /// Units drained per tick.
    pub leak_amount: u64,
    /// Units consumed per admitted request.
    pub request_cost: u64,
    /// Whether diagnostic headers are emitted.
    pub enable_headers: bool,
    /// Prefix for diagnostic header names.
    pub header_prefix: String,
}

impl LeakyBucketPolicy {
    /// Create a new policy with a request cost of 1 and headers disabled.
    ///
    /// # Panics
    ///
    /// Panics if `leak_rate` is zero.
    pub fn new(max_requests: u64, leak_rate: Duration, leak_amount: u64) -> Self {
        assert!(!leak_rate.is_zero(), "leak rate must be greater than 0");
        Self {
            max_requests,
            leak_rate,
            leak_amount,
            request_cost: 1,
            enable_headers: false,
            header_prefix: DEFAULT_HEADER_PREFIX.to_string(),
        }
    }

    /// Fallible counterpart of [`new`](Self::new).
    pub fn try_new(
        max_requests: u64,
        leak_rate: Duration,
        leak_amount: u64,
    ) -> Result<Self, RateLimitError> {
        if leak_rate.is_zero() {
            return Err(RateLimitError::InvalidPolicy("leak rate must be greater than 0"));
        }
        Ok(Self::new(max_requests, leak_rate, leak_amount))
    }

    /// Time a full bucket needs to drain completely.
    ///
    /// `Duration::MAX` when the bucket never leaks.
    pub fn drain_time(&self) -> Duration {
        if self.leak_amount == 0 {
            return Duration::MAX;
        }
        let ticks = self.max_requests.div_ceil(self.leak_amount);
        self.leak_rate
            .saturating_mul(u32::try_from(ticks).unwrap_or(u32::MAX))
    }

    /// Set the number of units each admitted request consumes.
    #[must_use]
    pub fn request_cost(mut self, cost: u64) -> Self {
        self.request_cost = cost;
        self
    }

    /// Enable or disable diagnostic headers.
    #[must_use]
    pub fn enable_headers(mut self, enabled: bool) -> Self {
        self.enable_headers = enabled;
        self
    }

    /// Set the header name prefix.
    ///
    /// # Panics
    ///
    /// Panics if the prefix contains characters that are not valid in an HTTP
    /// header name. Use [`try_header_prefix`](Self::try_header_prefix) to
    /// handle this as an error.
    #[must_use]
    pub fn header_prefix(self, prefix: impl Into<String>) -> Self {
        match self.try_header_prefix(prefix) {
            Ok(policy) => policy,
            Err(_) => panic!("header prefix must only contain header name characters"),
        }
    }

    /// Fallible counterpart of [`header_prefix`](Self::header_prefix).
    pub fn try_header_prefix(mut self, prefix: impl Into<String>) -> Result<Self, RateLimitError> {
        let prefix = prefix.into();
        if !prefix.bytes().all(is_token_byte) {
            return Err(RateLimitError::InvalidPolicy(
                "header prefix must only contain header name characters",
            ));
        }
        self.header_prefix = prefix;
        Ok(self)
    }
}

// RFC 9110 token characters.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
