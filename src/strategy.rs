//! The rate limit strategy abstraction.

use http::HeaderMap;
use std::time::Duration;

use crate::identity::Identity;

/// Outcome of an atomic check-and-consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    /// Whether the request may proceed.
    pub admitted: bool,
    /// Remaining allowance after the decision.
    pub remaining: i64,
    /// For rejected requests, the time until allowance is next restored.
    pub retry_after: Duration,
}

/// Allowance accounting for one kind of identity and policy.
///
/// Strategies name their identity and policy types, so passing an identity of
/// the wrong representation is a compile error rather than a runtime fault.
pub trait RateLimitStrategy: Send + Sync {
    /// Identity type carrying per-caller state.
    type Identity: Identity;
    /// Policy type holding the limit parameters.
    type Policy: Send + Sync;

    /// Apply decay, then report whether any allowance is left.
    fn has_remaining_allowance(&self, identity: &Self::Identity, policy: &Self::Policy) -> bool;

    /// Apply decay, then return the remaining allowance. May be negative.
    fn remaining(&self, identity: &Self::Identity, policy: &Self::Policy) -> i64;

    /// Consume `requests` units unconditionally. Returns the new usage.
    fn consume(&self, identity: &Self::Identity, requests: u64) -> i64;

    /// Give back `requests` units. Returns the new usage.
    fn refund(&self, identity: &Self::Identity, requests: u64) -> i64;

    /// Decay, check and consume the policy's request cost as one atomic step.
    fn acquire(&self, identity: &Self::Identity, policy: &Self::Policy) -> Acquired;

    /// Whether `policy` asks for diagnostic headers.
    fn should_add_headers(&self, policy: &Self::Policy) -> bool;

    /// Diagnostic headers reflecting the identity's current state.
    fn response_headers(&self, identity: &Self::Identity, policy: &Self::Policy) -> HeaderMap;

    /// Diagnostic headers for the outcome of one [`acquire`](Self::acquire).
    ///
    /// Reports the allowance the decision observed, not whatever concurrent
    /// requests have left since.
    fn acquired_headers(&self, policy: &Self::Policy, acquired: &Acquired) -> HeaderMap;
}
