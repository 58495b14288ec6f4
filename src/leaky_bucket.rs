//! Leaky bucket strategy.
//!
//! Each identity holds a counter that grows by the request cost on every
//! admitted request and drains by `leak_amount` for every whole `leak_rate`
//! elapsed since the last leak. Requests are admitted while the counter is
//! below `max_requests`.
//!
//! The decay clock is re-based to "now" on every leak, not to the nearest tick
//! boundary. A caller returning after a long idle period receives a single
//! catch-up leak covering every whole tick elapsed.

use http::{HeaderMap, HeaderValue};
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::headers;
use crate::identity::{BucketState, LeakyBucketIdentity};
use crate::policy::LeakyBucketPolicy;
use crate::strategy::{Acquired, RateLimitStrategy};

/// Leaky bucket [`RateLimitStrategy`].
#[derive(Debug, Clone, Default)]
pub struct LeakyBucket<C = SystemClock> {
    clock: C,
}

impl LeakyBucket {
    /// Create a strategy driven by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C: Clock> LeakyBucket<C> {
    /// Create a strategy driven by `clock`.
    pub fn with_clock(clock: C) -> Self {
        Self { clock }
    }

    /// The strategy's clock.
    pub fn clock(&self) -> &C {
        &self.clock
    }
}

fn leak(state: &mut BucketState, policy: &LeakyBucketPolicy, now: Instant) {
    let Some(last_leak) = state.last_leak else {
        // First observation starts the clock without leaking.
        state.last_leak = Some(now);
        return;
    };

    let elapsed = now.saturating_duration_since(last_leak);
    if elapsed < policy.leak_rate {
        return;
    }

    let ticks = elapsed.as_nanos() / policy.leak_rate.as_nanos();
    let total = ticks.saturating_mul(u128::from(policy.leak_amount));
    let total = i64::try_from(total).unwrap_or(i64::MAX);
    state.request_count = state.request_count.saturating_sub(total).max(0);
    state.last_leak = Some(now);
}

fn remaining_of(state: &BucketState, policy: &LeakyBucketPolicy) -> i64 {
    clamp_i64(policy.max_requests).saturating_sub(state.request_count)
}

fn retry_after(state: &BucketState, policy: &LeakyBucketPolicy, now: Instant) -> Duration {
    if policy.leak_amount == 0 {
        return Duration::MAX;
    }
    match state.last_leak {
        Some(last_leak) => policy
            .leak_rate
            .saturating_sub(now.saturating_duration_since(last_leak)),
        None => policy.leak_rate,
    }
}

#[inline]
fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl<C: Clock> RateLimitStrategy for LeakyBucket<C> {
    type Identity = LeakyBucketIdentity;
    type Policy = LeakyBucketPolicy;

    fn has_remaining_allowance(
        &self,
        identity: &LeakyBucketIdentity,
        policy: &LeakyBucketPolicy,
    ) -> bool {
        self.remaining(identity, policy) > 0
    }

    fn remaining(&self, identity: &LeakyBucketIdentity, policy: &LeakyBucketPolicy) -> i64 {
        let mut state = identity.lock();
        leak(&mut state, policy, self.clock.now());
        remaining_of(&state, policy)
    }

    fn consume(&self, identity: &LeakyBucketIdentity, requests: u64) -> i64 {
        let mut state = identity.lock();
        state.request_count = state.request_count.saturating_add(clamp_i64(requests));
        state.request_count
    }

    fn refund(&self, identity: &LeakyBucketIdentity, requests: u64) -> i64 {
        let mut state = identity.lock();
        state.request_count = state
            .request_count
            .saturating_sub(clamp_i64(requests))
            .max(0);
        state.request_count
    }

    fn acquire(&self, identity: &LeakyBucketIdentity, policy: &LeakyBucketPolicy) -> Acquired {
        let now = self.clock.now();
        let mut state = identity.lock();
        leak(&mut state, policy, now);

        if remaining_of(&state, policy) > 0 {
            state.request_count = state
                .request_count
                .saturating_add(clamp_i64(policy.request_cost));
            Acquired {
                admitted: true,
                remaining: remaining_of(&state, policy),
                retry_after: Duration::ZERO,
            }
        } else {
            Acquired {
                admitted: false,
                remaining: remaining_of(&state, policy),
                retry_after: retry_after(&state, policy, now),
            }
        }
    }

    fn should_add_headers(&self, policy: &LeakyBucketPolicy) -> bool {
        policy.enable_headers
    }

    fn response_headers(
        &self,
        identity: &LeakyBucketIdentity,
        policy: &LeakyBucketPolicy,
    ) -> HeaderMap {
        diagnostic_headers(policy, self.remaining(identity, policy))
    }

    fn acquired_headers(&self, policy: &LeakyBucketPolicy, acquired: &Acquired) -> HeaderMap {
        diagnostic_headers(policy, acquired.remaining)
    }
}

fn diagnostic_headers(policy: &LeakyBucketPolicy, remaining: i64) -> HeaderMap {
    let prefix = policy.header_prefix.as_str();
    let mut map = HeaderMap::with_capacity(5);

    headers::insert(
        &mut map,
        prefix,
        headers::REMAINING,
        HeaderValue::from(remaining),
    );
    if let Ok(value) = HeaderValue::from_str(&headers::format_leak_rate(policy.leak_rate)) {
        headers::insert(&mut map, prefix, headers::LEAK_RATE, value);
    }
    headers::insert(
        &mut map,
        prefix,
        headers::LEAK_AMOUNT,
        HeaderValue::from(policy.leak_amount),
    );
    headers::insert(
        &mut map,
        prefix,
        headers::BUCKET_SIZE,
        HeaderValue::from(policy.max_requests),
    );
    headers::insert(
        &mut map,
        prefix,
        headers::COST,
        HeaderValue::from(policy.request_cost),
    );
    map
}
