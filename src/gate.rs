//! The per-request admission decision.

use http::HeaderMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigurationProvider;
use crate::error::RateLimitError;
#[cfg(feature = "tracing")]
use crate::identity::Identity;
use crate::leaky_bucket::LeakyBucket;
use crate::strategy::RateLimitStrategy;

/// Outcome of [`AdmissionGate::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The request fits the caller's allowance, which has been charged.
    Admitted {
        /// Diagnostic headers; empty unless the policy enables them.
        headers: HeaderMap,
    },
    /// The caller has no allowance left. The boundary should answer with
    /// "429 Too Many Requests".
    Rejected {
        /// Diagnostic headers; empty unless the policy enables them.
        headers: HeaderMap,
        /// Remaining allowance at the time of the decision.
        remaining: i64,
        /// Time until the bucket next leaks.
        retry_after: Duration,
    },
    /// No policy or no identity provider applies; the request passes unlimited.
    Unconfigured,
}

impl Admission {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }

    /// Diagnostic headers to attach to the response, if any.
    pub fn headers(&self) -> Option<&HeaderMap> {
        match self {
            Admission::Admitted { headers } | Admission::Rejected { headers, .. } => {
                Some(headers).filter(|headers| !headers.is_empty())
            }
            Admission::Unconfigured => None,
        }
    }

    /// Copy the diagnostic headers onto an outgoing response's headers.
    pub fn apply_headers(&self, target: &mut HeaderMap) {
        if let Some(headers) = self.headers() {
            for (name, value) in headers {
                target.insert(name.clone(), value.clone());
            }
        }
    }
}

/// Orchestrates policy resolution, identity resolution and the strategy.
///
/// The gate is cheap to clone; clones share configuration and strategy, so
/// limits are enforced across all of them.
pub struct AdmissionGate<Ctx: ?Sized, S: RateLimitStrategy = LeakyBucket> {
    config: Arc<ConfigurationProvider<Ctx, S::Policy, S::Identity>>,
    strategy: Arc<S>,
}

impl<Ctx: ?Sized> AdmissionGate<Ctx> {
    /// Create a gate using the system-clock leaky bucket.
    pub fn new(config: ConfigurationProvider<Ctx>) -> Self {
        Self::with_strategy(config, LeakyBucket::new())
    }
}

impl<Ctx: ?Sized, S: RateLimitStrategy> AdmissionGate<Ctx, S> {
    /// Create a gate with a custom strategy.
    pub fn with_strategy(
        config: ConfigurationProvider<Ctx, S::Policy, S::Identity>,
        strategy: S,
    ) -> Self {
        Self {
            config: Arc::new(config),
            strategy: Arc::new(strategy),
        }
    }

    /// The configuration consulted for every request.
    pub fn config(&self) -> &ConfigurationProvider<Ctx, S::Policy, S::Identity> {
        &self.config
    }

    /// The rate limit strategy.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Decide whether the request described by `ctx` may proceed.
    ///
    /// Only a configuration conflict is an error. Missing configuration and
    /// missing identity providers admit the request.
    pub fn admit(&self, ctx: &Ctx) -> Result<Admission, RateLimitError> {
        let Some(resolution) = self.config.resolve(ctx)? else {
            return Ok(Admission::Unconfigured);
        };

        let Some(provider) = resolution.identity_provider else {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                binding = ?resolution.binding,
                "rate limit policy matched but no identity provider is configured; \
                 admitting request"
            );
            return Ok(Admission::Unconfigured);
        };

        let policy = resolution.policy;
        let identity = provider.resolve(ctx);
        let acquired = self.strategy.acquire(&identity, policy);

        // Headers describe this decision, including its charge.
        let headers = if self.strategy.should_add_headers(policy) {
            self.strategy.acquired_headers(policy, &acquired)
        } else {
            HeaderMap::new()
        };

        if acquired.admitted {
            #[cfg(feature = "tracing")]
            tracing::trace!(
                identity = identity.unique_identifier(),
                remaining = acquired.remaining,
                "request admitted"
            );
            Ok(Admission::Admitted { headers })
        } else {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                identity = identity.unique_identifier(),
                remaining = acquired.remaining,
                retry_after = ?acquired.retry_after,
                "request rejected"
            );
            Ok(Admission::Rejected {
                headers,
                remaining: acquired.remaining,
                retry_after: acquired.retry_after,
            })
        }
    }
}

impl<Ctx: ?Sized, S: RateLimitStrategy> Clone for AdmissionGate<Ctx, S> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            strategy: Arc::clone(&self.strategy),
        }
    }
}

impl<Ctx: ?Sized, S> fmt::Debug for AdmissionGate<Ctx, S>
where
    S: RateLimitStrategy + fmt::Debug,
    S::Policy: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("config", &self.config)
            .field("strategy", &self.strategy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::policy::LeakyBucketPolicy;
    use crate::identity::LeakyBucketIdentity;
    use crate::provider::{FnIdentityProvider, PredictableIdentityProvider};
    use crate::strategy::Acquired;

    type Req = http::Request<()>;

    fn get(path: &str) -> Req {
        http::Request::get(path).body(()).unwrap()
    }

    fn gate(
        config: ConfigurationProvider<Req>,
    ) -> (AdmissionGate<Req, LeakyBucket<MockClock>>, MockClock) {
        let clock = MockClock::default();
        (
            AdmissionGate::with_strategy(config, LeakyBucket::with_clock(clock.clone())),
            clock,
        )
    }

    #[test]
    fn test_no_policy_is_unconfigured() {
        let (gate, _) = gate(ConfigurationProvider::builder().build());
        assert_eq!(gate.admit(&get("/")).unwrap(), Admission::Unconfigured);
    }

    #[test]
    fn test_missing_identity_provider_fails_open() {
        let (gate, _) = gate(
            ConfigurationProvider::builder()
                .default_policy(LeakyBucketPolicy::new(0, Duration::from_secs(1), 1))
                .build(),
        );
        let admission = gate.admit(&get("/")).unwrap();
        assert_eq!(admission, Admission::Unconfigured);
        assert!(admission.is_allowed());
    }

    #[test]
    fn test_admits_until_bucket_is_full() {
        let (gate, clock) = gate(
            ConfigurationProvider::builder()
                .default_policy(LeakyBucketPolicy::new(2, Duration::from_secs(1), 2))
                .default_identity_provider(PredictableIdentityProvider::from_key("client"))
                .build(),
        );

        assert!(matches!(gate.admit(&get("/")).unwrap(), Admission::Admitted { .. }));
        assert!(matches!(gate.admit(&get("/")).unwrap(), Admission::Admitted { .. }));
        match gate.admit(&get("/")).unwrap() {
            Admission::Rejected {
                remaining,
                retry_after,
                headers,
            } => {
                assert_eq!(remaining, 0);
                assert_eq!(retry_after, Duration::from_secs(1));
                assert!(headers.is_empty());
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        clock.advance(Duration::from_secs(1));
        assert!(gate.admit(&get("/")).unwrap().is_allowed());
    }

    #[test]
    fn test_headers_reflect_consumption() {
        let (gate, _) = gate(
            ConfigurationProvider::builder()
                .default_policy(
                    LeakyBucketPolicy::new(40, Duration::from_secs(1), 2)
                        .request_cost(3)
                        .enable_headers(true)
                        .header_prefix("X-TEST-"),
                )
                .default_identity_provider(PredictableIdentityProvider::from_key("client"))
                .build(),
        );

        let admission = gate.admit(&get("/")).unwrap();
        let headers = admission.headers().unwrap();
        assert_eq!(headers["X-TEST-RateLimit-Remaining"], "37");
        assert_eq!(headers["X-TEST-RateLimit-BucketSize"], "40");
        assert_eq!(headers["X-TEST-RateLimit-Cost"], "3");

        let mut response = HeaderMap::new();
        gate.admit(&get("/")).unwrap().apply_headers(&mut response);
        assert_eq!(response["X-TEST-RateLimit-Remaining"], "34");
        assert_eq!(response["X-TEST-RateLimit-LeakRate"], "00:00:01");
    }

    #[test]
    fn test_conflict_is_surfaced() {
        let policy = LeakyBucketPolicy::new(5, Duration::from_secs(1), 1);
        let (gate, _) = gate(
            ConfigurationProvider::builder()
                .default_identity_provider(PredictableIdentityProvider::from_key("client"))
                .bind(|_: &Req| true, policy.clone())
                .bind(|_: &Req| true, policy)
                .build(),
        );

        assert!(matches!(
            gate.admit(&get("/")),
            Err(RateLimitError::ConfigurationConflict { .. })
        ));
    }

    #[test]
    fn test_callers_have_separate_buckets() {
        let (gate, _) = gate(
            ConfigurationProvider::builder()
                .default_policy(LeakyBucketPolicy::new(1, Duration::from_secs(60), 1))
                .default_identity_provider(FnIdentityProvider::new(|req: &Req| {
                    req.uri().path().to_string()
                }))
                .build(),
        );

        assert!(gate.admit(&get("/a")).unwrap().is_allowed());
        assert!(!gate.admit(&get("/a")).unwrap().is_allowed());
        assert!(gate.admit(&get("/b")).unwrap().is_allowed());
    }

    /// Charges one extra unit right after every decision, as a concurrent
    /// request on the same bucket would.
    #[derive(Debug, Default)]
    struct InterleavedCharge(LeakyBucket<MockClock>);

    impl RateLimitStrategy for InterleavedCharge {
        type Identity = LeakyBucketIdentity;
        type Policy = LeakyBucketPolicy;

        fn has_remaining_allowance(
            &self,
            identity: &Self::Identity,
            policy: &Self::Policy,
        ) -> bool {
            self.0.has_remaining_allowance(identity, policy)
        }

        fn remaining(&self, identity: &Self::Identity, policy: &Self::Policy) -> i64 {
            self.0.remaining(identity, policy)
        }

        fn consume(&self, identity: &Self::Identity, requests: u64) -> i64 {
            self.0.consume(identity, requests)
        }

        fn refund(&self, identity: &Self::Identity, requests: u64) -> i64 {
            self.0.refund(identity, requests)
        }

        fn acquire(&self, identity: &Self::Identity, policy: &Self::Policy) -> Acquired {
            let acquired = self.0.acquire(identity, policy);
            self.0.consume(identity, 1);
            acquired
        }

        fn should_add_headers(&self, policy: &Self::Policy) -> bool {
            self.0.should_add_headers(policy)
        }

        fn response_headers(
            &self,
            identity: &Self::Identity,
            policy: &Self::Policy,
        ) -> HeaderMap {
            self.0.response_headers(identity, policy)
        }

        fn acquired_headers(&self, policy: &Self::Policy, acquired: &Acquired) -> HeaderMap {
            self.0.acquired_headers(policy, acquired)
        }
    }

    #[test]
    fn test_headers_match_the_decision_under_interleaving() {
        let gate = AdmissionGate::with_strategy(
            ConfigurationProvider::<Req>::builder()
                .default_policy(
                    LeakyBucketPolicy::new(10, Duration::from_secs(60), 1).enable_headers(true),
                )
                .default_identity_provider(PredictableIdentityProvider::from_key("client"))
                .build(),
            InterleavedCharge::default(),
        );

        match gate.admit(&get("/")).unwrap() {
            Admission::Admitted { headers } => {
                assert_eq!(headers["X-RateLimit-Remaining"], "9");
            }
            other => panic!("expected admission, got {other:?}"),
        }
        // The first request's interleaved charge is visible to the second decision.
        match gate.admit(&get("/")).unwrap() {
            Admission::Admitted { headers } => {
                assert_eq!(headers["X-RateLimit-Remaining"], "7");
            }
            other => panic!("expected admission, got {other:?}"),
        }
    }
}
