//! `reqwest-middleware` adapter for the admission gate.

use async_trait::async_trait;
use http::Extensions;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result as MiddlewareResult};
use std::fmt;

use crate::config::{ConfigurationBuilder, ConfigurationProvider};
use crate::context::OutboundRequest;
use crate::error::RateLimitError;
use crate::gate::{Admission, AdmissionGate};
use crate::leaky_bucket::LeakyBucket;
use crate::strategy::RateLimitStrategy;

/// Admission control for outbound `reqwest` requests.
///
/// Every request passes through an [`AdmissionGate`]. Rejected requests are
/// never sent and fail with [`RateLimitError::Rejected`]; a configuration
/// conflict fails with [`RateLimitError::ConfigurationConflict`]. When the
/// matching policy enables headers, they are copied onto the response.
///
/// # Thread Safety
///
/// `RateLimitMiddleware` is `Send + Sync`. Clones share the same gate, so
/// limits are enforced across all clones.
pub struct RateLimitMiddleware<S: RateLimitStrategy = LeakyBucket> {
    gate: AdmissionGate<OutboundRequest, S>,
}

impl RateLimitMiddleware {
    /// Create a builder for the middleware's configuration.
    ///
    /// ```rust
    /// use leaky_gate::{LeakyBucketPolicy, RateLimitMiddleware, RemoteAddrIdentityProvider};
    /// use std::time::Duration;
    ///
    /// let middleware = RateLimitMiddleware::new(
    ///     RateLimitMiddleware::builder()
    ///         .default_policy(LeakyBucketPolicy::new(100, Duration::from_secs(1), 10))
    ///         .default_identity_provider(RemoteAddrIdentityProvider::new())
    ///         .build(),
    /// );
    /// ```
    #[must_use]
    pub fn builder() -> ConfigurationBuilder<OutboundRequest> {
        ConfigurationProvider::builder()
    }

    /// Create a middleware using the system-clock leaky bucket.
    pub fn new(config: ConfigurationProvider<OutboundRequest>) -> Self {
        Self::from_gate(AdmissionGate::new(config))
    }
}

impl<S: RateLimitStrategy> RateLimitMiddleware<S> {
    /// Wrap an existing gate.
    pub fn from_gate(gate: AdmissionGate<OutboundRequest, S>) -> Self {
        Self { gate }
    }

    /// The underlying gate.
    pub fn gate(&self) -> &AdmissionGate<OutboundRequest, S> {
        &self.gate
    }
}

impl<S> fmt::Debug for RateLimitMiddleware<S>
where
    S: RateLimitStrategy + fmt::Debug,
    S::Policy: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitMiddleware")
            .field("gate", &self.gate)
            .finish()
    }
}

impl<S: RateLimitStrategy> Clone for RateLimitMiddleware<S> {
    fn clone(&self) -> Self {
        Self {
            gate: self.gate.clone(),
        }
    }
}

#[async_trait]
impl<S> Middleware for RateLimitMiddleware<S>
where
    S: RateLimitStrategy + 'static,
{
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        let ctx = OutboundRequest::new(req, extensions);
        let admission = self.gate.admit(&ctx)?;
        let req = ctx.into_request();

        if let Admission::Rejected {
            remaining,
            retry_after,
            ..
        } = &admission
        {
            return Err(RateLimitError::Rejected {
                remaining: *remaining,
                retry_after: *retry_after,
            }
            .into());
        }

        let mut response = next.run(req, extensions).await?;
        admission.apply_headers(response.headers_mut());
        Ok(response)
    }
}

impl Default for RateLimitMiddleware {
    /// Create a middleware with no policies configured.
    ///
    /// All requests pass through without any rate limiting.
    fn default() -> Self {
        Self::new(Self::builder().build())
    }
}
