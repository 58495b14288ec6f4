//! Policy resolution: which policy, and which identity provider, applies to a request.
//!
//! A [`ConfigurationProvider`] holds an optional default policy, an optional
//! default identity provider and an ordered list of [`PolicyBinding`]s. Every
//! binding's predicate is evaluated for every request:
//!
//! - no binding matches: the default policy applies, or no policy at all;
//! - exactly one matches: its policy applies, with its own identity provider
//!   or the default one;
//! - several match: resolution fails with
//!   [`RateLimitError::ConfigurationConflict`]. Bindings never shadow each
//!   other by order.

use http::Method;
use std::fmt;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::RateLimitError;
use crate::identity::LeakyBucketIdentity;
use crate::policy::LeakyBucketPolicy;
use crate::provider::IdentityProvider;

/// A pure function deciding whether a binding applies to a request.
pub type Predicate<Ctx> = Arc<dyn Fn(&Ctx) -> bool + Send + Sync>;

/// A shareable identity provider for contexts of type `Ctx`.
pub type SharedIdentityProvider<Ctx, I = LeakyBucketIdentity> =
    Arc<dyn IdentityProvider<Ctx, Identity = I>>;

/// A predicate together with the policy it selects.
pub struct PolicyBinding<Ctx: ?Sized, P = LeakyBucketPolicy, I = LeakyBucketIdentity> {
    predicate: Predicate<Ctx>,
    policy: Arc<P>,
    identity_provider: Option<SharedIdentityProvider<Ctx, I>>,
    catch_all: bool,
}

impl<Ctx: ?Sized, P, I> PolicyBinding<Ctx, P, I> {
    /// Bind `policy` to requests satisfying `predicate`.
    pub fn new<F>(predicate: F, policy: P) -> Self
    where
        F: Fn(&Ctx) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            policy: Arc::new(policy),
            identity_provider: None,
            catch_all: false,
        }
    }

    /// Resolve identities for this binding with `provider` instead of the default.
    #[must_use]
    pub fn with_identity_provider(mut self, provider: SharedIdentityProvider<Ctx, I>) -> Self {
        self.identity_provider = Some(provider);
        self
    }

    /// Whether the binding applies to `ctx`.
    #[inline]
    pub fn matches(&self, ctx: &Ctx) -> bool {
        (self.predicate)(ctx)
    }

    /// The bound policy.
    pub fn policy(&self) -> &P {
        &self.policy
    }
}

impl<Ctx: ?Sized, P: fmt::Debug, I> fmt::Debug for PolicyBinding<Ctx, P, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyBinding")
            .field("policy", &self.policy)
            .field("identity_provider", &self.identity_provider.is_some())
            .field("catch_all", &self.catch_all)
            .finish_non_exhaustive()
    }
}

/// The outcome of a successful resolution.
pub struct Resolution<'a, Ctx: ?Sized, P = LeakyBucketPolicy, I = LeakyBucketIdentity> {
    /// The policy that applies to the request.
    pub policy: &'a P,
    /// The identity provider to use, if one is configured.
    pub identity_provider: Option<&'a dyn IdentityProvider<Ctx, Identity = I>>,
    /// Index of the matching binding, or `None` for the default policy.
    pub binding: Option<usize>,
}

impl<Ctx: ?Sized, P: fmt::Debug, I> fmt::Debug for Resolution<'_, Ctx, P, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolution")
            .field("policy", &self.policy)
            .field("identity_provider", &self.identity_provider.is_some())
            .field("binding", &self.binding)
            .finish()
    }
}

/// Selects at most one policy per request.
pub struct ConfigurationProvider<Ctx: ?Sized, P = LeakyBucketPolicy, I = LeakyBucketIdentity> {
    default_policy: Option<Arc<P>>,
    default_identity_provider: Option<SharedIdentityProvider<Ctx, I>>,
    bindings: Vec<PolicyBinding<Ctx, P, I>>,
}

impl<Ctx: ?Sized, P, I> ConfigurationProvider<Ctx, P, I> {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> ConfigurationBuilder<Ctx, P, I> {
        ConfigurationBuilder::new()
    }

    /// Resolve the policy and identity provider for `ctx`.
    ///
    /// Returns `Ok(None)` when nothing applies, meaning the request should be
    /// admitted without limiting.
    pub fn resolve(&self, ctx: &Ctx) -> Result<Option<Resolution<'_, Ctx, P, I>>, RateLimitError> {
        let mut matches = self
            .bindings
            .iter()
            .enumerate()
            .filter(|(_, binding)| binding.matches(ctx));

        let first = matches.next();
        if let (Some((first_index, _)), Some((second_index, _))) = (first, matches.next()) {
            let mut matched = vec![first_index, second_index];
            matched.extend(matches.map(|(index, _)| index));
            #[cfg(feature = "tracing")]
            tracing::error!(?matched, "multiple rate limit policies matched one request");
            return Err(RateLimitError::ConfigurationConflict { matched });
        }

        let default_provider = self.default_identity_provider.as_deref();
        Ok(match first {
            Some((index, binding)) => Some(Resolution {
                policy: &binding.policy,
                identity_provider: binding.identity_provider.as_deref().or(default_provider),
                binding: Some(index),
            }),
            None => self.default_policy.as_deref().map(|policy| Resolution {
                policy,
                identity_provider: default_provider,
                binding: None,
            }),
        })
    }

    /// The default policy, if one was registered.
    pub fn default_policy(&self) -> Option<&P> {
        self.default_policy.as_deref()
    }

    /// The registered bindings, in registration order.
    pub fn bindings(&self) -> &[PolicyBinding<Ctx, P, I>] {
        &self.bindings
    }
}

impl<Ctx: ?Sized, P: fmt::Debug, I> fmt::Debug for ConfigurationProvider<Ctx, P, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigurationProvider")
            .field("default_policy", &self.default_policy)
            .field(
                "default_identity_provider",
                &self.default_identity_provider.is_some(),
            )
            .field("bindings", &self.bindings)
            .finish()
    }
}

/// Builder for a [`ConfigurationProvider`].
pub struct ConfigurationBuilder<Ctx: ?Sized, P = LeakyBucketPolicy, I = LeakyBucketIdentity> {
    default_policy: Option<Arc<P>>,
    default_identity_provider: Option<SharedIdentityProvider<Ctx, I>>,
    bindings: Vec<PolicyBinding<Ctx, P, I>>,
}

impl<Ctx: ?Sized, P, I> Default for ConfigurationBuilder<Ctx, P, I> {
    fn default() -> Self {
        Self {
            default_policy: None,
            default_identity_provider: None,
            bindings: Vec::new(),
        }
    }
}

impl<Ctx: ?Sized, P, I> ConfigurationBuilder<Ctx, P, I> {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `policy` to requests no binding matches.
    #[must_use]
    pub fn default_policy(mut self, policy: P) -> Self {
        self.default_policy = Some(Arc::new(policy));
        self
    }

    /// Resolve identities with `provider` unless a binding overrides it.
    #[must_use]
    pub fn default_identity_provider<T>(mut self, provider: T) -> Self
    where
        T: IdentityProvider<Ctx, Identity = I> + 'static,
    {
        self.default_identity_provider = Some(Arc::new(provider));
        self
    }

    /// Apply `policy` to requests satisfying `predicate`.
    ///
    /// The binding resolves callers through the default identity provider, so
    /// a caller's bucket is shared with the default policy and every other
    /// binding without a provider of its own. Use
    /// [`bind_with_provider`](Self::bind_with_provider) for a separate bucket.
    #[must_use]
    pub fn bind<F>(mut self, predicate: F, policy: P) -> Self
    where
        F: Fn(&Ctx) -> bool + Send + Sync + 'static,
    {
        self.bindings.push(PolicyBinding::new(predicate, policy));
        self
    }

    /// Apply `policy` to requests satisfying `predicate`, resolving identities
    /// with `provider`.
    #[must_use]
    pub fn bind_with_provider<F, T>(mut self, predicate: F, policy: P, provider: T) -> Self
    where
        F: Fn(&Ctx) -> bool + Send + Sync + 'static,
        T: IdentityProvider<Ctx, Identity = I> + 'static,
    {
        self.bindings
            .push(PolicyBinding::new(predicate, policy).with_identity_provider(Arc::new(provider)));
        self
    }

    /// Add a pre-built binding.
    #[must_use]
    pub fn add_binding(mut self, binding: PolicyBinding<Ctx, P, I>) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Build the provider.
    ///
    /// # Warnings
    ///
    /// If the `tracing` feature is enabled, this emits a warning when a
    /// catch-all route binding is registered alongside other bindings: every
    /// request that matches another binding will then fail with a conflict.
    #[must_use]
    pub fn build(self) -> ConfigurationProvider<Ctx, P, I> {
        #[cfg(feature = "tracing")]
        self.warn_catch_all_bindings();

        ConfigurationProvider {
            default_policy: self.default_policy,
            default_identity_provider: self.default_identity_provider,
            bindings: self.bindings,
        }
    }

    #[cfg(feature = "tracing")]
    fn warn_catch_all_bindings(&self) {
        if self.bindings.len() < 2 {
            return;
        }
        for (index, _) in self
            .bindings
            .iter()
            .enumerate()
            .filter(|(_, binding)| binding.catch_all)
        {
            tracing::warn!(
                catch_all_binding_index = index,
                bindings = self.bindings.len(),
                "Catch-all binding (index {}) overlaps every other binding. Requests matching \
                 another binding will fail with a configuration conflict. Use the default \
                 policy for catch-all limits instead.",
                index
            );
        }
    }
}

impl<Ctx, P, I> ConfigurationBuilder<Ctx, P, I>
where
    Ctx: RequestContext + ?Sized + 'static,
    P: 'static,
    I: 'static,
{
    /// Bind `policy` to requests matching a route.
    ///
    /// Like [`bind`](Self::bind), the route shares the default identity
    /// provider's buckets unless registered with
    /// [`route_with_provider`](Self::route_with_provider).
    ///
    /// ```rust
    /// use leaky_gate::{ConfigurationProvider, LeakyBucketPolicy};
    /// use http::Method;
    /// use std::time::Duration;
    ///
    /// let config = ConfigurationProvider::<http::request::Parts>::builder()
    ///     .default_policy(LeakyBucketPolicy::new(100, Duration::from_secs(1), 10))
    ///     .route(
    ///         |r| r.method(Method::POST).path("/order"),
    ///         LeakyBucketPolicy::new(10, Duration::from_secs(1), 1),
    ///     )
    ///     .build();
    /// assert_eq!(config.bindings().len(), 1);
    /// ```
    #[must_use]
    pub fn route<F>(self, configure: F, policy: P) -> Self
    where
        F: FnOnce(RouteMatcher) -> RouteMatcher,
    {
        self.route_binding(configure(RouteMatcher::new()), policy, None)
    }

    /// Bind `policy` to requests matching a route, resolving identities with
    /// `provider`.
    #[must_use]
    pub fn route_with_provider<F, T>(self, configure: F, policy: P, provider: T) -> Self
    where
        F: FnOnce(RouteMatcher) -> RouteMatcher,
        T: IdentityProvider<Ctx, Identity = I> + 'static,
    {
        self.route_binding(
            configure(RouteMatcher::new()),
            policy,
            Some(Arc::new(provider)),
        )
    }

    fn route_binding(
        mut self,
        matcher: RouteMatcher,
        policy: P,
        provider: Option<SharedIdentityProvider<Ctx, I>>,
    ) -> Self {
        let catch_all = matcher.is_catch_all();
        let mut binding = PolicyBinding::new(move |ctx: &Ctx| matcher.matches(ctx), policy);
        binding.catch_all = catch_all;
        binding.identity_provider = provider;
        self.bindings.push(binding);
        self
    }
}

impl<Ctx: ?Sized, P: fmt::Debug, I> fmt::Debug for ConfigurationBuilder<Ctx, P, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigurationBuilder")
            .field("default_policy", &self.default_policy)
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

/// Route predicate over host, method and path prefix.
///
/// Unset fields match everything. Path prefixes match on segment boundaries:
/// `/order` matches `/order`, `/order/` and `/order/123`, but not `/orders`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouteMatcher {
    host: Option<String>,
    method: Option<Method>,
    path_prefix: String,
}

impl RouteMatcher {
    /// Create a matcher that matches every request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Match only this hostname (ports are ignored).
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Match only this method.
    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Match only paths under this prefix.
    #[must_use]
    pub fn path(mut self, path_prefix: impl Into<String>) -> Self {
        self.path_prefix = path_prefix.into();
        self
    }

    /// Whether the matcher has no constraints.
    #[inline]
    pub fn is_catch_all(&self) -> bool {
        self.host.is_none() && self.method.is_none() && self.path_prefix.is_empty()
    }

    /// Whether `ctx` satisfies every configured constraint.
    pub fn matches<C: RequestContext + ?Sized>(&self, ctx: &C) -> bool {
        if let Some(ref host) = self.host {
            if ctx.host() != Some(host.as_str()) {
                return false;
            }
        }

        if let Some(ref method) = self.method {
            if ctx.method() != method {
                return false;
            }
        }

        if !self.path_prefix.is_empty() {
            let path = ctx.path();
            let Some(rest) = path.strip_prefix(self.path_prefix.as_str()) else {
                return false;
            };
            if !rest.is_empty() && !rest.starts_with('/') && !self.path_prefix.ends_with('/') {
                return false;
            }
        }

        true
    }
}
