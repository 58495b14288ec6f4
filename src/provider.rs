//! Identity providers: turn a request into the caller's identity.
//!
//! Every cached provider owns its own [`IdentityCache`]; identities are never
//! shared between providers.

use std::fmt;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::identity::{Identity, IdentityCache, LeakyBucketIdentity};

/// Claim holding the authenticated subject.
pub const SUBJECT_CLAIM: &str = "sub";
/// Claim holding the OAuth client id.
pub const CLIENT_ID_CLAIM: &str = "client_id";
/// Placeholder for a claim the caller did not present.
pub const UNKNOWN_CLAIM: &str = "Unknown";

/// Resolves the calling client for a request.
///
/// Repeated calls describing the same logical caller must return the same
/// identity instance, so that each caller has exactly one bucket.
pub trait IdentityProvider<Ctx: ?Sized>: Send + Sync {
    /// The identity type handed to the rate limit strategy.
    type Identity: Identity;

    /// Resolve the identity of the caller behind `ctx`.
    fn resolve(&self, ctx: &Ctx) -> Arc<Self::Identity>;
}

/// Identifies callers by the IP address of the connected peer.
///
/// Requests without a recorded [`RemoteAddr`](crate::RemoteAddr) resolve to
/// the empty identifier and therefore share a single bucket.
pub struct RemoteAddrIdentityProvider<I = LeakyBucketIdentity> {
    cache: Arc<IdentityCache<I>>,
}

impl<I: Identity> RemoteAddrIdentityProvider<I> {
    /// Create a provider with an unbounded cache.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cache(Arc::new(IdentityCache::new()))
    }

    /// Create a provider backed by `cache`.
    #[must_use]
    pub fn with_cache(cache: Arc<IdentityCache<I>>) -> Self {
        Self { cache }
    }

    /// The identity cache, e.g. for scheduling [`IdentityCache::spawn_cleanup`].
    pub fn cache(&self) -> &Arc<IdentityCache<I>> {
        &self.cache
    }
}

impl<I: Identity> Default for RemoteAddrIdentityProvider<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, Ctx> IdentityProvider<Ctx> for RemoteAddrIdentityProvider<I>
where
    I: Identity,
    Ctx: RequestContext + ?Sized,
{
    type Identity = I;

    fn resolve(&self, ctx: &Ctx) -> Arc<I> {
        let key = ctx
            .remote_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        self.cache.get_or_insert(&key)
    }
}

/// Identifies callers by authenticated subject and client id.
///
/// The key has the form `"{sub}::{client_id}"`; a missing claim is rendered as
/// `Unknown`, so unauthenticated callers share the `Unknown::Unknown` bucket.
pub struct ClaimsIdentityProvider<I = LeakyBucketIdentity> {
    cache: Arc<IdentityCache<I>>,
    subject_claim: String,
    client_claim: String,
}

impl<I: Identity> ClaimsIdentityProvider<I> {
    /// Create a provider reading the `sub` and `client_id` claims.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cache(Arc::new(IdentityCache::new()))
    }

    /// Create a provider backed by `cache`.
    #[must_use]
    pub fn with_cache(cache: Arc<IdentityCache<I>>) -> Self {
        Self {
            cache,
            subject_claim: SUBJECT_CLAIM.to_string(),
            client_claim: CLIENT_ID_CLAIM.to_string(),
        }
    }

    /// Read the subject from a different claim.
    #[must_use]
    pub fn subject_claim(mut self, name: impl Into<String>) -> Self {
        self.subject_claim = name.into();
        self
    }

    /// Read the client id from a different claim.
    #[must_use]
    pub fn client_claim(mut self, name: impl Into<String>) -> Self {
        self.client_claim = name.into();
        self
    }

    /// The identity cache.
    pub fn cache(&self) -> &Arc<IdentityCache<I>> {
        &self.cache
    }
}

impl<I: Identity> Default for ClaimsIdentityProvider<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, Ctx> IdentityProvider<Ctx> for ClaimsIdentityProvider<I>
where
    I: Identity,
    Ctx: RequestContext + ?Sized,
{
    type Identity = I;

    fn resolve(&self, ctx: &Ctx) -> Arc<I> {
        let subject = ctx.claim(&self.subject_claim).unwrap_or(UNKNOWN_CLAIM);
        let client = ctx.claim(&self.client_claim).unwrap_or(UNKNOWN_CLAIM);
        self.cache.get_or_insert(&format!("{subject}::{client}"))
    }
}

/// Identifies callers with a caller-supplied key extraction function.
///
/// Works with any context type, which makes it the provider of choice for
/// contexts that do not implement [`RequestContext`].
pub struct FnIdentityProvider<F, I = LeakyBucketIdentity> {
    extract: F,
    cache: Arc<IdentityCache<I>>,
}

impl<F, I: Identity> FnIdentityProvider<F, I> {
    /// Create a provider that keys callers by `extract(ctx)`.
    pub fn new(extract: F) -> Self {
        Self::with_cache(extract, Arc::new(IdentityCache::new()))
    }

    /// Create a provider backed by `cache`.
    pub fn with_cache(extract: F, cache: Arc<IdentityCache<I>>) -> Self {
        Self { extract, cache }
    }

    /// The identity cache.
    pub fn cache(&self) -> &Arc<IdentityCache<I>> {
        &self.cache
    }
}

impl<F, I, Ctx> IdentityProvider<Ctx> for FnIdentityProvider<F, I>
where
    F: Fn(&Ctx) -> String + Send + Sync,
    I: Identity,
    Ctx: ?Sized,
{
    type Identity = I;

    fn resolve(&self, ctx: &Ctx) -> Arc<I> {
        self.cache.get_or_insert(&(self.extract)(ctx))
    }
}

/// Returns the same identity for every request.
///
/// Useful in tests, or to apply one global bucket to all traffic.
pub struct PredictableIdentityProvider<I = LeakyBucketIdentity> {
    identity: Arc<I>,
}

impl<I: Identity> PredictableIdentityProvider<I> {
    /// Always resolve to `identity`.
    pub fn new(identity: Arc<I>) -> Self {
        Self { identity }
    }

    /// Always resolve to a fresh identity keyed by `key`.
    pub fn from_key(key: impl Into<String>) -> Self {
        Self::new(Arc::new(I::from_key(key.into())))
    }

    /// The identity handed out for every request.
    pub fn identity(&self) -> &Arc<I> {
        &self.identity
    }
}

impl<I, Ctx> IdentityProvider<Ctx> for PredictableIdentityProvider<I>
where
    I: Identity,
    Ctx: ?Sized,
{
    type Identity = I;

    fn resolve(&self, _ctx: &Ctx) -> Arc<I> {
        Arc::clone(&self.identity)
    }
}

impl<I> fmt::Debug for RemoteAddrIdentityProvider<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAddrIdentityProvider")
            .field("cache", &self.cache)
            .finish()
    }
}

impl<I> fmt::Debug for ClaimsIdentityProvider<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimsIdentityProvider")
            .field("subject_claim", &self.subject_claim)
            .field("client_claim", &self.client_claim)
            .field("cache", &self.cache)
            .finish()
    }
}

impl<F, I> fmt::Debug for FnIdentityProvider<F, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnIdentityProvider")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl<I: Identity> fmt::Debug for PredictableIdentityProvider<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredictableIdentityProvider")
            .field("identity", &self.identity.unique_identifier())
            .finish()
    }
}
