//! Leaky bucket admission control with per-client identities.
//!
//! For each request the [`AdmissionGate`] resolves which policy applies, who
//! the caller is, and whether the caller's bucket has room:
//!
//! 1. [`ConfigurationProvider`] picks at most one [`LeakyBucketPolicy`] for
//!    the request. No matching policy means the request is admitted.
//! 2. An [`IdentityProvider`] maps the request to the caller's identity,
//!    creating it on first sight.
//! 3. The [`LeakyBucket`] strategy drains the caller's bucket for the time
//!    that passed, then admits and charges the request, or rejects it.
//!
//! # Features
//!
//! - **Predicate-matched policies**: arbitrary closures or host / method /
//!   path routes select a policy; overlapping matches are reported as
//!   [`RateLimitError::ConfigurationConflict`] instead of being silently
//!   resolved by order
//! - **One bucket per caller**: identities are cached per provider with atomic
//!   get-or-insert, optionally bounded and periodically cleaned up
//! - **Per-caller locking**: decay, check and charge for one caller happen
//!   atomically without serialising unrelated callers
//! - **Fail open**: missing configuration never blocks traffic
//! - **Diagnostic headers**: `X-RateLimit-Remaining` and friends, per policy
//! - **reqwest middleware**: [`RateLimitMiddleware`] gates outbound requests
//!
//! # Policy Matching
//!
//! Every binding's predicate is evaluated for every request, and bindings
//! must not overlap. Catch-all limits belong in the default policy:
//!
//! ```rust
//! use leaky_gate::{
//!     Admission, AdmissionGate, ConfigurationProvider, LeakyBucketPolicy,
//!     RemoteAddrIdentityProvider,
//! };
//! use std::time::Duration;
//!
//! type Req = http::Request<()>;
//!
//! let config = ConfigurationProvider::<Req>::builder()
//!     // 40 requests, draining 2 per second
//!     .default_policy(
//!         LeakyBucketPolicy::new(40, Duration::from_secs(1), 2).enable_headers(true),
//!     )
//!     // /test drains more slowly, and its own provider gives every caller a
//!     // separate bucket there
//!     .route_with_provider(
//!         |r| r.path("/test"),
//!         LeakyBucketPolicy::new(40, Duration::from_secs(2), 4),
//!         RemoteAddrIdentityProvider::new(),
//!     )
//!     .default_identity_provider(RemoteAddrIdentityProvider::new())
//!     .build();
//!
//! let gate = AdmissionGate::new(config);
//! let request = http::Request::get("/").body(()).unwrap();
//!
//! match gate.admit(&request).unwrap() {
//!     Admission::Admitted { headers } => {
//!         assert_eq!(headers["X-RateLimit-Remaining"], "39");
//!     }
//!     Admission::Rejected { .. } => { /* answer 429 Too Many Requests */ }
//!     Admission::Unconfigured => { /* no policy applies */ }
//! }
//! ```
//!
//! # Decay
//!
//! A bucket drains `leak_amount` units for every whole `leak_rate` elapsed
//! since its last leak, never below zero, and the leak clock restarts at the
//! moment of each leak. The first check on a new identity only starts the
//! clock.

mod clock;
mod config;
mod context;
mod error;
mod gate;
pub mod headers;
mod identity;
mod leaky_bucket;
mod middleware;
mod policy;
mod provider;
mod strategy;

// Public re-exports
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{
    ConfigurationBuilder, ConfigurationProvider, PolicyBinding, Predicate, Resolution,
    RouteMatcher, SharedIdentityProvider,
};
pub use context::{Claims, OutboundRequest, RemoteAddr, RequestContext};
pub use error::RateLimitError;
pub use gate::{Admission, AdmissionGate};
pub use identity::{BucketState, Identity, IdentityCache, LeakyBucketIdentity};
pub use leaky_bucket::LeakyBucket;
pub use middleware::RateLimitMiddleware;
pub use policy::{DEFAULT_HEADER_PREFIX, LeakyBucketPolicy};
pub use provider::{
    CLIENT_ID_CLAIM, ClaimsIdentityProvider, FnIdentityProvider, IdentityProvider,
    PredictableIdentityProvider, RemoteAddrIdentityProvider, SUBJECT_CLAIM, UNKNOWN_CLAIM,
};
pub use strategy::{Acquired, RateLimitStrategy};
