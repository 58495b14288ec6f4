//! Concurrency behaviour of identity resolution and admission.

use http::{Method, Request};
use leaky_gate::{
    AdmissionGate, ConfigurationProvider, FnIdentityProvider, IdentityCache, IdentityProvider,
    LeakyBucketIdentity, LeakyBucketPolicy, PredictableIdentityProvider, RateLimitError,
    RemoteAddr, RemoteAddrIdentityProvider, RequestContext,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const THREADS: usize = 16;

fn request_from(addr: &str) -> Request<()> {
    let mut req = Request::get("/").body(()).unwrap();
    req.extensions_mut()
        .insert(RemoteAddr(addr.parse::<SocketAddr>().unwrap()));
    req
}

// =============================================================================
// Identity Resolution
// =============================================================================

#[test]
fn test_concurrent_first_resolution_yields_one_identity() {
    let provider = Arc::new(RemoteAddrIdentityProvider::<LeakyBucketIdentity>::new());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let provider = Arc::clone(&provider);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let req = request_from("192.0.2.10:443");
                barrier.wait();
                provider.resolve(&req)
            })
        })
        .collect();

    let identities: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let first = &identities[0];
    assert!(identities.iter().all(|identity| Arc::ptr_eq(first, identity)));
    assert_eq!(provider.cache().len(), 1);
}

#[test]
fn test_concurrent_distinct_keys_get_distinct_identities() {
    let cache = Arc::new(IdentityCache::<LeakyBucketIdentity>::new());

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for _ in 0..100 {
                    cache.get_or_insert(&format!("client-{i}"));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.len(), THREADS);
}

// =============================================================================
// Admission
// =============================================================================

#[test]
fn test_concurrent_admission_never_over_admits() {
    let config = ConfigurationProvider::<Request<()>>::builder()
        .default_policy(LeakyBucketPolicy::new(25, Duration::from_secs(3600), 1))
        .default_identity_provider(PredictableIdentityProvider::from_key("shared"))
        .build();
    let gate = AdmissionGate::new(config);
    let admitted = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let gate = gate.clone();
            let admitted = Arc::clone(&admitted);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let req = Request::get("/").body(()).unwrap();
                barrier.wait();
                for _ in 0..10 {
                    if gate.admit(&req).unwrap().is_allowed() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 25);
}

#[test]
fn test_callers_do_not_share_allowance_under_load() {
    let config = ConfigurationProvider::<Request<()>>::builder()
        .default_policy(LeakyBucketPolicy::new(5, Duration::from_secs(3600), 1))
        .default_identity_provider(RemoteAddrIdentityProvider::new())
        .build();
    let gate = AdmissionGate::new(config);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let gate = gate.clone();
            thread::spawn(move || {
                let req = request_from(&format!("198.51.100.{i}:1000"));
                (0..20)
                    .filter(|_| gate.admit(&req).unwrap().is_allowed())
                    .count()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 5);
    }
}

// =============================================================================
// Configuration Conflicts
// =============================================================================

#[test]
fn test_overlapping_bindings_always_conflict() {
    let config = ConfigurationProvider::<Request<()>>::builder()
        .bind(
            |req: &Request<()>| req.uri().path().starts_with("/api"),
            LeakyBucketPolicy::new(10, Duration::from_secs(1), 1),
        )
        .bind(
            |req: &Request<()>| *req.method() == Method::GET,
            LeakyBucketPolicy::new(20, Duration::from_secs(1), 1),
        )
        .default_identity_provider(FnIdentityProvider::new(|req: &Request<()>| {
            RequestContext::path(req).to_string()
        }))
        .build();
    let gate = AdmissionGate::new(config);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let gate = gate.clone();
            thread::spawn(move || {
                let req = Request::get("/api/books").body(()).unwrap();
                gate.admit(&req)
            })
        })
        .collect();

    for handle in handles {
        match handle.join().unwrap() {
            Err(RateLimitError::ConfigurationConflict { matched }) => {
                assert_eq!(matched, vec![0, 1]);
            }
            other => panic!("expected a conflict, got {other:?}"),
        }
    }

    // Requests matching a single binding are unaffected.
    let post = Request::post("/api/books").body(()).unwrap();
    assert!(gate.admit(&post).unwrap().is_allowed());
    let get = Request::get("/health").body(()).unwrap();
    assert!(gate.admit(&get).unwrap().is_allowed());
}
