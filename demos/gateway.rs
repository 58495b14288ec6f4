//! An inbound gateway admitting requests through a leaky bucket.
//!
//! Every caller gets a 40-request bucket draining 2 per second. Paths under
//! `/test` use a slower-draining policy with a different header prefix, and
//! resolve callers through a separate identity provider so that each caller
//! has a second, independent bucket there. Time is simulated with a
//! `MockClock` so the decay is visible without waiting.
//!
//! Run with: cargo run --example gateway

use http::{Request, StatusCode};
use leaky_gate::{
    Admission, AdmissionGate, ConfigurationProvider, LeakyBucket, LeakyBucketPolicy, MockClock,
    RemoteAddr, RemoteAddrIdentityProvider,
};
use std::net::SocketAddr;
use std::time::Duration;

type Gate = AdmissionGate<Request<()>, LeakyBucket<MockClock>>;

/// Build the gate used by the demo.
pub fn gateway(clock: MockClock) -> Gate {
    let config = ConfigurationProvider::<Request<()>>::builder()
        .default_policy(
            LeakyBucketPolicy::new(40, Duration::from_secs(1), 2)
                .enable_headers(true)
                .header_prefix("X-TEST-"),
        )
        .route_with_provider(
            |r| r.path("/test"),
            LeakyBucketPolicy::new(40, Duration::from_secs(2), 4)
                .enable_headers(true)
                .header_prefix("X-TEST2-"),
            // Identities belong to their provider: a provider of its own gives
            // every caller a separate bucket for /test.
            RemoteAddrIdentityProvider::new(),
        )
        .default_identity_provider(RemoteAddrIdentityProvider::new())
        .build();

    AdmissionGate::with_strategy(config, LeakyBucket::with_clock(clock))
}

fn request(path: &str, peer: SocketAddr) -> Request<()> {
    let mut req = Request::get(path)
        .body(())
        .expect("static request parts are valid");
    req.extensions_mut().insert(RemoteAddr(peer));
    req
}

/// Answer a request the way an HTTP server would.
fn handle(gate: &Gate, req: &Request<()>) -> (StatusCode, Vec<(String, String)>) {
    let admission = match gate.admit(req) {
        Ok(admission) => admission,
        Err(err) => {
            println!("  configuration error: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new());
        }
    };

    let status = match admission {
        Admission::Rejected { .. } => StatusCode::TOO_MANY_REQUESTS,
        Admission::Admitted { .. } | Admission::Unconfigured => StatusCode::OK,
    };
    let headers = admission
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        value.to_str().unwrap_or_default().to_string(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    (status, headers)
}

fn main() {
    let clock = MockClock::default();
    let gate = gateway(clock.clone());
    let alice: SocketAddr = "203.0.113.5:40000".parse().expect("valid address");
    let bob: SocketAddr = "198.51.100.9:40000".parse().expect("valid address");

    println!("--- Burst from one caller on / ---");
    let mut rejected = 0;
    for i in 1..=45 {
        let (status, headers) = handle(&gate, &request("/", alice));
        if status == StatusCode::TOO_MANY_REQUESTS {
            rejected += 1;
        }
        if i % 10 == 0 || i > 38 {
            let remaining = headers
                .iter()
                .find(|(name, _)| name.ends_with("ratelimit-remaining"))
                .map(|(_, value)| value.as_str())
                .unwrap_or("-");
            println!("request {i:>2}: {status} (remaining {remaining})");
        }
    }
    println!("{rejected} requests rejected");

    println!("\n--- Another caller is unaffected ---");
    let (status, headers) = handle(&gate, &request("/", bob));
    println!("bob: {status}");
    for (name, value) in headers {
        println!("  {name}: {value}");
    }

    println!("\n--- /test has its own provider, so its own bucket ---");
    let (status, headers) = handle(&gate, &request("/test/items", alice));
    println!("alice on /test/items: {status}");
    for (name, value) in headers {
        println!("  {name}: {value}");
    }

    println!("\n--- Five seconds later ---");
    clock.advance(Duration::from_secs(5));
    let (status, headers) = handle(&gate, &request("/", alice));
    println!("alice on /: {status}");
    for (name, value) in headers {
        println!("  {name}: {value}");
    }
}
