//! The per-request view that predicates and identity providers query.
//!
//! The core never depends on a transport. Anything that can answer the
//! [`RequestContext`] questions can be gated: inbound `http::Request`s, their
//! split [`Parts`](http::request::Parts), or outbound `reqwest` requests via
//! [`OutboundRequest`].

use http::{Extensions, HeaderMap, Method, Uri};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// Capabilities the admission core needs from a request.
pub trait RequestContext {
    /// The request method.
    fn method(&self) -> &Method;

    /// The request path, without query string.
    fn path(&self) -> &str;

    /// The target hostname, excluding any port.
    fn host(&self) -> Option<&str>;

    /// The request headers.
    fn headers(&self) -> &HeaderMap;

    /// The address of the connected peer, if the transport recorded one.
    fn remote_addr(&self) -> Option<IpAddr>;

    /// An authenticated claim value (e.g. `sub`), if the caller was authenticated.
    fn claim(&self, name: &str) -> Option<&str>;
}

/// Request extension carrying the peer address of the connection.
///
/// Servers insert this when accepting a request so that address-based
/// identities can be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub SocketAddr);

/// Request extension carrying authenticated claims.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Claims(HashMap<String, String>);

impl Claims {
    /// Create an empty claim set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a claim.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Look up a claim by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Claims {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn host_of<'a>(uri: &'a Uri, headers: &'a HeaderMap) -> Option<&'a str> {
    if let Some(host) = uri.host() {
        return Some(host);
    }
    // Origin-form requests only carry the host in the Host header.
    let value = headers.get(http::header::HOST)?.to_str().ok()?;
    Some(strip_port(value))
}

fn strip_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        // IPv6 literal: keep the brackets, drop a trailing port.
        return match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    }
}

fn remote_addr_of(extensions: &Extensions) -> Option<IpAddr> {
    extensions.get::<RemoteAddr>().map(|addr| addr.0.ip())
}

fn claim_of<'a>(extensions: &'a Extensions, name: &str) -> Option<&'a str> {
    extensions.get::<Claims>().and_then(|claims| claims.get(name))
}

impl<B> RequestContext for http::Request<B> {
    fn method(&self) -> &Method {
        self.method()
    }

    fn path(&self) -> &str {
        self.uri().path()
    }

    fn host(&self) -> Option<&str> {
        host_of(self.uri(), self.headers())
    }

    fn headers(&self) -> &HeaderMap {
        self.headers()
    }

    fn remote_addr(&self) -> Option<IpAddr> {
        remote_addr_of(self.extensions())
    }

    fn claim(&self, name: &str) -> Option<&str> {
        claim_of(self.extensions(), name)
    }
}

impl RequestContext for http::request::Parts {
    fn method(&self) -> &Method {
        &self.method
    }

    fn path(&self) -> &str {
        self.uri.path()
    }

    fn host(&self) -> Option<&str> {
        host_of(&self.uri, &self.headers)
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn remote_addr(&self) -> Option<IpAddr> {
        remote_addr_of(&self.extensions)
    }

    fn claim(&self, name: &str) -> Option<&str> {
        claim_of(&self.extensions, name)
    }
}

/// An outbound `reqwest` request together with the identity-relevant parts of
/// its middleware extensions.
///
/// `reqwest::Request` has no extension slot of its own, so [`RemoteAddr`] and
/// [`Claims`] are copied out of the `reqwest-middleware` extensions. The
/// request is held by value and handed back with
/// [`into_request`](Self::into_request) once the admission decision is made.
#[derive(Debug)]
pub struct OutboundRequest {
    request: reqwest::Request,
    remote_addr: Option<RemoteAddr>,
    claims: Option<Claims>,
}

impl OutboundRequest {
    /// Wrap `request`, copying identity data from `extensions`.
    pub fn new(request: reqwest::Request, extensions: &Extensions) -> Self {
        Self {
            request,
            remote_addr: extensions.get::<RemoteAddr>().copied(),
            claims: extensions.get::<Claims>().cloned(),
        }
    }

    /// The wrapped request.
    pub fn request(&self) -> &reqwest::Request {
        &self.request
    }

    /// Unwrap the request.
    pub fn into_request(self) -> reqwest::Request {
        self.request
    }
}

impl RequestContext for OutboundRequest {
    fn method(&self) -> &Method {
        self.request.method()
    }

    fn path(&self) -> &str {
        self.request.url().path()
    }

    fn host(&self) -> Option<&str> {
        self.request.url().host_str()
    }

    fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr.map(|addr| addr.0.ip())
    }

    fn claim(&self, name: &str) -> Option<&str> {
        self.claims.as_ref().and_then(|claims| claims.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_request_context() {
        let addr: SocketAddr = "10.0.0.7:5555".parse().unwrap();
        let mut req = http::Request::builder()
            .method(Method::POST)
            .uri("/order/123?x=1")
            .header(http::header::HOST, "api.example.com:8443")
            .body(())
            .unwrap();
        req.extensions_mut().insert(RemoteAddr(addr));
        req.extensions_mut().insert(Claims::new().with("sub", "alice"));

        assert_eq!(RequestContext::method(&req), Method::POST);
        assert_eq!(RequestContext::path(&req), "/order/123");
        assert_eq!(RequestContext::host(&req), Some("api.example.com"));
        assert_eq!(RequestContext::remote_addr(&req), Some(addr.ip()));
        assert_eq!(req.claim("sub"), Some("alice"));
        assert_eq!(req.claim("client_id"), None);
    }

    #[test]
    fn test_absolute_uri_host_wins() {
        let req = http::Request::get("https://api.example.com:8443/x")
            .body(())
            .unwrap();
        assert_eq!(RequestContext::host(&req), Some("api.example.com"));
        assert_eq!(RequestContext::remote_addr(&req), None);
    }

    #[test]
    fn test_parts_context() {
        let (parts, ()) = http::Request::get("/health")
            .header(http::header::HOST, "[::1]:8080")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(RequestContext::path(&parts), "/health");
        assert_eq!(RequestContext::host(&parts), Some("[::1]"));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("example.com:80"), "example.com");
        assert_eq!(strip_port("[::1]:80"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }

    #[test]
    fn test_outbound_request_context() {
        let req = reqwest::Client::new()
            .get("https://api.example.com:8443/book")
            .build()
            .unwrap();
        let mut extensions = Extensions::new();
        extensions.insert(Claims::from_iter([("sub", "bob"), ("client_id", "cli")]));

        let ctx = OutboundRequest::new(req, &extensions);
        assert_eq!(ctx.host(), Some("api.example.com"));
        assert_eq!(ctx.path(), "/book");
        assert_eq!(ctx.claim("client_id"), Some("cli"));
        assert_eq!(ctx.remote_addr(), None);
        assert_eq!(ctx.into_request().url().port(), Some(8443));
    }
}
