//! `RequestMeta`: the immutable (mostly) half of an [`Exchange`](crate::channel::Exchange).
//!
//! Grounded on this crate's own `Request<B>`/`RemoteAddr` wrapper (teacher's
//! `request.rs`), trimmed of the generic body parameter -- the body here
//! lives in [`InputPump`](crate::input::InputPump), not in the request type
//! -- and extended with the arrival timestamp and once-appended trailers
//! spec.md §3 calls for.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use http::{HeaderMap, Method, Uri, Version};

// This type has 8 less bytes in size compared to SocketAddr, which can
// ultimately affect whether RequestMeta is inlined or copied when passed
// around as a handler argument.
/// A simplified version of [`SocketAddr`] where only [`IpAddr`] and `Port` are stored.
#[derive(Debug, Copy, Clone)]
pub struct RemoteAddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl From<SocketAddr> for RemoteAddr {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

/// method, target URI, version, headers, optional trailers, and the arrival
/// timestamp of a single HTTP request. Immutable after `on_request` except
/// for `trailers`, which is appended exactly once.
#[derive(Debug)]
pub struct RequestMeta {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    trailers: Option<HeaderMap>,
    arrived_at: Instant,
    remote_addr: Option<RemoteAddr>,
}

impl RequestMeta {
    pub fn new(method: Method, uri: Uri, version: Version, headers: HeaderMap, remote_addr: Option<RemoteAddr>) -> Self {
        Self {
            method,
            uri,
            version,
            headers,
            trailers: None,
            arrived_at: Instant::now(),
            remote_addr,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// appends trailers once; a second call is ignored rather than
    /// replacing the first (the parser produces at most one `on_trailers`
    /// event per exchange, per spec.md §3).
    pub fn set_trailers(&mut self, trailers: HeaderMap) {
        if self.trailers.is_none() {
            self.trailers = Some(trailers);
        }
    }

    pub fn arrived_at(&self) -> Instant {
        self.arrived_at
    }

    pub fn remote_addr(&self) -> Option<RemoteAddr> {
        self.remote_addr
    }

    /// method forbids a response body regardless of status (spec.md §6).
    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }
}

/// trait for borrowing `&T` out of a foreign request-shaped type; mirrors
/// `BorrowReq` in the teacher crate's `request.rs`/`http.rs`.
pub trait BorrowReq<T> {
    fn borrow_req(&self) -> &T;
}

impl BorrowReq<Uri> for RequestMeta {
    fn borrow_req(&self) -> &Uri {
        &self.uri
    }
}

impl BorrowReq<Method> for RequestMeta {
    fn borrow_req(&self) -> &Method {
        &self.method
    }
}

impl BorrowReq<HeaderMap> for RequestMeta {
    fn borrow_req(&self) -> &HeaderMap {
        &self.headers
    }
}
