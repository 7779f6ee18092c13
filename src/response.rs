//! `ResponseMeta`: status, headers, and content-length accounting for the
//! response half of an [`Exchange`](crate::channel::Exchange).
//!
//! Grounded on this crate's `status_only`/`header_too_large`/`bad_request`
//! minimal-response helpers (teacher's `h1/dispatcher.rs::status_only` and
//! `response.rs`), generalized from a fixed `Once<Bytes>` body type to the
//! headers-only metadata [`OutputPipeline`](crate::output::OutputPipeline)
//! commits before any body bytes are known.

use http::{HeaderMap, HeaderValue, StatusCode, Version, header};

use crate::body::BodySize;

/// status, headers, and declared body size of a response. Headers and
/// status are mutable until commit (Invariant 1), after which they are
/// frozen; further mutation attempts are simply ignored.
#[derive(Debug)]
pub struct ResponseMeta {
    status: StatusCode,
    reason: Option<&'static str>,
    headers: HeaderMap,
    size: BodySize,
    frozen: bool,
}

impl ResponseMeta {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            reason: None,
            headers: HeaderMap::new(),
            size: BodySize::None,
            frozen: false,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> Option<&'static str> {
        self.reason
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> Option<&mut HeaderMap> {
        if self.frozen { None } else { Some(&mut self.headers) }
    }

    pub fn set_status(&mut self, status: StatusCode) {
        if !self.frozen {
            self.status = status;
        }
    }

    pub fn set_reason(&mut self, reason: &'static str) {
        if !self.frozen {
            self.reason = Some(reason);
        }
    }

    pub fn set_size(&mut self, size: BodySize) {
        if !self.frozen {
            self.size = size;
        }
    }

    pub fn size(&self) -> BodySize {
        self.size
    }

    /// declared `Content-Length`, if the body size is `Sized` (used by
    /// Invariant 4/Property P4's content-length check at completion).
    pub fn declared_content_length(&self) -> Option<u64> {
        match self.size {
            BodySize::Sized(n) => Some(n as u64),
            _ => None,
        }
    }

    /// irrevocable: headers/status become immutable. called exactly once,
    /// by `OutputPipeline` on the first successful commit.
    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// body forbidden regardless of buffered content (spec.md §6).
    pub fn forbids_body(&self, is_head: bool) -> bool {
        is_head
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
            || self.status.is_informational()
    }

    /// rewrite the persistence-related headers at completion when the
    /// request body was not fully drained (spec.md §6, Property P7).
    pub fn apply_non_persistent(&mut self, version: Version) {
        if self.frozen {
            return;
        }
        match version {
            Version::HTTP_10 => {
                if let Some(values) = self.headers.get_all(header::CONNECTION).iter().next() {
                    if values.as_bytes().eq_ignore_ascii_case(b"keep-alive") {
                        self.headers.remove(header::CONNECTION);
                    }
                }
            }
            _ => {
                self.headers
                    .insert(header::CONNECTION, HeaderValue::from_static("close"));
            }
        }
    }
}

impl Default for ResponseMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// a status-only `ResponseMeta` with no headers beyond what the transport
/// adds; used for synthetic responses in the error pipeline (spec.md §4.5).
pub fn status_only(status: StatusCode) -> ResponseMeta {
    let mut meta = ResponseMeta::new();
    meta.set_status(status);
    meta.set_size(BodySize::Sized(0));
    meta
}

pub fn bad_request() -> ResponseMeta {
    status_only(StatusCode::BAD_REQUEST)
}

pub fn header_too_large() -> ResponseMeta {
    status_only(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
}
