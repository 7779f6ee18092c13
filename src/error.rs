//! `ChannelError`/`FailureClass`: the ErrorPipeline's error taxonomy.
//!
//! Grounded on the teacher's three-layer error chain (`ProtoError` ->
//! `h1::Error<S, B>` -> `HttpServiceError<S, B>`), collapsed into one enum.
//! The teacher's layering exists to let each protocol crate (h1/h2/h3) wrap
//! a lower error without knowing about the others; this crate has exactly
//! one channel implementation, so the layering buys nothing and only gets
//! in the way of `FailureClass::classify`'s single dispatch point (spec.md
//! §4.5/§7).

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

use http::StatusCode;
use tracing::{debug, error, warn};

/// how a failure should be handled by the Channel driver (spec.md §7):
/// whether it is logged, whether it produces a synthetic response, and at
/// what level.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FailureClass {
    /// peer went away or the connection was reset; not logged above debug,
    /// never produces a synthetic response (nowhere left to send it).
    Quiet,
    /// malformed request; produces a synthetic 4xx response if the
    /// response has not yet committed.
    BadMessage(StatusCode),
    /// I/O or timeout failure not attributable to the peer's message;
    /// produces a synthetic 5xx if uncommitted, logged at warn.
    Transient,
    /// handler code panicked or returned an error; produces a synthetic
    /// 500 if uncommitted, logged at error.
    Application,
}

impl FailureClass {
    /// the status a synthetic response should carry, or `None` if this
    /// class never produces one (spec.md §4.5 `ErrorPipeline.dispatch`).
    pub fn response_status(self) -> Option<StatusCode> {
        match self {
            Self::Quiet => None,
            Self::BadMessage(status) => Some(status),
            Self::Transient => Some(StatusCode::INTERNAL_SERVER_ERROR),
            Self::Application => Some(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

/// unified channel error. every failure surfaced from parsing, I/O,
/// scheduling, or handler dispatch is converted into one of these before
/// reaching the Channel driver's `handle_exception`.
pub enum ChannelError {
    /// the request line or headers could not be parsed.
    BadMessage(&'static str),
    /// declared or buffered request/response size exceeded a configured
    /// limit.
    TooLarge(&'static str),
    /// the peer closed the connection or reset the stream.
    PeerGone(Arc<io::Error>),
    /// any other I/O failure on the transport.
    Io(Arc<io::Error>),
    /// an async suspension exceeded its timeout (spec.md §4.1 `AsyncTimeout`).
    AsyncTimeout,
    /// the configured keep-alive or request-head timeout elapsed while
    /// idle or mid-request.
    IdleTimeout,
    /// the handler (`Endpoint::handle`/`handle_async`) returned or panicked
    /// with an error.
    Handler(Box<dyn StdError + Send + Sync>),
    /// the state machine observed an illegal transition; indicates a bug
    /// in this crate rather than a protocol or handler failure.
    IllegalState(crate::state::IllegalState),
}

impl fmt::Debug for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMessage(msg) => write!(f, "BadMessage({msg})"),
            Self::TooLarge(what) => write!(f, "TooLarge({what})"),
            Self::PeerGone(e) => write!(f, "PeerGone({e})"),
            Self::Io(e) => write!(f, "Io({e})"),
            Self::AsyncTimeout => write!(f, "AsyncTimeout"),
            Self::IdleTimeout => write!(f, "IdleTimeout"),
            Self::Handler(e) => write!(f, "Handler({e})"),
            Self::IllegalState(e) => write!(f, "IllegalState({e:?})"),
        }
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl StdError for ChannelError {}

impl From<crate::state::IllegalState> for ChannelError {
    fn from(e: crate::state::IllegalState) -> Self {
        Self::IllegalState(e)
    }
}

impl ChannelError {
    pub fn io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => {
                Self::PeerGone(Arc::new(e))
            }
            _ => Self::Io(Arc::new(e)),
        }
    }

    /// classify this error into a [`FailureClass`], the single dispatch
    /// point `ErrorPipeline.dispatch` (spec.md §4.5) uses to decide both
    /// the log level and whether a synthetic response is produced.
    pub fn classify(&self) -> FailureClass {
        match self {
            Self::PeerGone(_) => FailureClass::Quiet,
            Self::BadMessage(_) => FailureClass::BadMessage(StatusCode::BAD_REQUEST),
            Self::TooLarge(_) => FailureClass::BadMessage(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            Self::Io(_) | Self::AsyncTimeout | Self::IdleTimeout => FailureClass::Transient,
            Self::Handler(_) => FailureClass::Application,
            Self::IllegalState(_) => FailureClass::Application,
        }
    }

    /// log this error at the level appropriate to its class, to `target`
    /// (the teacher's `HttpServiceError::log` convention).
    pub fn log(&self, target: &str) {
        match self.classify() {
            FailureClass::Quiet => debug!(target: "xitca_channel::error", parent: None, error = ?self, target, "peer gone"),
            FailureClass::BadMessage(_) => debug!(target: "xitca_channel::error", error = ?self, target, "bad message"),
            FailureClass::Transient => warn!(target: "xitca_channel::error", error = ?self, target, "transient failure"),
            FailureClass::Application => error!(target: "xitca_channel::error", error = ?self, target, "handler failure"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn peer_gone_classifies_quiet_with_no_response() {
        let e = ChannelError::io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(e.classify(), FailureClass::Quiet);
        assert_eq!(e.classify().response_status(), None);
    }

    #[test]
    fn bad_message_classifies_with_400() {
        let e = ChannelError::BadMessage("invalid request line");
        assert_eq!(e.classify().response_status(), Some(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn too_large_classifies_with_431() {
        let e = ChannelError::TooLarge("request headers");
        assert_eq!(
            e.classify().response_status(),
            Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
        );
    }

    #[test]
    fn handler_error_classifies_application_with_500() {
        let e = ChannelError::Handler(Box::new(io::Error::other("boom")));
        assert_eq!(e.classify(), FailureClass::Application);
        assert_eq!(e.classify().response_status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }
}
