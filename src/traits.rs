//! External collaborator interfaces (spec.md §6): `Transport`, `Endpoint`,
//! `Executor`, `Scheduler`, `Server`, `ErrorHandler`.
//!
//! Grounded on the teacher's `xitca-service::Service<Req>` seam, but made
//! `dyn`-safe and synchronous rather than `Future`-returning: this crate's
//! [`Channel`](crate::channel::Channel) is a `Runnable` driven by a thread
//! pool (spec.md §4.4/§5), not a single-connection coroutine, so its
//! collaborators are plain callback-shaped traits an executor thread calls
//! directly. `Server::handle`/`handle_async` may themselves block or spawn
//! further work; they are not async fns.

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

use crate::channel::Channel;
use crate::request::RequestMeta;
use crate::response::ResponseMeta;

/// sink for response bytes and terminal signals, implemented by the
/// protocol-specific byte encoder (HTTP/1.x, HTTP/2, HTTP/3 -- out of scope
/// here, spec.md §1). `response` is non-null only on the call that performs
/// the commit.
pub trait Transport: Send + Sync {
    /// send a chunk, optionally carrying the commit metadata. `callback` is
    /// invoked once the bytes are confirmed written (or failed).
    fn send(
        &self,
        request: &RequestMeta,
        response: Option<&ResponseMeta>,
        chunk: Bytes,
        last: bool,
        callback: Box<dyn FnOnce(Result<usize, Box<dyn StdError + Send + Sync>>) + Send>,
    );

    /// terminal cancellation: tell the transport to drop the connection.
    /// idempotent from the transport's side (Property P3).
    fn abort(&self, err: &(dyn StdError + Send + Sync));

    /// fired once, after the exchange's `Terminated` action has been
    /// handled and the channel is about to recycle.
    fn on_completed(&self);
}

/// the socket-level abstraction a [`Channel`] sits on top of.
pub trait Endpoint: Send + Sync {
    fn idle_timeout(&self) -> Duration;
    fn set_idle_timeout(&self, timeout: Duration);
    fn is_open(&self) -> bool;
    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// reschedules the channel loop onto a worker thread (spec.md §5: "parallel
/// threads cooperating through the StateMachine as the single mutex").
pub trait Executor: Send + Sync {
    fn execute(&self, channel: std::sync::Arc<Channel>);
}

/// one-shot timers for async-suspend timeouts.
pub trait Scheduler: Send + Sync {
    /// schedule `callback` to run after `delay`; returns a handle that
    /// cancels the timer when dropped or explicitly cancelled.
    fn schedule(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> Box<dyn TimerHandle>;
}

/// a pending one-shot timer.
pub trait TimerHandle: Send {
    fn cancel(&self);
}

/// the application's synchronous handler entry points.
pub trait Server: Send + Sync {
    /// initial dispatch of a parsed request.
    fn handle(&self, channel: &Channel);
    /// resumption of a previously-suspended (`startAsync`) exchange,
    /// possibly on a different thread than `handle` ran on.
    fn handle_async(&self, channel: &Channel);
}

/// optional error-page dispatcher consulted by the ErrorPipeline (spec.md §4.5).
pub trait ErrorHandler: Send + Sync {
    /// whether this handler wants to render a page for the given method
    /// (some methods, e.g. HEAD, forbid a body regardless).
    fn error_page_for_method(&self, method: &Method) -> bool;

    /// render an error page body for a dispatched `SendError`/`abort`.
    fn handle(&self, status: StatusCode, request: &RequestMeta) -> Bytes;

    /// body for a parser-level bad message, before a full `RequestMeta` exists.
    fn bad_message_error(&self, status: StatusCode, reason: &str, out_headers: &mut HeaderMap) -> Bytes;
}
