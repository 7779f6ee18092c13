//! `OutputPipeline` (C3): commit-once response header emission, chunk
//! emission, and write-completion accounting.
//!
//! Grounded on `h1/dispatcher.rs`'s response-encoding path (the commit-then-
//! stream sequencing) and `response.rs`'s `ResponseBody` framing decision;
//! generalized from a direct `AsyncWrite` split to callback-based `Transport`
//! sends so a write completion can arrive on any executor thread (spec.md §5).

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::StatusCode;

use crate::channel::Exchange;
use crate::date::DateSource;
use crate::error::ChannelError;
use crate::listener::{Phase, PhaseQueue};
use crate::response::ResponseMeta;
use crate::state::StateMachine;
use crate::traits::Transport;

struct Inner {
    response: ResponseMeta,
    /// declared content length snapshotted at commit time, used by the
    /// content-length check at completion (spec.md §4.3).
    declared_length: Option<u64>,
    /// set the first time the handler touches status, reason, size, or
    /// headers. Distinct from `OutputState::Open` -- a suspended exchange
    /// that set a status and later completes without ever writing a byte
    /// is handled but still uncommitted (spec.md §4.4 `Complete`'s
    /// "uncommitted and unhandled" default-404 check).
    handled: bool,
}

/// manages response commit, chunk emission, and write-completion
/// bookkeeping for a single exchange. Holds no transport reference itself --
/// every send takes the transport and request explicitly, mirroring the
/// teacher's `send(ctx, ...)` call shape.
pub struct OutputPipeline {
    inner: Mutex<Inner>,
    /// Response* phases raised by `write` are queued here rather than fired
    /// directly, since `write` may run synchronously inside a dispatch --
    /// see `Exchange::drain_phase_queue` (spec.md §4.6).
    phase_queue: Arc<PhaseQueue>,
    date_source: Option<Arc<dyn DateSource>>,
    set_date_header: bool,
}

impl OutputPipeline {
    pub fn new(phase_queue: Arc<PhaseQueue>, date_source: Option<Arc<dyn DateSource>>, set_date_header: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                response: ResponseMeta::new(),
                declared_length: None,
                handled: false,
            }),
            phase_queue,
            date_source,
            set_date_header,
        }
    }

    pub fn set_status(&self, status: StatusCode) {
        let mut inner = self.inner.lock().unwrap();
        inner.response.set_status(status);
        inner.handled = true;
    }

    pub fn set_reason(&self, reason: &'static str) {
        let mut inner = self.inner.lock().unwrap();
        inner.response.set_reason(reason);
        inner.handled = true;
    }

    pub fn set_size(&self, size: crate::body::BodySize) {
        let mut inner = self.inner.lock().unwrap();
        inner.response.set_size(size);
        inner.handled = true;
    }

    pub fn with_headers_mut<F, O>(&self, f: F) -> Option<O>
    where
        F: FnOnce(&mut http::HeaderMap) -> O,
    {
        let mut inner = self.inner.lock().unwrap();
        let result = inner.response.headers_mut().map(f);
        if result.is_some() {
            inner.handled = true;
        }
        result
    }

    pub fn status(&self) -> StatusCode {
        self.inner.lock().unwrap().response.status()
    }

    /// whether the handler has touched status, reason, size, or headers --
    /// independent of whether anything has been written yet.
    pub fn is_handled(&self) -> bool {
        self.inner.lock().unwrap().handled
    }

    /// non-blocking chunk write. on the first call, triggers commit: the
    /// StateMachine transitions to `Committed`, the `Date:` header is
    /// stamped if configured, headers are snapshotted, and the transport
    /// receives the commit call with non-null response metadata. Subsequent
    /// calls pass `None` for response (spec.md §4.3 step 1). `ResponseBegin`
    /// and the completion phases are queued rather than fired directly,
    /// since `write` commonly runs synchronously inside a dispatch, ahead of
    /// `AfterDispatch` -- see `Exchange::drain_phase_queue`. `exchange` is
    /// cloned into the write-completion callback so it stays alive
    /// regardless of which thread the transport reports completion from.
    pub fn write(
        &self,
        exchange: &Arc<Exchange>,
        transport: &Arc<dyn Transport>,
        chunk: Bytes,
        last: bool,
        callback: Box<dyn FnOnce(Result<(), ChannelError>) + Send>,
    ) {
        let request = exchange.request();
        let is_head = request.is_head();

        let (response_for_commit, forbids_body) = {
            let mut inner = self.inner.lock().unwrap();
            let committing = exchange.state.commit_response();
            if !committing {
                (None, inner.response.forbids_body(is_head))
            } else {
                // the persistence rewrite (spec.md §6/§7, Property P7) must
                // land before headers freeze -- this is the last point a
                // header can still change, since the transport receives
                // them on this same call.
                if exchange.input.had_unread() {
                    inner.response.apply_non_persistent(request.version());
                }
                if self.set_date_header {
                    if let Some(source) = self.date_source.as_ref() {
                        if let Some(headers) = inner.response.headers_mut() {
                            if !headers.contains_key(http::header::DATE) {
                                let value = source.date_value();
                                if let Ok(value) = http::HeaderValue::from_bytes(&value) {
                                    headers.insert(http::header::DATE, value);
                                }
                            }
                        }
                    }
                }
                inner.response.freeze();
                inner.declared_length = inner.response.declared_content_length();
                (Some(snapshot(&inner.response)), inner.response.forbids_body(is_head))
            }
        };

        let committed_now = response_for_commit.is_some();
        if committed_now {
            // queued, not fired directly: `write` may run synchronously
            // inside `Channel::dispatch`, before `AfterDispatch` has fired
            // (spec.md §4.6/§8's canonical ordering).
            self.phase_queue.push(Phase::ResponseBegin);
        }

        let chunk = if forbids_body { Bytes::new() } else { chunk };

        let exchange_cb = exchange.clone();
        let phase_queue = self.phase_queue.clone();
        transport.send(
            &request,
            response_for_commit.as_ref(),
            chunk,
            last,
            Box::new(move |result| {
                let exchange = exchange_cb;
                match result {
                    Ok(n) => {
                        exchange.state.add_bytes_written(n as u64);
                        if committed_now {
                            phase_queue.push(Phase::ResponseCommit);
                        }
                        phase_queue.push(Phase::ResponseContent);
                        if last {
                            exchange.state.complete_response();
                            phase_queue.push(Phase::ResponseEnd);
                        }
                        callback(Ok(()));
                    }
                    Err(e) => {
                        phase_queue.push(Phase::ResponseFailure);
                        callback(Err(ChannelError::Io(Arc::new(std::io::Error::other(e)))));
                    }
                }
            }),
        );
    }

    /// closes the output; if no bytes were ever written, commits an empty
    /// response first (spec.md §4.3 `completeOutput`).
    pub fn complete_output(
        &self,
        exchange: &Arc<Exchange>,
        transport: &Arc<dyn Transport>,
        callback: Box<dyn FnOnce(Result<(), ChannelError>) + Send>,
    ) {
        self.write(exchange, transport, Bytes::new(), true, callback);
    }

    /// legal only while the response is still open; discards any response
    /// metadata mutations made so far is not meaningful here since headers
    /// live directly on `ResponseMeta` -- this resets size accounting only.
    pub fn reset_content(&self, state: &StateMachine) -> bool {
        if !matches!(state.output_state(), crate::state::OutputState::Open) {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.response.set_size(crate::body::BodySize::None);
        true
    }

    pub fn written(&self, state: &StateMachine) -> u64 {
        state.bytes_written()
    }

    /// content-length rule (spec.md §4.3): for non-HEAD, non-304 exchanges,
    /// a declared length that disagrees with bytes actually written is a
    /// hard failure at completion.
    pub fn check_content_length(&self, exchange: &Exchange) -> Result<(), ChannelError> {
        let inner = self.inner.lock().unwrap();
        if exchange.request().is_head() || inner.response.status() == StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        if let Some(declared) = inner.declared_length {
            if declared != exchange.state.bytes_written() {
                return Err(ChannelError::BadMessage("insufficient content written"));
            }
        }
        Ok(())
    }
}

fn snapshot(meta: &ResponseMeta) -> ResponseMeta {
    let mut copy = ResponseMeta::new();
    copy.set_status(meta.status());
    if let Some(reason) = meta.reason() {
        copy.set_reason(reason);
    }
    if let Some(headers) = copy.headers_mut() {
        *headers = meta.headers().clone();
    }
    copy.set_size(meta.size());
    copy
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::listener::ListenerFanout;
    use crate::request::RequestMeta;
    use http::{HeaderMap, Method, Uri, Version};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeTransport;
    impl Transport for FakeTransport {
        fn send(
            &self,
            _request: &RequestMeta,
            _response: Option<&ResponseMeta>,
            chunk: Bytes,
            _last: bool,
            callback: Box<dyn FnOnce(Result<usize, Box<dyn std::error::Error + Send + Sync>>) + Send>,
        ) {
            callback(Ok(chunk.len()));
        }
        fn abort(&self, _err: &(dyn std::error::Error + Send + Sync)) {}
        fn on_completed(&self) {}
    }

    fn req() -> RequestMeta {
        RequestMeta::new(Method::GET, Uri::from_static("/"), Version::HTTP_11, HeaderMap::new(), None)
    }

    #[test]
    fn first_write_commits_and_fires_response_begin() {
        let exchange = Exchange::new(req(), ListenerFanout::default());
        let transport: Arc<dyn Transport> = Arc::new(FakeTransport);

        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        exchange.output.write(
            &exchange,
            &transport,
            Bytes::from_static(b"hello"),
            true,
            Box::new(move |res| {
                assert!(res.is_ok());
                seen2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(exchange.state.bytes_written(), 5);
        assert_eq!(exchange.state.output_state(), crate::state::OutputState::Completed);
    }

    #[test]
    fn content_length_mismatch_is_reported() {
        let exchange = Exchange::new(req(), ListenerFanout::default());
        {
            let mut inner = exchange.output.inner.lock().unwrap();
            inner.response.set_size(crate::body::BodySize::Sized(10));
            inner.declared_length = Some(10);
        }
        exchange.state.add_bytes_written(3);
        assert!(exchange.output.check_content_length(&exchange).is_err());
    }

    #[test]
    fn commit_stamps_date_header_when_configured_and_absent() {
        let source: Arc<dyn crate::date::DateSource> = Arc::new(crate::date::SystemTimeDateTimeHandler);
        let exchange = Exchange::new_with_date_source(req(), ListenerFanout::default(), Some(source), true);
        let transport: Arc<dyn Transport> = Arc::new(FakeTransport);

        exchange.output.write(&exchange, &transport, Bytes::from_static(b"hi"), true, Box::new(|_| {}));

        let inner = exchange.output.inner.lock().unwrap();
        let value = inner.response.headers().get(http::header::DATE).expect("date header set");
        assert!(value.to_str().unwrap().ends_with("GMT"));
    }

    #[test]
    fn commit_leaves_date_header_absent_when_disabled() {
        let exchange = Exchange::new_with_date_source(req(), ListenerFanout::default(), None, true);
        let transport: Arc<dyn Transport> = Arc::new(FakeTransport);

        exchange.output.write(&exchange, &transport, Bytes::from_static(b"hi"), true, Box::new(|_| {}));

        let inner = exchange.output.inner.lock().unwrap();
        assert!(inner.response.headers().get(http::header::DATE).is_none());
    }
}
