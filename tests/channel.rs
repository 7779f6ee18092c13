//! End-to-end exchange scenarios driving `Channel` against fake
//! collaborators -- no real transport, parser, or runtime involved.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version, header};

use xitca_channel::body::BodySize;
use xitca_channel::channel::Channel;
use xitca_channel::date::{DateSource, SystemTimeDateTimeHandler};
use xitca_channel::error::ChannelError;
use xitca_channel::listener::{Listener, ListenerFanout, Phase};
use xitca_channel::request::RequestMeta;
use xitca_channel::response::ResponseMeta;
use xitca_channel::traits::{Endpoint, ErrorHandler, Executor, Scheduler, Server, TimerHandle, Transport};

struct RecordingTransport {
    sent: Mutex<Vec<(StatusCode, Bytes, HeaderMap)>>,
    completed: AtomicBool,
    aborted: AtomicBool,
}

impl RecordingTransport {
    fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        }
    }
}

impl Transport for RecordingTransport {
    fn send(
        &self,
        _request: &RequestMeta,
        response: Option<&ResponseMeta>,
        chunk: Bytes,
        _last: bool,
        callback: Box<dyn FnOnce(Result<usize, Box<dyn std::error::Error + Send + Sync>>) + Send>,
    ) {
        if let Some(r) = response {
            self.sent.lock().unwrap().push((r.status(), chunk.clone(), r.headers().clone()));
        }
        callback(Ok(chunk.len()));
    }

    fn abort(&self, _err: &(dyn std::error::Error + Send + Sync)) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn on_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }
}

struct FixedEndpoint;
impl Endpoint for FixedEndpoint {
    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }
    fn set_idle_timeout(&self, _timeout: Duration) {}
    fn is_open(&self) -> bool {
        true
    }
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// runs the channel inline on the calling thread, as if a single-threaded
/// executor serviced every reschedule synchronously.
struct InlineExecutor;
impl Executor for InlineExecutor {
    fn execute(&self, channel: Arc<Channel>) {
        channel.run();
    }
}

/// never actually fires; `async_complete` is called directly in tests that
/// simulate the timer/listener resuming the exchange.
struct NoopScheduler;
impl Scheduler for NoopScheduler {
    fn schedule(&self, _delay: Duration, callback: Box<dyn FnOnce() + Send>) -> Box<dyn TimerHandle> {
        struct Noop(#[allow(dead_code)] Option<Box<dyn FnOnce() + Send>>);
        impl TimerHandle for Noop {
            fn cancel(&self) {}
        }
        Box::new(Noop(Some(callback)))
    }
}

#[derive(Default)]
struct RecordingListener {
    phases: Mutex<Vec<Phase>>,
}
impl Listener for RecordingListener {
    fn on_phase(&self, phase: Phase, _request: Option<&RequestMeta>) {
        self.phases.lock().unwrap().push(phase);
    }
}

struct EchoServer;
impl Server for EchoServer {
    fn handle(&self, channel: &Channel) {
        let exchange = channel.exchange().unwrap();
        exchange.input.eof();
        exchange.output.set_status(StatusCode::OK);
        exchange.output.set_size(BodySize::Sized(5));
        let transport = channel.transport();
        exchange.output.write(
            &exchange,
            &transport,
            Bytes::from_static(b"hello"),
            true,
            Box::new(|_| {}),
        );
    }
    fn handle_async(&self, _channel: &Channel) {}
}

struct SilentServer;
impl Server for SilentServer {
    fn handle(&self, channel: &Channel) {
        channel.exchange().unwrap().input.eof();
    }
    fn handle_async(&self, _channel: &Channel) {}
}

struct PanickingServer;
impl Server for PanickingServer {
    fn handle(&self, channel: &Channel) {
        channel.exchange().unwrap().input.eof();
        panic!("boom");
    }
    fn handle_async(&self, _channel: &Channel) {}
}

/// calls `startAsync` and returns without writing; the test drives
/// resumption explicitly via `Channel::async_complete`.
struct SuspendingServer;
impl Server for SuspendingServer {
    fn handle(&self, channel: &Channel) {
        let exchange = channel.exchange().unwrap();
        exchange.input.eof();
        exchange.output.set_status(StatusCode::OK);
        exchange.output.set_size(BodySize::Sized(0));
        channel.start_async(&exchange).unwrap();
    }
    fn handle_async(&self, _channel: &Channel) {}
}

/// writes a short response while leaving 1 KB of the request body unread.
struct ShortReplyIgnoringBodyServer;
impl Server for ShortReplyIgnoringBodyServer {
    fn handle(&self, channel: &Channel) {
        let exchange = channel.exchange().unwrap();
        exchange.input.on_content(Bytes::from(vec![0u8; 1024]), true);
        exchange.output.set_status(StatusCode::OK);
        exchange.output.set_size(BodySize::Sized(2));
        let transport = channel.transport();
        exchange.output.write(
            &exchange,
            &transport,
            Bytes::from_static(b"ok"),
            true,
            Box::new(|_| {}),
        );
    }
    fn handle_async(&self, _channel: &Channel) {}
}

struct BodyEchoErrorHandler;
impl ErrorHandler for BodyEchoErrorHandler {
    fn error_page_for_method(&self, _method: &Method) -> bool {
        true
    }
    fn handle(&self, status: StatusCode, _request: &RequestMeta) -> Bytes {
        Bytes::from(format!("error {status}"))
    }
    fn bad_message_error(&self, status: StatusCode, reason: &str, _out_headers: &mut HeaderMap) -> Bytes {
        Bytes::from(format!("{status} {reason}"))
    }
}

fn req() -> RequestMeta {
    RequestMeta::new(
        Method::GET,
        Uri::from_static("/x"),
        Version::HTTP_11,
        HeaderMap::new(),
        None,
    )
}

fn make_channel(
    server: Arc<dyn Server>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
) -> (Arc<Channel>, Arc<RecordingTransport>, Arc<RecordingListener>) {
    let transport = Arc::new(RecordingTransport::new());
    let listener = Arc::new(RecordingListener::default());
    let channel = Channel::new(
        transport.clone(),
        Arc::new(FixedEndpoint),
        Arc::new(InlineExecutor),
        Arc::new(NoopScheduler),
        server,
        error_handler,
        Duration::from_secs(30),
    );
    (channel, transport, listener)
}

#[test]
fn scenario_1_simple_200_with_full_listener_order() {
    let (channel, transport, listener) = make_channel(Arc::new(EchoServer), None);
    let fanout = ListenerFanout::new(vec![listener.clone()]);
    channel.on_request(req(), fanout);

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, StatusCode::OK);
    assert_eq!(&sent[0].1[..], b"hello");
    assert!(transport.completed.load(Ordering::SeqCst));

    let phases = listener.phases.lock().unwrap();
    assert_eq!(
        &phases[..],
        &[
            Phase::RequestBegin,
            Phase::BeforeDispatch,
            Phase::AfterDispatch,
            Phase::RequestEnd,
            Phase::ResponseBegin,
            Phase::ResponseCommit,
            Phase::ResponseContent,
            Phase::ResponseEnd,
            Phase::Complete,
        ]
    );
}

#[test]
fn scenario_2_handler_panic_yields_500_and_dispatch_failure() {
    let (channel, transport, listener) = make_channel(Arc::new(PanickingServer), None);
    let fanout = ListenerFanout::new(vec![listener.clone()]);
    channel.on_request(req(), fanout);

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(transport.completed.load(Ordering::SeqCst));
    assert!(!transport.aborted.load(Ordering::SeqCst));

    let phases = listener.phases.lock().unwrap();
    assert!(phases.contains(&Phase::DispatchFailure));
    assert!(phases.contains(&Phase::Complete));
}

#[test]
fn scenario_3_silent_handler_yields_404_on_complete() {
    let (channel, transport, _listener) = make_channel(Arc::new(SilentServer), None);
    channel.on_request(req(), ListenerFanout::default());

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, StatusCode::NOT_FOUND);
}

#[test]
fn scenario_4_async_suspend_then_timer_driven_complete() {
    let (channel, transport, listener) = make_channel(Arc::new(SuspendingServer), None);
    let fanout = ListenerFanout::new(vec![listener.clone()]);
    channel.on_request(req(), fanout);

    // handler suspended; nothing sent yet, exchange not recycled.
    assert!(transport.sent.lock().unwrap().is_empty());
    assert!(channel.exchange().is_some());

    // 30s later, a timer/listener resumes the suspended exchange.
    let exchange = channel.exchange().unwrap();
    channel.async_complete(&exchange).unwrap();

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, StatusCode::OK);
    assert!(sent[0].1.is_empty());
    assert!(transport.completed.load(Ordering::SeqCst));
}

#[test]
fn scenario_5_unread_body_forces_connection_close() {
    let (channel, transport, _listener) = make_channel(Arc::new(ShortReplyIgnoringBodyServer), None);
    channel.on_request(req(), ListenerFanout::default());

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, StatusCode::OK);
    assert_eq!(&sent[0].1[..], b"ok");
    let connection = sent[0].2.get(header::CONNECTION).expect("connection header set");
    assert_eq!(connection, HeaderValue::from_static("close"));
}

#[test]
fn short_reply_ignoring_body_fires_request_content_phases_before_after_dispatch() {
    let (channel, _transport, listener) = make_channel(Arc::new(ShortReplyIgnoringBodyServer), None);
    let fanout = ListenerFanout::new(vec![listener.clone()]);
    channel.on_request(req(), fanout);

    let phases = listener.phases.lock().unwrap();
    assert_eq!(
        &phases[..],
        &[
            Phase::RequestBegin,
            Phase::BeforeDispatch,
            Phase::AfterDispatch,
            Phase::RequestContent,
            Phase::RequestContentEnd,
            Phase::ResponseBegin,
            Phase::ResponseCommit,
            Phase::ResponseContent,
            Phase::ResponseEnd,
            Phase::Complete,
        ]
    );
}

struct TrailerServer;
impl Server for TrailerServer {
    fn handle(&self, channel: &Channel) {
        let exchange = channel.exchange().unwrap();
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", HeaderValue::from_static("abc"));
        exchange.set_trailers(trailers);
        exchange.input.eof();
        exchange.output.set_status(StatusCode::OK);
        exchange.output.set_size(BodySize::Sized(0));
    }
    fn handle_async(&self, _channel: &Channel) {}
}

#[test]
fn set_trailers_queues_request_trailers_phase_before_request_end() {
    let (channel, _transport, listener) = make_channel(Arc::new(TrailerServer), None);
    let fanout = ListenerFanout::new(vec![listener.clone()]);
    channel.on_request(req(), fanout);

    let phases = listener.phases.lock().unwrap();
    let trailers_pos = phases.iter().position(|p| *p == Phase::RequestTrailers).expect("RequestTrailers fired");
    let end_pos = phases.iter().position(|p| *p == Phase::RequestEnd).expect("RequestEnd fired");
    assert!(trailers_pos < end_pos);
}

#[test]
fn date_header_is_stamped_when_configured() {
    let transport = Arc::new(RecordingTransport::new());
    let source: Arc<dyn DateSource> = Arc::new(SystemTimeDateTimeHandler);
    let channel = Channel::new_with_date_source(
        transport.clone(),
        Arc::new(FixedEndpoint),
        Arc::new(InlineExecutor),
        Arc::new(NoopScheduler),
        Arc::new(EchoServer),
        None,
        Duration::from_secs(30),
        Some(source),
        true,
    );
    channel.on_request(req(), ListenerFanout::default());

    let sent = transport.sent.lock().unwrap();
    let date = sent[0].2.get(header::DATE).expect("date header set");
    assert!(date.to_str().unwrap().ends_with("GMT"));
}

#[test]
fn scenario_6_bad_message_before_any_exchange_reports_declared_status() {
    let transport = Arc::new(RecordingTransport::new());
    let channel = Channel::new(
        transport.clone(),
        Arc::new(FixedEndpoint),
        Arc::new(InlineExecutor),
        Arc::new(NoopScheduler),
        Arc::new(SilentServer),
        Some(Arc::new(BodyEchoErrorHandler) as Arc<dyn ErrorHandler>),
        Duration::from_secs(30),
    );

    // no `on_request` ever happened: the parser rejected the request line
    // itself, so no exchange (and no `RequestBegin`) ever existed.
    assert!(channel.exchange().is_none());
    let result = channel.on_bad_message(StatusCode::URI_TOO_LONG, "URI too long");
    assert!(result.is_ok());

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, StatusCode::URI_TOO_LONG);
    assert_eq!(&sent[0].1[..], b"414 URI too long");
    assert!(transport.completed.load(Ordering::SeqCst));
}

#[test]
fn bad_message_after_exchange_exists_is_reraised_instead_of_sent_directly() {
    let (channel, transport, _listener) = make_channel(Arc::new(SuspendingServer), None);
    channel.on_request(req(), ListenerFanout::default());
    // the handler suspended without committing a response, so the exchange
    // is still live; a mid-exchange bad message must be reraised through
    // the ordinary error path rather than sent as a standalone response.
    assert!(channel.exchange().is_some());

    let err = channel.on_bad_message(StatusCode::BAD_REQUEST, "bad chunk size");
    match err {
        Err(ChannelError::BadMessage(reason)) => assert_eq!(reason, "bad chunk size"),
        other => panic!("expected BadMessage to be reraised, got {other:?}"),
    }
    assert!(transport.sent.lock().unwrap().is_empty());
}
