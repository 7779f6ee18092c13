//! `Exchange` and `Channel` (C4): the per-connection driver main loop.
//!
//! Grounded on `h1/dispatcher.rs`'s `Dispatcher::run` select-loop, which
//! this crate's `Channel::run` replaces with the `handling`/`execute`/
//! `unhandle` discipline of spec.md §4.1/§4.4: where the teacher polls three
//! futures (read, write, service call) inside one `async fn`, here a thread
//! pulls an `Action` from the `StateMachine`, executes it, and loops until
//! `Wait`/`Terminated` -- the same sequencing, expressed synchronously so
//! any worker thread can pick the loop back up (spec.md §5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;

use http::{HeaderMap, Method, StatusCode, Version};
use tracing::{debug, trace};

use crate::date::DateSource;
use crate::error::ChannelError;
use crate::input::InputPump;
use crate::listener::{failure_phase_for, ListenerFanout, Phase, PhaseQueue};
use crate::output::OutputPipeline;
use crate::request::RequestMeta;
use crate::response;
use crate::state::{Action, InputState, OutputState, RequestState, StateMachine};
use crate::traits::{Endpoint, ErrorHandler, Executor, Scheduler, Server, TimerHandle, Transport};

/// the tagged union replacing the teacher's trivial `HttpFlow` struct and
/// the source's `Dispatchable` inner-class hierarchy (spec.md §9): what kind
/// of dispatch the driver is currently running, so `onAfterDispatch`/
/// `onDispatchFailure` and the `SendError`/`AsyncError` paths know which
/// entry point to call back into.
pub enum DispatcherType {
    Request,
    Async,
    Error,
}

/// one in-flight request/response pair. Exclusively owned by its [`Channel`]
/// (spec.md §3); listeners only ever borrow it for the duration of a call.
pub struct Exchange {
    pub state: StateMachine,
    pub input: InputPump,
    pub output: OutputPipeline,
    pub listeners: ListenerFanout,
    /// events fired synchronously inside a dispatch (content arriving,
    /// trailers, a commit-time write) are queued here instead of fired
    /// directly, so the driver can fire them only once it reaches a safe
    /// point -- see `Channel::drain_phase_queue` (spec.md §4.6).
    phase_queue: Arc<PhaseQueue>,
    request: RwLock<RequestMeta>,
    /// captured at `onRequest`, restored at `onCompleted` iff it differs
    /// from the endpoint's default idle timeout (spec.md §5).
    saved_idle_timeout: std::sync::Mutex<Option<Duration>>,
}

impl Exchange {
    pub fn new(request: RequestMeta, listeners: ListenerFanout) -> Arc<Self> {
        Self::new_with_date_source(request, listeners, None, true)
    }

    pub fn new_with_date_source(
        request: RequestMeta,
        listeners: ListenerFanout,
        date_source: Option<Arc<dyn DateSource>>,
        set_date_header: bool,
    ) -> Arc<Self> {
        let phase_queue = Arc::new(PhaseQueue::default());
        Arc::new(Self {
            state: StateMachine::new(),
            input: InputPump::new(phase_queue.clone()),
            output: OutputPipeline::new(phase_queue.clone(), date_source, set_date_header),
            listeners,
            phase_queue,
            request: RwLock::new(request),
            saved_idle_timeout: std::sync::Mutex::new(None),
        })
    }

    pub fn request(&self) -> RwLockReadGuard<'_, RequestMeta> {
        self.request.read().unwrap()
    }

    pub fn set_trailers(&self, trailers: HeaderMap) {
        self.request.write().unwrap().set_trailers(trailers);
        self.phase_queue.push(Phase::RequestTrailers);
    }

    /// pops every phase queued by synchronous content/trailer/write activity
    /// and fires it, in arrival order, against this exchange's listeners.
    fn drain_phase_queue(&self) {
        for phase in self.phase_queue.drain() {
            self.listeners.fire(phase, Some(&self.request()));
        }
    }
}

/// the per-connection driver: a `Runnable` whose `run` equals `handle`
/// (spec.md §4.4). Holds the current [`Exchange`] plus the external
/// collaborators (spec.md §6); rescheduled onto an [`Executor`] whenever the
/// loop yields `Wait`.
pub struct Channel {
    exchange: std::sync::Mutex<Option<Arc<Exchange>>>,
    transport: Arc<dyn Transport>,
    endpoint: Arc<dyn Endpoint>,
    executor: Arc<dyn Executor>,
    scheduler: Arc<dyn Scheduler>,
    server: Arc<dyn Server>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    async_suspend_timeout: Duration,
    dispatcher_type: std::sync::Mutex<Option<DispatcherType>>,
    async_timer: std::sync::Mutex<Option<Box<dyn TimerHandle>>>,
    /// set once `onCompleted` has fired; guards against a second drive of a
    /// terminated exchange (Invariant 5).
    completed: AtomicBool,
    date_source: Option<Arc<dyn DateSource>>,
    set_date_header: bool,
}

impl Channel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoint: Arc<dyn Endpoint>,
        executor: Arc<dyn Executor>,
        scheduler: Arc<dyn Scheduler>,
        server: Arc<dyn Server>,
        error_handler: Option<Arc<dyn ErrorHandler>>,
        async_suspend_timeout: Duration,
    ) -> Arc<Self> {
        Self::new_with_date_source(
            transport,
            endpoint,
            executor,
            scheduler,
            server,
            error_handler,
            async_suspend_timeout,
            None,
            true,
        )
    }

    /// as [`Channel::new`], but stamping the `Date:` header (spec.md §6) on
    /// committed responses from `date_source` when `set_date_header` is true
    /// and the handler hasn't already set one.
    #[allow(clippy::too_many_arguments)]
    pub fn new_with_date_source(
        transport: Arc<dyn Transport>,
        endpoint: Arc<dyn Endpoint>,
        executor: Arc<dyn Executor>,
        scheduler: Arc<dyn Scheduler>,
        server: Arc<dyn Server>,
        error_handler: Option<Arc<dyn ErrorHandler>>,
        async_suspend_timeout: Duration,
        date_source: Option<Arc<dyn DateSource>>,
        set_date_header: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            exchange: std::sync::Mutex::new(None),
            transport,
            endpoint,
            executor,
            scheduler,
            server,
            error_handler,
            async_suspend_timeout,
            dispatcher_type: std::sync::Mutex::new(None),
            async_timer: std::sync::Mutex::new(None),
            completed: AtomicBool::new(false),
            date_source,
            set_date_header,
        })
    }

    pub fn exchange(&self) -> Option<Arc<Exchange>> {
        self.exchange.lock().unwrap().clone()
    }

    /// the transport a [`Server`] implementation writes its response
    /// through, e.g. `channel.exchange().unwrap().output.write(&exchange,
    /// &channel.transport(), ...)`.
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// parser-driven: a request-line and headers have been fully parsed.
    /// Creates the Exchange, fires `RequestBegin`, and reschedules the loop.
    pub fn on_request(self: &Arc<Self>, request: RequestMeta, listeners: ListenerFanout) {
        self.completed.store(false, Ordering::SeqCst);
        let exchange =
            Exchange::new_with_date_source(request, listeners, self.date_source.clone(), self.set_date_header);
        if exchange.state.output_state() == OutputState::Open {
            exchange.listeners.fire(Phase::RequestBegin, Some(&exchange.request()));
        }
        let saved = self.endpoint.idle_timeout();
        *exchange.saved_idle_timeout.lock().unwrap() = Some(saved);
        *self.exchange.lock().unwrap() = Some(exchange);
        self.executor.execute(self.clone());
    }

    /// parser-level malformed message (spec.md §4.5). If no exchange exists
    /// yet to dispatch through, a minimal response is sent directly and the
    /// error is not surfaced to the embedder; otherwise it is re-raised.
    pub fn on_bad_message(self: &Arc<Self>, status: StatusCode, reason: &'static str) -> Result<(), ChannelError> {
        if self.exchange().is_some() {
            return Err(ChannelError::BadMessage(reason));
        }
        let mut meta = response::status_only(status);
        let mut out_headers = HeaderMap::new();
        let body = self
            .error_handler
            .as_ref()
            .map(|h| h.bad_message_error(status, reason, &mut out_headers))
            .unwrap_or_default();
        meta.set_size(crate::body::BodySize::Sized(body.len()));
        if let Some(headers) = meta.headers_mut() {
            *headers = out_headers;
        }
        self.transport.send(
            &RequestMeta::new(Method::GET, http::Uri::default(), Version::HTTP_11, HeaderMap::new(), None),
            Some(&meta),
            body,
            true,
            Box::new(move |_| {}),
        );
        self.transport.on_completed();
        Ok(())
    }

    /// runs the loop for one scheduling quantum: `a := handling(); while a
    /// is neither Wait nor Terminated: execute(a); a := unhandle()` (spec.md
    /// §4.4). This is the `Runnable` the [`Executor`] invokes; `run` and
    /// `handle` are the same operation.
    pub fn run(self: &Arc<Self>) {
        let Some(exchange) = self.exchange() else {
            return;
        };

        let mut action = match exchange.state.handling() {
            Ok(a) => a,
            Err(e) => {
                debug!(target: "xitca_channel::channel", error = %e, "handling() rejected re-entry");
                return;
            }
        };

        loop {
            if action.is_loop_exit() {
                if matches!(action, Action::Terminated) {
                    self.on_terminated(&exchange);
                }
                break;
            }
            if let Err(err) = self.execute(&exchange, action) {
                self.handle_exception(&exchange, err);
            }
            action = exchange.state.unhandle();
        }
    }

    fn execute(self: &Arc<Self>, exchange: &Arc<Exchange>, action: Action) -> Result<(), ChannelError> {
        trace!(target: "xitca_channel::channel", ?action, "executing action");
        match action {
            Action::Dispatch => self.dispatch(exchange, DispatcherType::Request),
            Action::AsyncDispatch => self.dispatch(exchange, DispatcherType::Async),
            Action::AsyncTimeout => {
                // cooperative notification (spec.md §4.1): if the listener
                // doesn't resolve the exchange, StateMachine escalates to
                // SendError on its own on the next `unhandle`.
                debug!(target: "xitca_channel::channel", "async timeout fired");
                Ok(())
            }
            Action::AsyncError(e) => self.dispatch_error(exchange, ChannelError::Handler(e)),
            Action::SendError => self.send_error(exchange),
            // the application already observes new content by calling
            // `produce_content`/`need_content` again once rescheduled; this
            // action exists to give the loop a step to drain any
            // Request*/Response* phases queued by the background-thread
            // read/write that triggered this reschedule (spec.md §4.4).
            Action::ReadCallback | Action::WriteCallback => {
                exchange.drain_phase_queue();
                Ok(())
            }
            Action::Complete => self.complete(exchange),
            Action::Wait | Action::Terminated => Ok(()),
        }
    }

    fn dispatch(self: &Arc<Self>, exchange: &Arc<Exchange>, kind: DispatcherType) -> Result<(), ChannelError> {
        *self.dispatcher_type.lock().unwrap() = Some(kind);
        exchange.listeners.fire(Phase::BeforeDispatch, Some(&exchange.request()));

        let is_async_dispatch = matches!(self.dispatcher_type.lock().unwrap().as_ref(), Some(DispatcherType::Async));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            if is_async_dispatch {
                self.server.handle_async(self);
            } else {
                self.server.handle(self);
            }
        }));

        *self.dispatcher_type.lock().unwrap() = None;

        match result {
            Ok(()) => {
                // fire AfterDispatch before draining Request*/Response*
                // phases the handler's own synchronous reads/writes queued
                // during `handle`/`handle_async`, so relative order matches
                // the canonical sequence (spec.md §4.6/§8) regardless of
                // whether the handler wrote synchronously or not.
                exchange.listeners.fire(Phase::AfterDispatch, Some(&exchange.request()));
                exchange.drain_phase_queue();
                if !matches!(exchange.state.request_state(), RequestState::Async) {
                    exchange.state.request_completed();
                }
                Ok(())
            }
            Err(_) => {
                exchange
                    .listeners
                    .fire(failure_phase_for(Phase::AfterDispatch), Some(&exchange.request()));
                exchange.drain_phase_queue();
                Err(ChannelError::Handler(Box::new(std::io::Error::other("handler panicked"))))
            }
        }
    }

    /// rethrows the captured async throwable through the handler path
    /// (spec.md §4.4 `AsyncError`).
    fn dispatch_error(&self, exchange: &Arc<Exchange>, err: ChannelError) -> Result<(), ChannelError> {
        exchange.listeners.fire(Phase::RequestFailure, Some(&exchange.request()));
        Err(err)
    }

    /// `SendError` action (spec.md §4.4): reset content, pick a status, and
    /// either send a minimal response or dispatch into the error handler.
    fn send_error(self: &Arc<Self>, exchange: &Arc<Exchange>) -> Result<(), ChannelError> {
        exchange.output.reset_content(&exchange.state);
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        let method = exchange.request().method().clone();
        let forbids_body = crate::listener::forbids_body(status, &method);

        let wants_error_page = self
            .error_handler
            .as_ref()
            .is_some_and(|h| h.error_page_for_method(&method));

        exchange.output.set_status(status);

        if forbids_body || !wants_error_page {
            exchange.output.set_size(crate::body::BodySize::Sized(0));
            self.complete_with_empty_body(exchange);
            return Ok(());
        }

        *self.dispatcher_type.lock().unwrap() = Some(DispatcherType::Error);
        let body = self.error_handler.as_ref().unwrap().handle(status, &exchange.request());
        *self.dispatcher_type.lock().unwrap() = None;
        exchange.output.set_size(crate::body::BodySize::Sized(body.len()));
        let transport = self.transport.clone();
        let exchange_cb = exchange.clone();
        exchange.output.write(
            exchange,
            &transport,
            body,
            true,
            Box::new(move |_| {
                exchange_cb.state.completed();
            }),
        );
        Ok(())
    }

    fn complete_with_empty_body(self: &Arc<Self>, exchange: &Arc<Exchange>) {
        let transport = self.transport.clone();
        let exchange_cb = exchange.clone();
        exchange.output.complete_output(
            exchange,
            &transport,
            Box::new(move |_| {
                exchange_cb.state.completed();
            }),
        );
    }

    /// `Complete` action (spec.md §4.4).
    fn complete(self: &Arc<Self>, exchange: &Arc<Exchange>) -> Result<(), ChannelError> {
        if matches!(exchange.state.output_state(), OutputState::Open)
            && matches!(exchange.state.request_state(), RequestState::Completing)
            && !exchange.output.is_handled()
        {
            // uncommitted and unhandled: nothing was ever written.
            exchange.output.set_status(StatusCode::NOT_FOUND);
            exchange.output.set_size(crate::body::BodySize::Sized(0));
        }

        exchange.output.check_content_length(exchange)?;

        if self.check_and_prepare_upgrade(exchange) {
            return Ok(());
        }

        // the persistence rewrite (Property P7) happened at commit time
        // (`OutputPipeline::write`), the last point headers could still
        // change; this is just the best-effort drain.
        exchange.input.consume_all();

        if matches!(exchange.state.output_state(), OutputState::Completed) {
            // the handler already wrote its last chunk and the output side
            // is done; completing here would re-enter `write()` and refire
            // ResponseContent/ResponseEnd for a chunk that was never sent.
            exchange.state.completed();
        } else {
            self.complete_with_empty_body(exchange);
        }
        Ok(())
    }

    /// hook for upgrade-aware embedders (spec.md §4.4); this core performs
    /// no protocol upgrades, so it always declines.
    fn check_and_prepare_upgrade(&self, _exchange: &Arc<Exchange>) -> bool {
        false
    }

    fn on_terminated(&self, exchange: &Arc<Exchange>) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(saved) = *exchange.saved_idle_timeout.lock().unwrap() {
            if saved != self.endpoint.idle_timeout() {
                self.endpoint.set_idle_timeout(saved);
            }
        }
        // safety net: guarantee nothing queued by a last-moment read/write
        // (e.g. `complete_with_empty_body`'s own write) is ever silently
        // dropped before the terminal Complete phase fires.
        exchange.drain_phase_queue();
        exchange.listeners.fire(Phase::Complete, Some(&exchange.request()));
        self.transport.on_completed();
        *self.exchange.lock().unwrap() = None;
    }

    /// exception handling for the loop (spec.md §4.4): classify, log, then
    /// either `abort` (if committed) or `StateMachine::send_error` (schedules
    /// the `SendError` action); if that itself fails, `abort`. This is the
    /// generic driver-level fallback for errors raised from within
    /// `execute()` itself (a panicking dispatch, a bad message observed
    /// mid-`Complete`); it is distinct from [`Channel::async_error`], which
    /// reports a throwable captured on a suspended async thread and routes
    /// through the `AsyncError` action instead.
    fn handle_exception(self: &Arc<Self>, exchange: &Arc<Exchange>, err: ChannelError) {
        err.log("xitca_channel::channel");

        if matches!(exchange.state.output_state(), OutputState::Committed | OutputState::Completed) {
            self.abort(exchange, err);
            return;
        }

        if exchange.state.send_error().is_err() {
            self.abort(exchange, ChannelError::BadMessage("sendError() with response already committed"));
        }
    }

    /// universal terminal cancellation (spec.md §4.5). Idempotent (Property P3).
    pub fn abort(&self, exchange: &Arc<Exchange>, err: ChannelError) {
        if exchange.state.abort_response() {
            exchange.listeners.fire(Phase::ResponseFailure, Some(&exchange.request()));
            self.transport.abort(&err);
        }
    }

    /// input-side entry point: true iff content is immediately available;
    /// otherwise schedules a `ReadCallback` action once data arrives.
    pub fn need_content(self: &Arc<Self>, exchange: &Arc<Exchange>) -> bool {
        if exchange.input.need_content() {
            return true;
        }
        let channel = self.clone();
        let exchange = exchange.clone();
        exchange.input.on_content_producible(move || {
            exchange.state.set_read_callback_pending();
            channel.executor.execute(channel.clone());
        });
        false
    }

    /// `startAsync`: suspend the exchange with the configured default
    /// timeout, arming the async-timeout timer.
    pub fn start_async(self: &Arc<Self>, exchange: &Arc<Exchange>) -> Result<(), crate::state::IllegalState> {
        exchange.state.start_async()?;
        let channel = self.clone();
        let exchange_for_timer = exchange.clone();
        let handle = self.scheduler.schedule(
            self.async_suspend_timeout,
            Box::new(move || {
                exchange_for_timer.state.on_timeout();
                channel.executor.execute(channel.clone());
            }),
        );
        *self.async_timer.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// async resume via `dispatch()`/`complete()`; cancels the pending timer.
    pub fn async_dispatch(&self, exchange: &Arc<Exchange>) -> Result<(), crate::state::IllegalState> {
        if let Some(timer) = self.async_timer.lock().unwrap().take() {
            timer.cancel();
        }
        exchange.state.dispatch()
    }

    pub fn async_complete(self: &Arc<Self>, exchange: &Arc<Exchange>) -> Result<(), crate::state::IllegalState> {
        if let Some(timer) = self.async_timer.lock().unwrap().take() {
            timer.cancel();
        }
        exchange.state.complete()?;
        self.executor.execute(self.clone());
        Ok(())
    }

    /// reports a throwable caught on a suspended async thread (spec.md
    /// §4.4 `AsyncError`), cancelling the pending timeout and rescheduling
    /// the loop so it rethrows through [`Channel::dispatch_error`].
    pub fn async_error(
        self: &Arc<Self>,
        exchange: &Arc<Exchange>,
        err: Box<dyn std::error::Error + Send + Sync>,
    ) -> Result<(), crate::state::IllegalState> {
        if let Some(timer) = self.async_timer.lock().unwrap().take() {
            timer.cancel();
        }
        exchange.state.on_error(err)?;
        self.executor.execute(self.clone());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Uri};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct RecordingTransport {
        sent: StdMutex<Vec<(StatusCode, Bytes)>>,
        completed: AtomicBool,
    }

    impl Transport for RecordingTransport {
        fn send(
            &self,
            _request: &RequestMeta,
            response: Option<&crate::response::ResponseMeta>,
            chunk: Bytes,
            _last: bool,
            callback: Box<dyn FnOnce(Result<usize, Box<dyn std::error::Error + Send + Sync>>) + Send>,
        ) {
            if let Some(r) = response {
                self.sent.lock().unwrap().push((r.status(), chunk.clone()));
            }
            callback(Ok(chunk.len()));
        }
        fn abort(&self, _err: &(dyn std::error::Error + Send + Sync)) {}
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
        fn local_addr(&self) -> Option<std::net::SocketAddr> {
            None
        }
        fn remote_addr(&self) -> Option<std::net::SocketAddr> {
            None
        }
    }

    struct InlineExecutor(AtomicUsize);
    impl Executor for InlineExecutor {
        fn execute(&self, channel: Arc<Channel>) {
            self.0.fetch_add(1, Ordering::SeqCst);
            channel.run();
        }
    }

    struct NoopScheduler;
    impl Scheduler for NoopScheduler {
        fn schedule(&self, _delay: Duration, callback: Box<dyn FnOnce() + Send>) -> Box<dyn TimerHandle> {
            struct Noop(Option<Box<dyn FnOnce() + Send>>);
            impl TimerHandle for Noop {
                fn cancel(&self) {}
            }
            Box::new(Noop(Some(callback)))
        }
    }

    struct EchoServer;
    impl Server for EchoServer {
        fn handle(&self, channel: &Channel) {
            let exchange = channel.exchange().unwrap();
            exchange.output.set_status(StatusCode::OK);
            exchange.output.set_size(crate::body::BodySize::Sized(5));
            let transport = channel.transport.clone();
            exchange.output.write(&exchange, &transport, Bytes::from_static(b"hello"), true, Box::new(|_| {}));
        }
        fn handle_async(&self, _channel: &Channel) {}
    }

    struct SilentServer;
    impl Server for SilentServer {
        fn handle(&self, _channel: &Channel) {}
        fn handle_async(&self, _channel: &Channel) {}
    }

    fn make_channel(server: Arc<dyn Server>) -> (Arc<Channel>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport {
            sent: StdMutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        });
        let channel = Channel::new(
            transport.clone(),
            Arc::new(FixedEndpoint),
            Arc::new(InlineExecutor(AtomicUsize::new(0))),
            Arc::new(NoopScheduler),
            server,
            None,
            Duration::from_secs(30),
        );
        (channel, transport)
    }

    fn req() -> RequestMeta {
        RequestMeta::new(Method::GET, Uri::from_static("/x"), Version::HTTP_11, HeaderMap::new(), None)
    }

    #[test]
    fn handler_writes_body_and_completes_200() {
        let (channel, transport) = make_channel(Arc::new(EchoServer));
        channel.on_request(req(), ListenerFanout::default());
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, StatusCode::OK);
        assert_eq!(&sent[0].1[..], b"hello");
        assert!(transport.completed.load(Ordering::SeqCst));
    }

    #[test]
    fn silent_handler_yields_404_on_complete() {
        let (channel, transport) = make_channel(Arc::new(SilentServer));
        channel.on_request(req(), ListenerFanout::default());
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, StatusCode::NOT_FOUND);
    }
}
