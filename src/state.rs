//! The per-exchange state machine ("StateMachine", C1).
//!
//! Generalizes the teacher's single-threaded `h1/proto/context.rs::Context`
//! bitflag pattern into a thread-safe arbiter: the [`StateMachine`] is the single
//! mutex any thread must hold to advance an [`Exchange`](crate::channel::Exchange).
//! See `h1/proto/context.rs` in the teacher crate for the bitflag state this
//! is grounded on.

use core::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// returned when a StateMachine transition is attempted from a state that
/// does not allow it (e.g. two threads both calling `handling()`, or
/// `startAsync` outside of an active dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalState(pub &'static str);

impl fmt::Display for IllegalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal state: {}", self.0)
    }
}

impl std::error::Error for IllegalState {}

/// request-side lifecycle. see spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Dispatched,
    Async,
    Completing,
    Completed,
}

/// async-suspension lifecycle. see spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncState {
    NotAsync,
    Started,
    Dispatch,
    Expiring,
    Expired,
    Complete,
    Errored,
}

/// output (response) lifecycle. see spec.md §3 and Invariant 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Open,
    Committed,
    Completed,
    Aborted,
}

/// input (request body) lifecycle. see spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Idle,
    Unready,
    Ready,
    Producing,
    Eof,
    Errored,
}

/// the tagged value StateMachine produces and Channel consumes. see
/// spec.md §3 and §4.4's action execution table.
pub enum Action {
    Dispatch,
    AsyncDispatch,
    AsyncTimeout,
    /// carries the captured async throwable to rethrow through the handler path.
    AsyncError(Box<dyn std::error::Error + Send + Sync>),
    SendError,
    ReadCallback,
    WriteCallback,
    Complete,
    Wait,
    Terminated,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatch => f.write_str("Dispatch"),
            Self::AsyncDispatch => f.write_str("AsyncDispatch"),
            Self::AsyncTimeout => f.write_str("AsyncTimeout"),
            Self::AsyncError(e) => write!(f, "AsyncError({e})"),
            Self::SendError => f.write_str("SendError"),
            Self::ReadCallback => f.write_str("ReadCallback"),
            Self::WriteCallback => f.write_str("WriteCallback"),
            Self::Complete => f.write_str("Complete"),
            Self::Wait => f.write_str("Wait"),
            Self::Terminated => f.write_str("Terminated"),
        }
    }
}

impl Action {
    /// true for the two actions that end the driver's `while` loop (spec.md §4.1).
    #[inline]
    pub fn is_loop_exit(&self) -> bool {
        matches!(self, Self::Wait | Self::Terminated)
    }
}

#[derive(Debug, Default)]
struct Pending {
    read_callback: bool,
    write_callback: bool,
    send_error: bool,
    /// true once `handling`/`unhandle` has produced `Terminated`; no further
    /// actions may be produced until `recycle` (Invariant 5).
    terminated: bool,
}

struct Inner {
    /// true while some thread is actively advancing the exchange (between a
    /// `handling`/`unhandle` call that returned a non-terminal action and the
    /// next `unhandle`). Enforces "at most one thread advances the exchange".
    held: bool,
    request: RequestState,
    r#async: AsyncState,
    output: OutputState,
    input: InputState,
    pending: Pending,
    async_error: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            held: false,
            request: RequestState::Idle,
            r#async: AsyncState::NotAsync,
            output: OutputState::Open,
            input: InputState::Idle,
            pending: Pending::default(),
            async_error: None,
        }
    }

    /// computes the next action from the current state vector without
    /// mutating anything but the transitions that action implies. mirrors
    /// the priority Jetty's `HttpChannelState` gives: an in-flight async
    /// resume or timeout always wins over plain completion bookkeeping,
    /// which in turn wins over idle-wait.
    fn next_action(&mut self) -> Action {
        if self.pending.terminated {
            return Action::Wait;
        }

        if let Some(e) = self.async_error.take() {
            return Action::AsyncError(e);
        }

        match self.r#async {
            AsyncState::Dispatch => {
                self.r#async = AsyncState::NotAsync;
                self.request = RequestState::Dispatched;
                return Action::AsyncDispatch;
            }
            AsyncState::Expiring => {
                // cooperative: deliver the notification, don't preempt. if the
                // listener doesn't resolve it by the time control returns here
                // again, Expiring is still set and we escalate to SendError.
                self.r#async = AsyncState::Expired;
                return Action::AsyncTimeout;
            }
            AsyncState::Expired => {
                // escalate once: an unresolved timeout becomes a single
                // SendError(500), not a standing condition this arm would
                // otherwise re-enter on every subsequent next_action call.
                self.r#async = AsyncState::NotAsync;
                self.pending.send_error = true;
            }
            AsyncState::Complete => {
                self.r#async = AsyncState::NotAsync;
                self.request = RequestState::Completing;
            }
            _ => {}
        }

        if self.pending.send_error {
            self.pending.send_error = false;
            return Action::SendError;
        }

        if self.pending.read_callback {
            self.pending.read_callback = false;
            return Action::ReadCallback;
        }

        if self.pending.write_callback {
            self.pending.write_callback = false;
            return Action::WriteCallback;
        }

        match self.request {
            RequestState::Idle => {
                self.request = RequestState::Dispatched;
                Action::Dispatch
            }
            RequestState::Completing => Action::Complete,
            RequestState::Completed => {
                self.pending.terminated = true;
                Action::Terminated
            }
            RequestState::Dispatched | RequestState::Async => Action::Wait,
        }
    }
}

/// produces the next [`Action`] based on the state vector and external
/// events; the sole source of ordering for an [`Exchange`](crate::channel::Exchange).
pub struct StateMachine {
    inner: Mutex<Inner>,
    /// bytes confirmed written post-interception. updated only on the
    /// write-completion thread, read by anyone (Invariant 4) -- kept outside
    /// the state mutex so a reader never blocks on exchange advancement.
    bytes_written: AtomicU64,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// reset all state for the next exchange on a persistent connection.
    pub fn recycle(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::new();
        self.bytes_written.store(0, Ordering::Relaxed);
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    pub(crate) fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::AcqRel);
    }

    /// invoked when the driver (re-)enters processing.
    pub fn handling(&self) -> Result<Action, IllegalState> {
        let mut inner = self.inner.lock().unwrap();
        if inner.held {
            return Err(IllegalState("handling() called while another thread holds the exchange"));
        }
        inner.held = true;
        let action = inner.next_action();
        if action.is_loop_exit() {
            inner.held = false;
        }
        Ok(action)
    }

    /// invoked after an action completes; returns the next action or `Wait`
    /// if the exchange is now suspended.
    pub fn unhandle(&self) -> Action {
        let mut inner = self.inner.lock().unwrap();
        let action = inner.next_action();
        if action.is_loop_exit() {
            inner.held = false;
        }
        action
    }

    /// `NotAsync -> Started`. allowed only during an active dispatch.
    pub fn start_async(&self) -> Result<(), IllegalState> {
        let mut inner = self.inner.lock().unwrap();
        match inner.request {
            RequestState::Dispatched => {}
            _ => return Err(IllegalState("startAsync outside of an active dispatch")),
        }
        if !matches!(inner.r#async, AsyncState::NotAsync) {
            return Err(IllegalState("startAsync called twice"));
        }
        inner.r#async = AsyncState::Started;
        inner.request = RequestState::Async;
        Ok(())
    }

    /// async resume: `Started -> Dispatch`; schedules an `AsyncDispatch` action.
    pub fn dispatch(&self) -> Result<(), IllegalState> {
        let mut inner = self.inner.lock().unwrap();
        if !matches!(inner.r#async, AsyncState::Started | AsyncState::Expiring) {
            return Err(IllegalState("dispatch() called outside of an async context"));
        }
        inner.r#async = AsyncState::Dispatch;
        Ok(())
    }

    /// from any async state to `Complete`. if no dispatch is pending the
    /// next `unhandle` yields `Complete`.
    pub fn complete(&self) -> Result<(), IllegalState> {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.r#async, AsyncState::NotAsync) {
            return Err(IllegalState("complete() called outside of an async context"));
        }
        inner.r#async = AsyncState::Complete;
        Ok(())
    }

    /// `Started -> Expiring`.
    pub fn on_timeout(&self) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.r#async, AsyncState::Started) {
            inner.r#async = AsyncState::Expiring;
        }
    }

    /// `Started -> Errored`, capturing the throwable for a later `AsyncError` action.
    pub fn on_error(&self, err: Box<dyn std::error::Error + Send + Sync>) -> Result<(), IllegalState> {
        let mut inner = self.inner.lock().unwrap();
        if inner.async_error.is_some() {
            return Err(IllegalState("onError called while an async error is already pending"));
        }
        inner.r#async = AsyncState::Errored;
        inner.async_error = Some(err);
        Ok(())
    }

    /// atomically `Open -> Committed`. returns true on the transition.
    pub fn commit_response(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.output, OutputState::Open) {
            inner.output = OutputState::Committed;
            true
        } else {
            false
        }
    }

    /// informational (1xx) response path: may be invoked repeatedly without
    /// leaving `Open`.
    pub fn partial_response(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        matches!(inner.output, OutputState::Open)
    }

    /// `Committed -> Completed`. returns true on the transition.
    pub fn complete_response(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.output, OutputState::Committed) {
            inner.output = OutputState::Completed;
            true
        } else {
            false
        }
    }

    /// to `Aborted`. returns true if this call performed the transition
    /// (idempotent -- Property P3).
    pub fn abort_response(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.output, OutputState::Aborted) {
            false
        } else {
            inner.output = OutputState::Aborted;
            true
        }
    }

    pub fn output_state(&self) -> OutputState {
        self.inner.lock().unwrap().output
    }

    /// enqueue a `SendError` action. legal only if response is uncommitted.
    pub fn send_error(&self) -> Result<(), IllegalState> {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.output, OutputState::Committed | OutputState::Completed) {
            return Err(IllegalState("sendError() with response already committed"));
        }
        inner.pending.send_error = true;
        Ok(())
    }

    /// request-side: request-line and headers fully parsed; ready to dispatch.
    pub fn request_state(&self) -> RequestState {
        self.inner.lock().unwrap().request
    }

    /// the handler finished without suspending: request moves toward completion.
    pub fn request_completed(&self) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.request, RequestState::Dispatched) {
            inner.request = RequestState::Completing;
        }
    }

    /// output fully sent (the `Complete` action's write callback fired):
    /// `Completing -> Completed`, which yields a `Terminated` action next.
    pub fn completed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.request = RequestState::Completed;
    }

    pub fn set_read_callback_pending(&self) {
        self.inner.lock().unwrap().pending.read_callback = true;
    }

    pub fn set_write_callback_pending(&self) {
        self.inner.lock().unwrap().pending.write_callback = true;
    }

    pub fn input_state(&self) -> InputState {
        self.inner.lock().unwrap().input
    }

    pub fn set_input_state(&self, state: InputState) {
        self.inner.lock().unwrap().input = state;
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn idle_dispatches_once() {
        let sm = StateMachine::new();
        assert!(matches!(sm.handling().unwrap(), Action::Dispatch));
        // same thread re-entering handling() before unhandle() is an error:
        // another "thread" still holds the exchange.
        assert!(sm.handling().is_err());
    }

    #[test]
    fn complete_after_dispatch_terminates() {
        let sm = StateMachine::new();
        assert!(matches!(sm.handling().unwrap(), Action::Dispatch));
        sm.request_completed();
        assert!(matches!(sm.unhandle(), Action::Complete));
        sm.completed();
        assert!(matches!(sm.unhandle(), Action::Terminated));
        assert!(matches!(sm.unhandle(), Action::Wait));
    }

    #[test]
    fn async_suspend_and_timer_resume() {
        let sm = StateMachine::new();
        assert!(matches!(sm.handling().unwrap(), Action::Dispatch));
        sm.start_async().unwrap();
        assert!(matches!(sm.unhandle(), Action::Wait));
        // timer fires, listener calls complete().
        sm.complete().unwrap();
        assert!(matches!(sm.handling().unwrap(), Action::Complete));
    }

    #[test]
    fn expired_async_escalates_to_send_error_once() {
        let sm = StateMachine::new();
        assert!(matches!(sm.handling().unwrap(), Action::Dispatch));
        sm.start_async().unwrap();
        assert!(matches!(sm.unhandle(), Action::Wait));
        sm.on_timeout();
        // first unhandle: cooperative notification, not yet escalated.
        assert!(matches!(sm.unhandle(), Action::AsyncTimeout));
        // listener never resolves it: escalate to a single SendError.
        assert!(matches!(sm.unhandle(), Action::SendError));
        sm.completed();
        assert!(matches!(sm.unhandle(), Action::Terminated));
        assert!(matches!(sm.unhandle(), Action::Wait));
    }

    #[test]
    fn abort_is_idempotent() {
        let sm = StateMachine::new();
        assert!(sm.abort_response());
        assert!(!sm.abort_response());
    }

    #[test]
    fn commit_once() {
        let sm = StateMachine::new();
        assert!(sm.commit_response());
        assert!(!sm.commit_response());
    }
}
