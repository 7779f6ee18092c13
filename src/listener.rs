//! `ListenerFanout` (C6): phase-annotated, failure-isolated observer
//! notification.
//!
//! No direct teacher counterpart (xitca-web's logger middleware wraps a
//! `Service`, it doesn't enumerate connector-level phases); grounded on the
//! teacher's `tracing`-based logging idiom (`util/logger.rs`) for how each
//! per-listener failure gets logged, generalized into the phase contract
//! spec.md §4.6 specifies.

use http::{Method, StatusCode};
use tracing::debug;

use crate::request::RequestMeta;

/// a phase in an exchange's lifecycle (spec.md §4.6). `*Failure` variants
/// fire in place of the corresponding success phase, never in addition to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    RequestBegin,
    BeforeDispatch,
    AfterDispatch,
    DispatchFailure,
    RequestContent,
    RequestContentEnd,
    RequestTrailers,
    RequestEnd,
    RequestFailure,
    ResponseBegin,
    ResponseCommit,
    ResponseContent,
    ResponseEnd,
    ResponseFailure,
    Complete,
}

/// a single observer. default methods no-op, mirroring the teacher's
/// `tap`-style optional hooks -- implementors override only the phases they
/// care about.
pub trait Listener: Send + Sync {
    fn on_phase(&self, phase: Phase, request: Option<&RequestMeta>) {
        let _ = (phase, request);
    }
}

/// aggregates the connector-level combined listener plus a bounded,
/// transient per-exchange list (spec.md §9: "deprecated in source... make it
/// a small fixed-size bounded collection"). Invocations are synchronous on
/// the thread advancing the exchange and must not block; a panicking or
/// erroring listener is isolated and logged at debug, never propagated into
/// the driver (spec.md §4.6).
pub struct ListenerFanout {
    combined: Vec<std::sync::Arc<dyn Listener>>,
    transient: Vec<std::sync::Arc<dyn Listener>>,
}

/// transient per-exchange listeners beyond this count are rejected rather
/// than silently growing an exchange's bookkeeping without bound.
pub const MAX_TRANSIENT_LISTENERS: usize = 8;

impl ListenerFanout {
    pub fn new(combined: Vec<std::sync::Arc<dyn Listener>>) -> Self {
        Self {
            combined,
            transient: Vec::new(),
        }
    }

    /// registers a listener for the current exchange only; cleared on
    /// `recycle`. returns false if the bounded list is full.
    pub fn add_transient(&mut self, listener: std::sync::Arc<dyn Listener>) -> bool {
        if self.transient.len() >= MAX_TRANSIENT_LISTENERS {
            return false;
        }
        self.transient.push(listener);
        true
    }

    /// cleared on recycle (spec.md §5).
    pub fn clear_transient(&mut self) {
        self.transient.clear();
    }

    /// fire `phase` on every registered listener, isolating and logging any
    /// failure rather than letting it interrupt the remaining listeners or
    /// the driver loop.
    pub fn fire(&self, phase: Phase, request: Option<&RequestMeta>) {
        for listener in self.combined.iter().chain(self.transient.iter()) {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_phase(phase, request);
            }));
            if result.is_err() {
                debug!(target: "xitca_channel::listener", ?phase, "listener panicked, isolated");
            }
        }
    }
}

impl Default for ListenerFanout {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// events queued by `InputPump`/`OutputPipeline` activity that happens
/// synchronously inside a dispatch, drained once the driver reaches a safe
/// point (right after `AfterDispatch`, or at a `ReadCallback`/`WriteCallback`
/// action). Without this, a handler's own synchronous reads/writes would
/// notify listeners before the handler has even returned, ahead of
/// `AfterDispatch` -- spec.md §4.6's canonical order requires the reverse.
#[derive(Default)]
pub struct PhaseQueue {
    events: std::sync::Mutex<std::collections::VecDeque<Phase>>,
}

impl PhaseQueue {
    pub fn push(&self, phase: Phase) {
        self.events.lock().unwrap().push_back(phase);
    }

    /// pops every queued event in arrival order, leaving the queue empty.
    pub fn drain(&self) -> Vec<Phase> {
        self.events.lock().unwrap().drain(..).collect()
    }
}

/// picks the error-status phase in place of the success phase it replaces,
/// per spec.md §4.6 ("any failure fires `onRequest/ResponseFailure` in
/// place of the corresponding success event").
pub fn failure_phase_for(success: Phase) -> Phase {
    match success {
        Phase::RequestEnd => Phase::RequestFailure,
        Phase::ResponseEnd | Phase::ResponseBegin | Phase::ResponseCommit | Phase::ResponseContent => {
            Phase::ResponseFailure
        }
        Phase::AfterDispatch => Phase::DispatchFailure,
        other => other,
    }
}

/// whether a status forces an empty body (spec.md §6), used by
/// [`crate::output::OutputPipeline`] and [`crate::error`] alike.
pub fn forbids_body(status: StatusCode, method: &Method) -> bool {
    method == Method::HEAD
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || status.is_informational()
}
