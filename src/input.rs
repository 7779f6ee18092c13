//! The input-side content pump ("InputPump", C2): demand, production, EOF
//! and failure signalling between a push-based parser and a pull-based
//! application.
//!
//! Grounded on `h1/dispatcher.rs`'s `Notify`/`Notifier` waker-cell (there
//! `Rc<RefCell<Inner>>`, single-threaded; here `Arc<Mutex<Inner>>` since
//! parser callbacks and the application thread may differ) and on the
//! eof-triggered drain in `h1/dispatcher.rs`'s `Decoder::drop`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;

use crate::listener::{Phase, PhaseQueue};

/// a terminal chunk: once produced, every subsequent `produce_content` call
/// returns a clone of the same value and `need_content` is permanently true
/// (spec.md §3 Chunk invariant).
#[derive(Clone)]
pub enum SpecialChunk {
    Eof,
    Error(Arc<std::io::Error>),
}

/// a byte range plus flags, or a terminal [`SpecialChunk`].
pub enum Chunk {
    Data { bytes: Bytes, last: bool },
    Special(SpecialChunk),
}

impl Chunk {
    pub fn is_last(&self) -> bool {
        matches!(self, Self::Data { last: true, .. } | Self::Special(_))
    }
}

struct Inner {
    queue: VecDeque<Chunk>,
    special: Option<SpecialChunk>,
    /// true once `need_content` found nothing ready and is waiting on the
    /// transport; cleared the moment content (of any kind) arrives.
    demand_pending: bool,
    /// the reschedule hook registered via `on_content_producible`, run
    /// exactly once when content next becomes available.
    producible: Option<Box<dyn FnOnce() + Send>>,
    /// set once `RequestContentEnd`/`RequestEnd` has fired, so a later `eof`
    /// call after a `last`-flagged data chunk (or vice versa) never fires a
    /// terminal content phase twice.
    content_ended: bool,
    ended: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            special: None,
            demand_pending: false,
            producible: None,
            content_ended: false,
            ended: false,
        }
    }

    fn has_ready(&self) -> bool {
        !self.queue.is_empty() || self.special.is_some()
    }

    fn take_producible(&mut self) -> Option<Box<dyn FnOnce() + Send>> {
        self.demand_pending = false;
        self.producible.take()
    }
}

/// bridges a push-based parser (content arrives via [`InputPump::on_content`])
/// and a pull-based application (content is drained via
/// [`InputPump::produce_content`]).
pub struct InputPump {
    inner: Mutex<Inner>,
    phase_queue: Arc<PhaseQueue>,
}

impl InputPump {
    pub fn new(phase_queue: Arc<PhaseQueue>) -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            phase_queue,
        }
    }

    /// true iff a chunk is immediately available; otherwise registers demand
    /// (idempotent -- at most one outstanding demand per spec.md §4.2).
    pub fn need_content(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.has_ready() {
            return true;
        }
        inner.demand_pending = true;
        false
    }

    /// returns the next available chunk without blocking; `None` when
    /// nothing is ready yet. delivery is in arrival order; a special chunk
    /// is never reordered before data that arrived earlier.
    pub fn produce_content(&self) -> Option<Chunk> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(chunk) = inner.queue.pop_front() {
            return Some(chunk);
        }
        inner.special.clone().map(Chunk::Special)
    }

    /// registers `cb` to run once content becomes available; runs it inline
    /// if content is already ready.
    pub fn on_content_producible<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.has_ready() {
            drop(inner);
            cb();
        } else {
            inner.producible = Some(Box::new(cb));
        }
    }

    /// parser-driven: a data chunk parsed off the wire.
    pub fn on_content(&self, bytes: Bytes, last: bool) {
        let (cb, content_end) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.special.is_some() {
                // delivery ordering guarantees this shouldn't happen; ignore
                // rather than corrupt an already-terminal stream.
                return;
            }
            inner.queue.push_back(Chunk::Data { bytes, last });
            let content_end = last && !inner.content_ended;
            if content_end {
                inner.content_ended = true;
            }
            (inner.take_producible(), content_end)
        };
        self.phase_queue.push(Phase::RequestContent);
        if content_end {
            self.phase_queue.push(Phase::RequestContentEnd);
        }
        if let Some(cb) = cb {
            cb();
        }
    }

    /// marks end-of-input. returns true if the channel must be rescheduled
    /// (an application was waiting on demand).
    pub fn eof(&self) -> bool {
        let (was_waiting, cb, fire_end) = {
            let mut inner = self.inner.lock().unwrap();
            let was_waiting = inner.demand_pending;
            if inner.special.is_none() {
                inner.special = Some(SpecialChunk::Eof);
            }
            let fire_end = !inner.ended;
            inner.ended = true;
            (was_waiting, inner.take_producible(), fire_end)
        };
        if fire_end {
            self.phase_queue.push(Phase::RequestEnd);
        }
        if let Some(cb) = cb {
            cb();
        }
        was_waiting
    }

    /// marks the input terminally failed, draining queued chunks. returns
    /// true if EOF had already been seen (nothing more was ever coming).
    pub fn fail_all_content(&self, err: Arc<std::io::Error>) -> bool {
        let (eof_already, cb, fire_failure) = {
            let mut inner = self.inner.lock().unwrap();
            let eof_already = matches!(inner.special, Some(SpecialChunk::Eof));
            inner.queue.clear();
            if !matches!(inner.special, Some(SpecialChunk::Error(_))) {
                inner.special = Some(SpecialChunk::Error(err));
            }
            let fire_failure = !inner.ended;
            inner.ended = true;
            (eof_already, inner.take_producible(), fire_failure)
        };
        if fire_failure {
            self.phase_queue.push(Phase::RequestFailure);
        }
        if let Some(cb) = cb {
            cb();
        }
        eof_already
    }

    /// best-effort drain used during completion. true iff all remaining
    /// input is consumed without error.
    pub fn consume_all(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        !matches!(inner.special, Some(SpecialChunk::Error(_)))
    }

    /// true if the request body had not reached EOF (or had buffered data
    /// the application never read) at the time of the call -- used to
    /// decide the persistence rewrite at completion (spec.md §6/§7, Property
    /// P7).
    pub fn had_unread(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.queue.is_empty() || !matches!(inner.special, Some(SpecialChunk::Eof))
    }
}
