//! low resolution date/time for reduced syscall overhead when stamping the
//! `Date:` response header.
//!
//! Grounded on `date.rs` in the teacher crate, generalized from
//! `Rc<RefCell<_>>` + `spawn_local` (xitca-http's connections are pinned one
//! per thread) to `Arc<Mutex<_>>` + `tokio::spawn`, since this crate's
//! [`Channel`](crate::channel::Channel) may be driven by any executor thread.

use std::fmt::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use httpdate::HttpDate;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval};

/// Trait for getting current date/time, usually backed by a low-resolution
/// timer to reduce frequent syscalls to the OS.
pub trait DateTime {
    /// The size hint of the slice produced by [`DateTime::with_date`].
    const DATE_VALUE_LENGTH: usize;

    /// closure receives the byte-slice representation of an [`HttpDate`].
    fn with_date<F, O>(&self, f: F) -> O
    where
        F: FnOnce(&[u8]) -> O;

    fn now(&self) -> Instant;
}

/// The length of the byte representation of [`HttpDate`].
pub const DATE_VALUE_LENGTH: usize = 29;

/// byte representation of an [`HttpDate`] plus the [`Instant`] it was taken,
/// refreshed periodically by [`DateTimeService`].
#[derive(Copy, Clone)]
pub struct DateTimeState {
    pub date: [u8; DATE_VALUE_LENGTH],
    pub now: Instant,
}

impl Default for DateTimeState {
    fn default() -> Self {
        Self::new()
    }
}

impl DateTimeState {
    pub fn new() -> Self {
        let mut state = Self {
            date: [0; DATE_VALUE_LENGTH],
            now: Instant::now(),
        };
        let _ = write!(state, "{}", HttpDate::from(SystemTime::now()));
        state
    }
}

impl Write for DateTimeState {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.date[..].copy_from_slice(s.as_bytes());
        Ok(())
    }
}

/// struct with the `Date` representation updated periodically at a 500
/// millisecond interval by a background task.
pub struct DateTimeService {
    state: Arc<Mutex<DateTimeState>>,
    handle: JoinHandle<()>,
}

impl Drop for DateTimeService {
    fn drop(&mut self) {
        // stop the background update task on drop.
        self.handle.abort();
    }
}

impl Default for DateTimeService {
    fn default() -> Self {
        Self::new()
    }
}

impl DateTimeService {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(DateTimeState::new()));
        let state_clone = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            let mut interval = interval(std::time::Duration::from_millis(500));
            loop {
                interval.tick().await;
                *state_clone.lock().unwrap() = DateTimeState::new();
            }
        });

        Self { state, handle }
    }

    #[inline]
    pub fn get(&self) -> DateTimeHandle<'_> {
        DateTimeHandle(&self.state)
    }
}

/// a handle implementing [`DateTime`] by reading the shared cache.
pub struct DateTimeHandle<'a>(&'a Arc<Mutex<DateTimeState>>);

impl DateTime for DateTimeHandle<'_> {
    const DATE_VALUE_LENGTH: usize = DATE_VALUE_LENGTH;

    #[inline]
    fn with_date<F, O>(&self, f: F) -> O
    where
        F: FnOnce(&[u8]) -> O,
    {
        let state = self.0.lock().unwrap();
        f(&state.date[..])
    }

    #[inline(always)]
    fn now(&self) -> Instant {
        self.0.lock().unwrap().now
    }
}

/// Date handler powered by plain OS system time; useful for testing, where
/// a background-refreshed cache would just add nondeterminism.
pub struct SystemTimeDateTimeHandler;

impl DateTime for SystemTimeDateTimeHandler {
    const DATE_VALUE_LENGTH: usize = DATE_VALUE_LENGTH;

    fn with_date<F, O>(&self, f: F) -> O
    where
        F: FnOnce(&[u8]) -> O,
    {
        let date = HttpDate::from(SystemTime::now()).to_string();
        f(date.as_bytes())
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// dyn-safe handle for stamping a `Date:` header from `OutputPipeline`,
/// which holds its collaborators as trait objects and cannot carry the
/// generic [`DateTime`] trait directly.
pub trait DateSource: Send + Sync {
    fn date_value(&self) -> [u8; DATE_VALUE_LENGTH];
}

impl DateSource for DateTimeService {
    fn date_value(&self) -> [u8; DATE_VALUE_LENGTH] {
        self.get().with_date(|bytes| {
            let mut out = [0u8; DATE_VALUE_LENGTH];
            out.copy_from_slice(bytes);
            out
        })
    }
}

impl DateSource for SystemTimeDateTimeHandler {
    fn date_value(&self) -> [u8; DATE_VALUE_LENGTH] {
        self.with_date(|bytes| {
            let mut out = [0u8; DATE_VALUE_LENGTH];
            out.copy_from_slice(bytes);
            out
        })
    }
}
