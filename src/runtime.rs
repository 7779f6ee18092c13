//! Default [`Executor`]/[`Scheduler`] implementations backed by `tokio`.
//!
//! Replaces the teacher's `util/timer.rs::KeepAlive` (an `AsyncWrite`-style
//! `Future` a single `async fn` polls alongside the connection) with plain
//! callback scheduling: this crate's [`Channel`](crate::channel::Channel) is
//! not itself a future (spec.md §4.4, "is a `Runnable`"), so rescheduling it
//! and arming timeouts are one-shot calls a `tokio` task performs on the
//! crate's behalf, not something polled from inside the channel loop.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::channel::Channel;
use crate::traits::{Executor, Scheduler, TimerHandle};

/// runs the channel loop on the ambient `tokio` runtime via `tokio::spawn`,
/// moving it off whatever thread requested the reschedule (parser callback,
/// timer, or write-completion).
#[derive(Clone, Default)]
pub struct TokioExecutor;

impl Executor for TokioExecutor {
    fn execute(&self, channel: Arc<Channel>) {
        tokio::spawn(async move {
            trace!(target: "xitca_channel::runtime", "channel rescheduled");
            channel.run();
        });
    }
}

/// one-shot async-timeout timers backed by `tokio::time::sleep`, cancelled
/// via `tokio::task::JoinHandle::abort`.
#[derive(Clone, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> Box<dyn TimerHandle> {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        Box::new(TokioTimerHandle(handle))
    }
}

struct TokioTimerHandle(tokio::task::JoinHandle<()>);

impl TimerHandle for TokioTimerHandle {
    fn cancel(&self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn scheduled_callback_fires_after_delay() {
        let scheduler = TokioScheduler;
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let _handle = scheduler.schedule(
            Duration::from_millis(10),
            Box::new(move || fired2.store(true, Ordering::SeqCst)),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_timer_does_not_fire() {
        let scheduler = TokioScheduler;
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let handle = scheduler.schedule(
            Duration::from_millis(50),
            Box::new(move || fired2.store(true, Ordering::SeqCst)),
        );
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
