//! Channel configuration.
//!
//! Grounded on the teacher's `HttpServiceConfig<const HEADER_LIMIT: usize,
//! READ_BUF_LIMIT: usize, WRITE_BUF_LIMIT: usize>` const-generic pattern
//! (referenced from `h1/dispatcher.rs`/`builder.rs`); the buffer limits keep
//! their const-generic slots, the timeouts become ordinary fields since
//! spec.md has no compile-time-fixed timeout requirement.

use std::time::Duration;

/// header size, and read/write buffer limits (bytes), fixed at compile time
/// the way the teacher's `HttpServiceConfig` const-generics are -- a
/// misconfigured limit is a build-time error, not a runtime surprise.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig<const HEADER_LIMIT: usize = 8192, const READ_BUF_LIMIT: usize = 262_144, const WRITE_BUF_LIMIT: usize = 262_144>
{
    /// connection-level idle timeout between exchanges.
    pub keep_alive_timeout: Duration,
    /// timeout for a request line + headers to fully arrive.
    pub request_head_timeout: Duration,
    /// default `startAsync` suspension timeout when the handler does not
    /// set one explicitly.
    pub async_suspend_timeout: Duration,
    /// whether a `Date:` header is stamped on responses that lack one
    /// (spec.md §6).
    pub set_date_header: bool,
}

impl<const H: usize, const R: usize, const W: usize> ChannelConfig<H, R, W> {
    pub const fn new() -> Self {
        Self {
            keep_alive_timeout: Duration::from_secs(5),
            request_head_timeout: Duration::from_secs(5),
            async_suspend_timeout: Duration::from_secs(30),
            set_date_header: true,
        }
    }

    pub const fn header_limit(&self) -> usize {
        H
    }

    pub const fn read_buf_limit(&self) -> usize {
        R
    }

    pub const fn write_buf_limit(&self) -> usize {
        W
    }

    pub fn keep_alive_timeout(mut self, dur: Duration) -> Self {
        self.keep_alive_timeout = dur;
        self
    }

    pub fn request_head_timeout(mut self, dur: Duration) -> Self {
        self.request_head_timeout = dur;
        self
    }

    pub fn async_suspend_timeout(mut self, dur: Duration) -> Self {
        self.async_suspend_timeout = dur;
        self
    }

    pub fn disable_date_header(mut self) -> Self {
        self.set_date_header = false;
        self
    }
}

impl<const H: usize, const R: usize, const W: usize> Default for ChannelConfig<H, R, W> {
    fn default() -> Self {
        Self::new()
    }
}
