//! Rate accounting: how many bytes have we seen, and since when?

use std::time::{Duration, Instant};

use tor_rtcompat::SleepProvider;
use tracing::trace;

use crate::{RateLimit, Result};

/// A window of observed IO, used to estimate how fast bytes are arriving.
///
/// The window starts at some instant and counts every byte registered since
/// then.  Comparing the count against a [`RateLimit`] tells us how long the
/// bytes _should_ have taken to arrive.
#[derive(Clone, Debug)]
pub(crate) struct RateWindow {
    /// When did this window start?
    start: Instant,
    /// How many bytes have been registered since `start`?
    bytes: u64,
}

impl RateWindow {
    /// Start a new, empty window at `now`.
    pub(crate) fn new(now: Instant) -> Self {
        RateWindow { start: now, bytes: 0 }
    }

    /// Register `n` bytes of IO.
    pub(crate) fn add(&mut self, n: usize) {
        self.bytes = self.bytes.saturating_add(n as u64);
    }

    /// Discard everything registered so far and restart the window at `now`.
    pub(crate) fn reset(&mut self, now: Instant) {
        self.start = now;
        self.bytes = 0;
    }

    /// Return the number of bytes registered in this window.
    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Return how much time has passed between the window start and `now`.
    pub(crate) fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start)
    }

    /// If the bytes in this window arrived faster than `limit` allows,
    /// return how much longer we would have to wait (as of `now`) to get
    /// back within the limit.  Otherwise return `None`.
    pub(crate) fn overshoot(&self, limit: RateLimit, now: Instant) -> Option<Duration> {
        let expected = limit.time_for(self.bytes);
        let elapsed = self.elapsed(now);
        (expected > elapsed).then(|| expected.saturating_sub(elapsed))
    }

    /// Return the observed rate in bytes per second, or `None` if no time has
    /// passed since the window started.
    pub(crate) fn rate(&self, now: Instant) -> Option<f64> {
        let elapsed = self.elapsed(now);
        #[allow(clippy::cast_precision_loss)]
        let bytes = self.bytes as f64;
        (!elapsed.is_zero()).then(|| bytes / elapsed.as_secs_f64())
    }
}

/// Throttle for IO operations.
///
/// Register IO with [`add_io`](Throttle::add_io); afterwards
/// [`time_left`](Throttle::time_left) says how long to wait before the
/// observed rate drops back to the limit.  Call
/// [`reset_io`](Throttle::reset_io) to begin measuring afresh.
///
/// [`ThrottledReader`](crate::ThrottledReader) does its own accounting; this
/// type is for code that paces itself, for example by calling
/// [`wait_remaining`](Throttle::wait_remaining) between operations.
#[derive(Clone, Debug)]
pub struct Throttle {
    /// The limit we're enforcing.
    limit: RateLimit,
    /// The IO observed so far.
    window: RateWindow,
}

impl Throttle {
    /// Make a new `Throttle` for `limit`, starting its measurement at `now`.
    pub fn new(limit: RateLimit, now: Instant) -> Self {
        Throttle {
            limit,
            window: RateWindow::new(now),
        }
    }

    /// Return the limit this throttle enforces.
    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Change the limit to `bytes_per_sec`.
    ///
    /// On [`Error::InvalidArgument`](crate::Error::InvalidArgument), the old
    /// limit is kept.
    pub fn set_limit(&mut self, bytes_per_sec: f64) -> Result<()> {
        self.limit = RateLimit::new(bytes_per_sec)?;
        Ok(())
    }

    /// Register `byte_count` bytes of IO.
    pub fn add_io(&mut self, byte_count: usize) {
        self.window.add(byte_count);
        trace!(
            "throttle: added {} bytes, now {}",
            byte_count,
            self.window.bytes()
        );
    }

    /// Forget all registered IO, and start measuring again at `now`.
    pub fn reset_io(&mut self, now: Instant) {
        self.window.reset(now);
        trace!("throttle: reset IO");
    }

    /// Return the number of bytes registered since the last reset.
    pub fn io(&self) -> u64 {
        self.window.bytes()
    }

    /// Return how long, as of `now`, we must wait until the registered IO is
    /// within the limit.
    pub fn time_left(&self, now: Instant) -> Duration {
        self.window
            .overshoot(self.limit, now)
            .unwrap_or(Duration::ZERO)
    }

    /// Return the observed rate, in bytes per second.
    ///
    /// Returns `None` if no time has passed since measurement started, since
    /// the rate is undefined then.
    pub fn current_rate(&self, now: Instant) -> Option<f64> {
        self.window.rate(now)
    }

    /// Return true if the registered IO is within the limit as of `now`.
    pub fn within_limit(&self, now: Instant) -> bool {
        self.window.overshoot(self.limit, now).is_none()
    }

    /// Sleep until the registered IO is within the limit.
    pub async fn wait_remaining<R: SleepProvider>(&self, runtime: &R) {
        let left = self.time_left(runtime.now());
        trace!("throttle: sleeping for {:?}", left);
        if !left.is_zero() {
            runtime.sleep(left).await;
        }
    }
}
