//! A buffered reader that paces a push-driven transport.
//!
//! ## Design
//!
//! The transport pushes chunks at us with [`ThrottledReader::feed`]; the
//! consumer pulls them out with [`ThrottledReader::read`] and friends.  In
//! between, we keep two independent reasons to hold the transport paused:
//!
//! * **Rate.** Every chunk is counted against an accounting window.  When the
//!   window holds more bytes than the limit allows for the time it covers,
//!   we pause, and arrange for a timer to resume us once enough time has
//!   passed.  There is never more than one such timer: scheduling a new one
//!   always cancels the old one first.
//! * **Buffer.** When the consumer falls behind and the buffer reaches the
//!   high watermark, we pause until it drains to the low watermark.
//!
//! The transport is paused while either reason holds, and resumed only when
//! neither does.
//!
//! All of this state lives behind one mutex, shared with the resume timer
//! task and with any [`ReaderFeed`] handles.  Transport calls are made with
//! the mutex held, so they are issued in the same order as the state
//! changes that caused them.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use event_listener::{Event, EventListener};
use futures::future::{self, AbortHandle};
use futures::task::SpawnExt as _;
use futures::FutureExt as _;
use pin_project::{pin_project, pinned_drop};
use tor_error::ErrorReport as _;
use tor_rtcompat::Runtime;
use tracing::{debug, trace, warn};

use crate::registry::{LimitSubscriber, RateLimitRegistry};
use crate::throttle::RateWindow;
use crate::{Error, RateLimit, Result, ThrottleConfig, Transport};

/// Where a [`ThrottledReader`] is in its life.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ReaderStatus {
    /// The transport is free to deliver data.
    Active,
    /// The transport is paused because data arrived faster than the limit.
    PausedRate,
    /// The transport is paused because the buffer is full.
    PausedBuffer,
    /// The transport is paused for both of the above reasons.
    PausedBoth,
    /// The reader has been closed.  Nothing more will happen.
    Closed,
}

/// A scheduled resumption of the transport.
#[derive(Debug)]
struct PendingResume {
    /// Identifies this timer, so that a superseded one can tell it has
    /// been superseded even if it wakes up before it is aborted.
    id: u64,
    /// Used to cancel the timer task.
    handle: AbortHandle,
    /// When the timer is due to fire.
    deadline: Option<Instant>,
}

/// Everything about a reader that can change.
pub(crate) struct ReaderState {
    /// Bytes received but not yet read.
    buffer: VecDeque<u8>,
    /// The limit we're currently enforcing, if any.
    limit: Option<RateLimit>,
    /// True if `limit` was set on this reader directly, so that registry
    /// changes no longer apply.
    limit_overridden: bool,
    /// Rate accounting for incoming data.
    window: RateWindow,
    /// True if the transport must stay paused because of the rate limit.
    paused_for_rate: bool,
    /// True if the transport must stay paused because the buffer is full.
    paused_for_buffer: bool,
    /// The transport we are pacing.
    ///
    /// Released when the reader is closed, so that a transport holding our
    /// [`ReaderFeed`] doesn't keep us both alive.
    transport: Option<Box<dyn Transport>>,
    /// True if we have paused the transport and not yet resumed it.
    transport_paused: bool,
    /// The timer that will clear `paused_for_rate`, if there is one.
    pending_resume: Option<PendingResume>,
    /// Id to give the next resume timer.
    next_timer_id: u64,
    /// True if the transport has told us there is no more data.
    eof: bool,
    /// A failure reported by the transport, if any.
    failure: Option<Arc<io::Error>>,
    /// True once the reader has been closed.
    closed: bool,
}

impl ReaderState {
    /// Return a new state for a reader of `transport`, created at `now`.
    fn new(transport: Box<dyn Transport>, now: Instant) -> Self {
        ReaderState {
            buffer: VecDeque::new(),
            limit: None,
            limit_overridden: false,
            window: RateWindow::new(now),
            paused_for_rate: false,
            paused_for_buffer: false,
            transport: Some(transport),
            transport_paused: false,
            pending_resume: None,
            next_timer_id: 0,
            eof: false,
            failure: None,
            closed: false,
        }
    }

    /// Return true if no more data will ever be added to the buffer.
    fn at_end(&self) -> bool {
        self.eof || self.closed
    }

    /// Cancel the pending resume timer, if any.
    fn cancel_pending_resume(&mut self) {
        if let Some(pending) = self.pending_resume.take() {
            pending.handle.abort();
            trace!("cancelled resume timer {}", pending.id);
        }
    }

    /// Update `paused_for_buffer` to reflect the current buffer size.
    ///
    /// Between the watermarks, the flag keeps its previous value.
    fn check_buffer(&mut self, config: &ThrottleConfig) {
        let len = self.buffer.len();
        if len >= config.high_watermark() {
            if !self.paused_for_buffer {
                trace!("buffer holds {} bytes; over high watermark", len);
            }
            self.paused_for_buffer = true;
        } else if len <= config.low_watermark() {
            if self.paused_for_buffer {
                trace!("buffer holds {} bytes; under low watermark", len);
            }
            self.paused_for_buffer = false;
        }
    }

    /// Take up to `max` bytes from the front of the buffer.
    ///
    /// Returns an empty vector at end of stream, and `None` if the caller
    /// should wait for more data.
    pub(crate) fn take_front(&mut self, max: usize) -> Option<Vec<u8>> {
        if max == 0 {
            Some(Vec::new())
        } else if !self.buffer.is_empty() {
            let n = max.min(self.buffer.len());
            Some(self.buffer.drain(..n).collect())
        } else if self.at_end() {
            Some(Vec::new())
        } else {
            None
        }
    }

    /// Copy bytes from the front of the buffer into `buf`.
    ///
    /// Returns 0 at end of stream, and `None` if the caller should wait for
    /// more data.
    pub(crate) fn take_into(&mut self, buf: &mut [u8]) -> Option<usize> {
        if buf.is_empty() {
            Some(0)
        } else if !self.buffer.is_empty() {
            let n = buf.len().min(self.buffer.len());
            for (dst, src) in buf.iter_mut().zip(self.buffer.drain(..n)) {
                *dst = src;
            }
            Some(n)
        } else if self.at_end() {
            Some(0)
        } else {
            None
        }
    }

    /// Take bytes from the front of the buffer up to and including the first
    /// newline, or everything buffered if there is no newline yet.
    fn take_line_part(&mut self) -> Option<Vec<u8>> {
        if !self.buffer.is_empty() {
            let n = self
                .buffer
                .iter()
                .position(|b| *b == b'\n')
                .map_or(self.buffer.len(), |pos| pos + 1);
            Some(self.buffer.drain(..n).collect())
        } else if self.at_end() {
            Some(Vec::new())
        } else {
            None
        }
    }

    /// Return the current [`ReaderStatus`].
    fn status(&self) -> ReaderStatus {
        match (self.closed, self.paused_for_rate, self.paused_for_buffer) {
            (true, _, _) => ReaderStatus::Closed,
            (false, false, false) => ReaderStatus::Active,
            (false, true, false) => ReaderStatus::PausedRate,
            (false, false, true) => ReaderStatus::PausedBuffer,
            (false, true, true) => ReaderStatus::PausedBoth,
        }
    }
}

/// The part of a reader shared between its handles and its timer task.
pub(crate) struct Shared<R: Runtime> {
    /// Used for the current time, for sleeping, and to spawn timer tasks.
    runtime: R,
    /// Our watermarks and window policy.
    config: ThrottleConfig,
    /// Everything that changes.
    state: Mutex<ReaderState>,
    /// Notified whenever there may be something new for a reader to see.
    data_ready: Event,
    /// A reference to ourself, for timer tasks.
    this: Weak<Shared<R>>,
}

impl<R: Runtime> Shared<R> {
    /// Lock and return our state.
    fn lock(&self) -> MutexGuard<'_, ReaderState> {
        self.state.lock().expect("poisoned lock")
    }

    /// Pause or resume the transport so that it matches our flags.
    ///
    /// Never issues a call that would not change the transport's state, and
    /// never touches the transport once we are closed.
    fn sync_transport(&self, st: &mut ReaderState) {
        if st.closed {
            return;
        }
        let Some(transport) = &st.transport else {
            return;
        };
        let want_paused = st.paused_for_rate || st.paused_for_buffer;
        if want_paused && !st.transport_paused {
            transport.pause();
            st.transport_paused = true;
            debug!(
                "paused transport (rate: {}, buffer: {})",
                st.paused_for_rate, st.paused_for_buffer
            );
        } else if !want_paused && st.transport_paused {
            transport.resume();
            st.transport_paused = false;
            debug!("resumed transport");
        }
    }

    /// Re-evaluate whether the data in our window is over the rate limit
    /// as of `now`, scheduling a resume timer if it is.
    fn check_rate(&self, st: &mut ReaderState, now: Instant) -> Result<()> {
        let Some(limit) = st.limit else {
            return Ok(());
        };
        match st.window.overshoot(limit, now) {
            Some(delay) => {
                st.paused_for_rate = true;
                self.schedule_resume(st, delay, now)
            }
            None => {
                if st.paused_for_rate {
                    // We caught up before the timer did: act as if it fired.
                    st.cancel_pending_resume();
                    st.window.reset(now);
                    st.paused_for_rate = false;
                } else if st.window.elapsed(now) >= self.config.window_reset {
                    trace!("restarting rate window");
                    st.window.reset(now);
                }
                Ok(())
            }
        }
    }

    /// Cancel any pending resume timer, then schedule a new one to fire
    /// after `delay`.
    fn schedule_resume(&self, st: &mut ReaderState, delay: Duration, now: Instant) -> Result<()> {
        st.cancel_pending_resume();

        st.next_timer_id += 1;
        let id = st.next_timer_id;
        let sleep = self.runtime.sleep(delay);
        let this = self.this.clone();
        let (timer, handle) = future::abortable(async move {
            sleep.await;
            if let Some(shared) = this.upgrade() {
                shared.resume_timer_fired(id);
            }
        });

        if let Err(e) = self.runtime.spawn(timer.map(|_| ())) {
            // Nothing else would ever clear the flag.
            st.paused_for_rate = false;
            return Err(Error::from_spawn("resume timer", e));
        }
        st.pending_resume = Some(PendingResume {
            id,
            handle,
            deadline: now.checked_add(delay),
        });
        debug!("over rate limit; resume timer {} in {:?}", id, delay);
        Ok(())
    }

    /// Called when the resume timer with `id` has gone off.
    fn resume_timer_fired(&self, id: u64) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        match &st.pending_resume {
            Some(pending) if pending.id == id => {}
            _ => {
                // Superseded while we were waiting for the lock.
                trace!("ignoring stale resume timer {}", id);
                return;
            }
        }
        st.pending_resume = None;
        st.window.reset(self.runtime.now());
        st.paused_for_rate = false;
        trace!("resume timer {} fired", id);
        self.sync_transport(&mut st);
    }

    /// Add `chunk`, received at `arrival`, to the buffer.
    fn feed(&self, chunk: &[u8], arrival: Instant) -> Result<()> {
        let mut st = self.lock();
        if st.closed {
            return Err(Error::InvalidState("reader is closed"));
        }
        if st.eof {
            return Err(Error::InvalidState("stream has already ended"));
        }
        if chunk.is_empty() {
            return Ok(());
        }
        if st.transport_paused {
            trace!("fed {} bytes while paused", chunk.len());
        } else {
            trace!("fed {} bytes", chunk.len());
        }

        st.buffer.extend(chunk.iter().copied());
        st.window.add(chunk.len());
        let outcome = self.check_rate(&mut st, arrival);
        st.check_buffer(&self.config);
        self.sync_transport(&mut st);
        self.data_ready.notify(usize::MAX);
        outcome
    }

    /// Note that the transport has no more data for us.
    fn feed_eof(&self) {
        let mut st = self.lock();
        if !st.eof {
            trace!("end of stream");
        }
        st.eof = true;
        self.data_ready.notify(usize::MAX);
    }

    /// Note that the transport has failed.
    fn feed_error(&self, err: io::Error) {
        let mut st = self.lock();
        if st.failure.is_none() {
            debug!("transport failed: {}", err);
            st.failure = Some(Arc::new(err));
        }
        st.eof = true;
        self.data_ready.notify(usize::MAX);
    }

    /// Change the limit, re-evaluating the rate immediately.
    ///
    /// If `overriding` is false, this is a change from the registry, which
    /// doesn't apply once the reader has a limit of its own.
    fn set_limit(&self, limit: Option<RateLimit>, overriding: bool) -> Result<()> {
        let mut st = self.lock();
        if st.closed {
            return if overriding {
                Err(Error::InvalidState("reader is closed"))
            } else {
                Ok(())
            };
        }
        if overriding {
            st.limit_overridden = true;
        } else if st.limit_overridden {
            return Ok(());
        }

        st.limit = limit;
        let now = self.runtime.now();
        let outcome = match limit {
            Some(l) => {
                debug!("reader limit set to {}", l);
                self.check_rate(&mut st, now)
            }
            None => {
                debug!("reader limit removed");
                st.cancel_pending_resume();
                st.paused_for_rate = false;
                st.window.reset(now);
                Ok(())
            }
        };
        self.sync_transport(&mut st);
        outcome
    }

    /// Mark this reader closed and release its resources.
    fn close(&self) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        st.cancel_pending_resume();
        st.buffer = VecDeque::new();
        let transport = st.transport.take();
        debug!("reader closed");
        self.data_ready.notify(usize::MAX);
        drop(st);
        // Dropped unlocked: the transport's own drop may call back into us.
        drop(transport);
    }

    /// Try to take data from the buffer with `take`.
    ///
    /// On success, return what `take` returned.  If `take` says there is
    /// nothing for us yet, return a listener that will fire when there may
    /// be.
    ///
    /// The listener is created with our state locked, and every change that
    /// could satisfy `take` notifies with the state locked, so no wakeup can
    /// be lost between the two.
    pub(crate) fn take_or_listen<T>(
        &self,
        take: impl FnOnce(&mut ReaderState) -> Option<T>,
    ) -> Result<std::result::Result<T, EventListener>> {
        let mut st = self.lock();
        if st.buffer.is_empty() && !st.closed {
            if let Some(failure) = &st.failure {
                return Err(Error::Transport(Arc::clone(failure)));
            }
        }
        match take(&mut *st) {
            Some(value) => {
                st.check_buffer(&self.config);
                self.sync_transport(&mut st);
                Ok(Ok(value))
            }
            None => Ok(Err(self.data_ready.listen())),
        }
    }

    /// Wait until `take` can take something from the buffer, and return it.
    async fn take<T>(&self, mut take: impl FnMut(&mut ReaderState) -> Option<T>) -> Result<T> {
        loop {
            match self.take_or_listen(&mut take)? {
                Ok(value) => return Ok(value),
                Err(listener) => listener.await,
            }
        }
    }
}

impl<R: Runtime> LimitSubscriber for Shared<R> {
    fn registry_limit_changed(&self, limit: Option<RateLimit>) {
        if let Err(e) = self.set_limit(limit, false) {
            warn!("couldn't apply new rate limit: {}", e.report());
        }
    }
}

/// A buffered, rate-limited reader fed by a push-driven transport.
///
/// Create one per response body (or other stream) you want to pace, hand
/// its [`ReaderFeed`] to whatever receives data from the transport, and
/// read from it as you would from any buffered reader.  It also implements
/// [`AsyncRead`](futures::io::AsyncRead).
///
/// Dropping the reader closes it.
#[pin_project(PinnedDrop)]
pub struct ThrottledReader<R: Runtime> {
    /// State shared with our feed handles and timer task.
    pub(crate) shared: Arc<Shared<R>>,

    /// A listener we're waiting on, if a `poll_read` returned `Pending`.
    #[pin]
    pub(crate) waiting_for: Option<EventListener>,
}

impl<R: Runtime> ThrottledReader<R> {
    /// Make a new reader for data arriving from `transport`.
    ///
    /// The reader starts with `registry`'s current limit, and follows it
    /// until [`set_limit`](Self::set_limit) is called.
    ///
    /// The transport is assumed to be delivering data when this is called.
    /// The reader keeps it only until it is closed.
    pub fn new<T: Transport>(
        runtime: R,
        transport: T,
        config: &ThrottleConfig,
        registry: &RateLimitRegistry,
    ) -> Result<Self> {
        config.check()?;
        let now = runtime.now();
        let shared = Arc::new_cyclic(|this| Shared {
            runtime,
            config: config.clone(),
            state: Mutex::new(ReaderState::new(Box::new(transport), now)),
            data_ready: Event::new(),
            this: this.clone(),
        });
        let subscriber: Arc<dyn LimitSubscriber> = shared.clone();
        registry.subscribe(subscriber);

        Ok(ThrottledReader {
            shared,
            waiting_for: None,
        })
    }

    /// Make a new reader that follows the process-wide rate limit.
    ///
    /// See [`limit_rate`](crate::limit_rate).
    pub fn with_global_limit<T: Transport>(
        runtime: R,
        transport: T,
        config: &ThrottleConfig,
    ) -> Result<Self> {
        Self::new(runtime, transport, config, crate::registry::global())
    }

    /// Return a handle that the transport side can use to feed this reader.
    pub fn feeder(&self) -> ReaderFeed<R> {
        ReaderFeed {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Add `chunk`, which arrived at `arrival`, to the buffer.
    ///
    /// This may pause the transport, if the data is arriving too fast or the
    /// buffer is too full.
    ///
    /// Fails with [`Error::InvalidState`] once the reader is closed or the
    /// stream has ended.  The data is accepted even if `Error::Spawn` is
    /// returned.
    pub fn feed(&self, chunk: &[u8], arrival: Instant) -> Result<()> {
        self.shared.feed(chunk, arrival)
    }

    /// Note that the transport has no more data for us.
    pub fn feed_eof(&self) {
        self.shared.feed_eof();
    }

    /// Note that the transport has failed with `err`.
    ///
    /// Data already buffered can still be read; after that, reads fail.
    pub fn feed_error(&self, err: io::Error) {
        self.shared.feed_error(err);
    }

    /// Read up to `max_bytes` bytes.
    ///
    /// Waits until at least one byte is available.  Returns an empty vector
    /// at end of stream, or once the reader has been closed.
    pub async fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        self.shared.take(|st| st.take_front(max_bytes)).await
    }

    /// Read whatever is available, waiting until there is something.
    ///
    /// Returns an empty vector at end of stream.
    pub async fn read_any(&mut self) -> Result<Vec<u8>> {
        self.read(usize::MAX).await
    }

    /// Read exactly `n` bytes.
    ///
    /// Fails with [`Error::IncompleteRead`] if the stream ends first.
    pub async fn read_exactly(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n.min(self.shared.config.high_watermark()));
        while out.len() < n {
            let want = n - out.len();
            let chunk = self.shared.take(|st| st.take_front(want)).await?;
            if chunk.is_empty() {
                return Err(Error::IncompleteRead {
                    expected: n,
                    partial: out,
                });
            }
            out.extend(chunk);
        }
        Ok(out)
    }

    /// Read up to and including the next `\n`.
    ///
    /// At end of stream, returns whatever is left, which may be empty.
    pub async fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let part = self.shared.take(ReaderState::take_line_part).await?;
            let done = part.is_empty() || part.ends_with(b"\n");
            line.extend(part);
            if done {
                return Ok(line);
            }
        }
    }

    /// Set a limit for this reader alone, or remove it with `None`.
    ///
    /// From now on the reader ignores changes to its registry.
    ///
    /// Fails with [`Error::InvalidArgument`] if the limit is not positive,
    /// and with [`Error::InvalidState`] if the reader is closed.  Either way
    /// nothing changes.
    pub fn set_limit(&self, bytes_per_sec: Option<f64>) -> Result<()> {
        let limit = bytes_per_sec.map(RateLimit::new).transpose()?;
        self.shared.set_limit(limit, true)
    }

    /// Return the limit this reader is enforcing, if any.
    pub fn rate_limit(&self) -> Option<RateLimit> {
        self.shared.lock().limit
    }

    /// Return true if the transport is being held back by the rate limit.
    pub fn is_throttling(&self) -> bool {
        self.shared.lock().paused_for_rate
    }

    /// Return true if we are holding the transport paused, for any reason.
    pub fn is_paused(&self) -> bool {
        self.shared.lock().transport_paused
    }

    /// Return where this reader is in its life.
    pub fn state(&self) -> ReaderStatus {
        self.shared.lock().status()
    }

    /// Return the number of bytes buffered and not yet read.
    pub fn buffered_len(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    /// Return when the transport is next due to be resumed for rate reasons,
    /// if a resume is scheduled.
    pub fn resume_deadline(&self) -> Option<Instant> {
        self.shared
            .lock()
            .pending_resume
            .as_ref()
            .and_then(|p| p.deadline)
    }

    /// Return true if the reader has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Close this reader.
    ///
    /// Cancels any pending resume and discards buffered data.  After this,
    /// reads return end of stream, feeds fail, and the transport is never
    /// touched again.  Closing twice is harmless.
    pub fn close(&self) {
        self.shared.close();
    }
}

#[pinned_drop]
impl<R: Runtime> PinnedDrop for ThrottledReader<R> {
    fn drop(self: Pin<&mut Self>) {
        self.shared.close();
    }
}

impl<R: Runtime> fmt::Debug for ThrottledReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.lock();
        f.debug_struct("ThrottledReader")
            .field("status", &st.status())
            .field("limit", &st.limit)
            .field("buffered", &st.buffer.len())
            .finish_non_exhaustive()
    }
}

/// The producer's handle to a [`ThrottledReader`].
///
/// Cheap to clone.  Does not keep the reader open: once the reader is
/// dropped or closed, feeding fails with [`Error::InvalidState`].
#[derive(Clone)]
pub struct ReaderFeed<R: Runtime> {
    /// State shared with the reader.
    shared: Arc<Shared<R>>,
}

impl<R: Runtime> ReaderFeed<R> {
    /// Add `chunk`, which arrived at `arrival`, to the reader's buffer.
    ///
    /// See [`ThrottledReader::feed`].
    pub fn feed(&self, chunk: &[u8], arrival: Instant) -> Result<()> {
        self.shared.feed(chunk, arrival)
    }

    /// Add `chunk` to the reader's buffer, taking the arrival time from the
    /// runtime's clock.
    pub fn feed_now(&self, chunk: &[u8]) -> Result<()> {
        self.shared.feed(chunk, self.shared.runtime.now())
    }

    /// Note that the transport has no more data.
    pub fn feed_eof(&self) {
        self.shared.feed_eof();
    }

    /// Note that the transport has failed with `err`.
    pub fn feed_error(&self, err: io::Error) {
        self.shared.feed_error(err);
    }

    /// Return true if the reader has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

impl<R: Runtime> fmt::Debug for ReaderFeed<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderFeed").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

    use super::*;
    use assert_matches::assert_matches;
    use futures::AsyncReadExt;
    use std::pin::pin;
    use tor_rtcompat::SleepProvider as _;
    use tor_rtmock::MockRuntime;
    use tracing_test::traced_test;

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    enum Call {
        Pause,
        Resume,
    }
    use Call::*;

    /// A transport that records how it was told to behave.
    #[derive(Default)]
    struct MockTransport(Mutex<Vec<Call>>);

    impl MockTransport {
        fn calls(&self) -> Vec<Call> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn pause(&self) {
            self.0.lock().unwrap().push(Pause);
        }
        fn resume(&self) {
            self.0.lock().unwrap().push(Resume);
        }
    }

    /// Make a reader with its own registry, limited to `bps` if given.
    fn setup(
        rt: &MockRuntime,
        bps: Option<f64>,
        cfg: &ThrottleConfig,
    ) -> (ThrottledReader<MockRuntime>, Arc<MockTransport>) {
        let reg = RateLimitRegistry::new();
        if let Some(bps) = bps {
            reg.set_limit(bps).unwrap();
        }
        let transport = Arc::new(MockTransport::default());
        let reader = ThrottledReader::new(rt.clone(), transport.clone(), cfg, &reg).unwrap();
        (reader, transport)
    }

    async fn advance(rt: &MockRuntime, d: Duration) {
        rt.advance_by(d).await;
        rt.progress_until_stalled().await;
    }

    #[test]
    fn pause_and_resume_on_rate() {
        MockRuntime::test_with_various(|rt| async move {
            let (reader, transport) = setup(&rt, Some(1000.0), &ThrottleConfig::default());
            let t0 = rt.now();
            assert_eq!(reader.state(), ReaderStatus::Active);

            reader.feed(&[0; 2000], t0).unwrap();
            assert_eq!(transport.calls(), vec![Pause]);
            assert_eq!(reader.state(), ReaderStatus::PausedRate);
            assert!(reader.is_throttling());
            assert_eq!(reader.resume_deadline(), Some(t0 + Duration::from_secs(2)));

            advance(&rt, Duration::from_millis(1999)).await;
            assert_eq!(transport.calls(), vec![Pause]);

            advance(&rt, Duration::from_millis(1)).await;
            assert_eq!(transport.calls(), vec![Pause, Resume]);
            assert_eq!(reader.state(), ReaderStatus::Active);
            assert_eq!(reader.resume_deadline(), None);
            assert_eq!(reader.buffered_len(), 2000);
        });
    }

    #[test]
    fn within_budget_never_pauses() {
        MockRuntime::test_with_various(|rt| async move {
            let (reader, transport) = setup(&rt, Some(1000.0), &ThrottleConfig::default());
            for _ in 0..10 {
                advance(&rt, Duration::from_millis(500)).await;
                reader.feeder().feed_now(&[0; 400]).unwrap();
            }
            assert!(transport.calls().is_empty());
            assert_eq!(reader.buffered_len(), 4000);
        });
    }

    #[test]
    fn later_pause_replaces_timer() {
        MockRuntime::test_with_various(|rt| async move {
            let (reader, transport) = setup(&rt, Some(1000.0), &ThrottleConfig::default());
            let t0 = rt.now();

            reader.feed(&[0; 2000], t0).unwrap();
            // Accepted while paused; the deadline moves out.
            reader.feed(&[0; 1000], t0).unwrap();
            assert_eq!(reader.resume_deadline(), Some(t0 + Duration::from_secs(3)));
            assert_eq!(transport.calls(), vec![Pause]);

            advance(&rt, Duration::from_secs(2)).await;
            assert_eq!(transport.calls(), vec![Pause]);
            assert!(reader.is_paused());

            advance(&rt, Duration::from_secs(1)).await;
            assert_eq!(transport.calls(), vec![Pause, Resume]);

            advance(&rt, Duration::from_secs(5)).await;
            assert_eq!(transport.calls(), vec![Pause, Resume]);
        });
    }

    #[test]
    fn buffer_watermarks() {
        MockRuntime::test_with_various(|rt| async move {
            let cfg = ThrottleConfig::builder()
                .high_watermark(100)
                .low_watermark(20)
                .build()
                .unwrap();
            let (mut reader, transport) = setup(&rt, None, &cfg);

            reader.feeder().feed_now(&[7; 150]).unwrap();
            assert_eq!(transport.calls(), vec![Pause]);
            assert_eq!(reader.state(), ReaderStatus::PausedBuffer);

            assert_eq!(reader.read(100).await.unwrap().len(), 100);
            // Between the watermarks: still paused.
            assert_eq!(transport.calls(), vec![Pause]);

            assert_eq!(reader.read(40).await.unwrap(), vec![7; 40]);
            assert_eq!(transport.calls(), vec![Pause, Resume]);
            assert_eq!(reader.state(), ReaderStatus::Active);
            assert_eq!(reader.buffered_len(), 10);
        });
    }

    #[test]
    fn drained_buffer_keeps_rate_pause() {
        MockRuntime::test_with_various(|rt| async move {
            let cfg = ThrottleConfig::builder()
                .high_watermark(1000)
                .low_watermark(100)
                .build()
                .unwrap();
            let (mut reader, transport) = setup(&rt, Some(1000.0), &cfg);

            reader.feeder().feed_now(&[0; 2000]).unwrap();
            assert_eq!(reader.state(), ReaderStatus::PausedBoth);
            assert_eq!(transport.calls(), vec![Pause]);

            assert_eq!(reader.read_any().await.unwrap().len(), 2000);
            assert_eq!(reader.state(), ReaderStatus::PausedRate);
            assert_eq!(transport.calls(), vec![Pause]);

            advance(&rt, Duration::from_secs(2)).await;
            assert_eq!(transport.calls(), vec![Pause, Resume]);
        });
    }

    #[test]
    fn timer_leaves_buffer_pause() {
        MockRuntime::test_with_various(|rt| async move {
            let cfg = ThrottleConfig::builder()
                .high_watermark(1000)
                .low_watermark(100)
                .build()
                .unwrap();
            let (mut reader, transport) = setup(&rt, Some(1000.0), &cfg);

            reader.feeder().feed_now(&[0; 2000]).unwrap();
            advance(&rt, Duration::from_secs(2)).await;
            assert_eq!(reader.state(), ReaderStatus::PausedBuffer);
            assert_eq!(transport.calls(), vec![Pause]);

            reader.read(1950).await.unwrap();
            assert_eq!(transport.calls(), vec![Pause, Resume]);
        });
    }

    #[test]
    #[traced_test]
    fn close_cancels_timer() {
        MockRuntime::test_with_various(|rt| async move {
            let (mut reader, transport) = setup(&rt, Some(1000.0), &ThrottleConfig::default());
            let feed = reader.feeder();
            feed.feed_now(&[0; 2000]).unwrap();
            assert_eq!(transport.calls(), vec![Pause]);

            reader.close();
            assert!(reader.is_closed());
            assert!(feed.is_closed());
            assert_eq!(reader.state(), ReaderStatus::Closed);
            assert_eq!(reader.resume_deadline(), None);
            assert_eq!(reader.buffered_len(), 0);

            advance(&rt, Duration::from_secs(3)).await;
            assert_eq!(transport.calls(), vec![Pause]);

            // Closing again changes nothing.
            reader.close();
            assert_eq!(transport.calls(), vec![Pause]);

            assert_matches!(feed.feed_now(b"x"), Err(Error::InvalidState(_)));
            assert_matches!(reader.set_limit(Some(10.0)), Err(Error::InvalidState(_)));
            assert_eq!(reader.read(10).await.unwrap(), b"");
            // Silently ignored.
            feed.feed_eof();
            assert_eq!(transport.calls(), vec![Pause]);
        });
        assert!(logs_contain("reader closed"));
    }

    /// A transport that owns the feed handle for its own reader.
    #[derive(Default)]
    struct OwningTransport(Mutex<Option<ReaderFeed<MockRuntime>>>);

    impl Transport for OwningTransport {
        fn pause(&self) {}
        fn resume(&self) {}
    }

    #[test]
    fn close_releases_transport() {
        MockRuntime::test_with_various(|rt| async move {
            let reg = RateLimitRegistry::new();
            let transport = Arc::new(OwningTransport::default());
            let reader = ThrottledReader::new(
                rt.clone(),
                transport.clone(),
                &ThrottleConfig::default(),
                &reg,
            )
            .unwrap();
            *transport.0.lock().unwrap() = Some(reader.feeder());
            let weak = Arc::downgrade(&transport);
            drop(transport);
            assert!(weak.upgrade().is_some());
            assert_eq!(reg.n_subscribers(), 1);

            reader.close();
            assert!(weak.upgrade().is_none());
            drop(reader);
            assert_eq!(reg.n_subscribers(), 0);
        });
    }

    #[test]
    fn drop_releases_transport() {
        MockRuntime::test_with_various(|rt| async move {
            let reg = RateLimitRegistry::new();
            let transport = Arc::new(OwningTransport::default());
            let reader = ThrottledReader::new(
                rt.clone(),
                transport.clone(),
                &ThrottleConfig::default(),
                &reg,
            )
            .unwrap();
            *transport.0.lock().unwrap() = Some(reader.feeder());
            let weak = Arc::downgrade(&transport);
            drop(transport);

            drop(reader);
            assert!(weak.upgrade().is_none());
            assert_eq!(reg.n_subscribers(), 0);
            reg.set_limit(100.0).unwrap();
        });
    }

    #[test]
    fn drop_closes() {
        MockRuntime::test_with_various(|rt| async move {
            let (reader, transport) = setup(&rt, Some(1000.0), &ThrottleConfig::default());
            let feed = reader.feeder();
            feed.feed_now(&[0; 3000]).unwrap();
            drop(reader);
            assert!(feed.is_closed());
            assert_matches!(feed.feed_now(b"x"), Err(Error::InvalidState(_)));
            advance(&rt, Duration::from_secs(5)).await;
            assert_eq!(transport.calls(), vec![Pause]);
        });
    }

    #[test]
    fn invalid_limit() {
        MockRuntime::test_with_various(|rt| async move {
            let (reader, transport) = setup(&rt, Some(1000.0), &ThrottleConfig::default());
            reader.feeder().feed_now(&[0; 2000]).unwrap();

            for bad in [0.0, -5.0, f64::NAN, f64::INFINITY] {
                assert_matches!(reader.set_limit(Some(bad)), Err(Error::InvalidArgument(_)));
            }
            assert_eq!(reader.rate_limit().unwrap().bytes_per_sec(), 1000.0);
            assert!(reader.is_throttling());
            assert_eq!(transport.calls(), vec![Pause]);

            advance(&rt, Duration::from_secs(2)).await;
            assert_eq!(transport.calls(), vec![Pause, Resume]);
        });
    }

    #[test]
    fn raising_limit_resumes() {
        MockRuntime::test_with_various(|rt| async move {
            let (reader, transport) = setup(&rt, Some(1000.0), &ThrottleConfig::default());
            reader.feeder().feed_now(&[0; 2000]).unwrap();
            advance(&rt, Duration::from_secs(1)).await;
            assert_eq!(transport.calls(), vec![Pause]);

            reader.set_limit(Some(2000.0)).unwrap();
            assert_eq!(transport.calls(), vec![Pause, Resume]);
            assert_eq!(reader.resume_deadline(), None);

            // The old timer must not fire.
            advance(&rt, Duration::from_secs(3)).await;
            assert_eq!(transport.calls(), vec![Pause, Resume]);
        });
    }

    #[test]
    fn lowering_limit_pauses() {
        MockRuntime::test_with_various(|rt| async move {
            let (reader, transport) = setup(&rt, None, &ThrottleConfig::default());
            let t0 = rt.now();
            reader.feed(&[0; 2000], t0).unwrap();
            assert!(transport.calls().is_empty());

            reader.set_limit(Some(1000.0)).unwrap();
            assert_eq!(transport.calls(), vec![Pause]);
            assert_eq!(reader.resume_deadline(), Some(t0 + Duration::from_secs(2)));

            advance(&rt, Duration::from_secs(2)).await;
            assert_eq!(transport.calls(), vec![Pause, Resume]);
        });
    }

    #[test]
    fn removing_limit_resumes() {
        MockRuntime::test_with_various(|rt| async move {
            let (reader, transport) = setup(&rt, Some(100.0), &ThrottleConfig::default());
            reader.feeder().feed_now(&[0; 1000]).unwrap();
            reader.set_limit(None).unwrap();
            assert_eq!(reader.rate_limit(), None);
            assert_eq!(transport.calls(), vec![Pause, Resume]);

            advance(&rt, Duration::from_secs(20)).await;
            reader.feeder().feed_now(&[0; 100_000]).unwrap();
            assert_eq!(transport.calls(), vec![Pause, Resume]);
        });
    }

    #[test]
    fn follows_registry_until_overridden() {
        MockRuntime::test_with_various(|rt| async move {
            let reg = RateLimitRegistry::new();
            reg.set_limit(1000.0).unwrap();
            let transport = Arc::new(MockTransport::default());
            let reader = ThrottledReader::new(
                rt.clone(),
                transport.clone(),
                &ThrottleConfig::default(),
                &reg,
            )
            .unwrap();
            assert_eq!(reader.rate_limit().unwrap().bytes_per_sec(), 1000.0);

            reg.set_limit(500.0).unwrap();
            assert_eq!(reader.rate_limit().unwrap().bytes_per_sec(), 500.0);

            // A registry change re-evaluates at once.
            advance(&rt, Duration::from_secs(1)).await;
            reader.feeder().feed_now(&[0; 400]).unwrap();
            assert!(transport.calls().is_empty());
            reg.set_limit(100.0).unwrap();
            assert_eq!(transport.calls(), vec![Pause]);
            reg.clear_limit();
            assert_eq!(transport.calls(), vec![Pause, Resume]);

            reader.set_limit(Some(2000.0)).unwrap();
            reg.set_limit(10.0).unwrap();
            assert_eq!(reader.rate_limit().unwrap().bytes_per_sec(), 2000.0);

            reader.set_limit(None).unwrap();
            reg.set_limit(5.0).unwrap();
            assert_eq!(reader.rate_limit(), None);
        });
    }

    #[test]
    fn window_restarts_when_in_budget() {
        MockRuntime::test_with_various(|rt| async move {
            let cfg = ThrottleConfig::builder()
                .window_reset(Duration::from_secs(2))
                .build()
                .unwrap();
            let (reader, transport) = setup(&rt, Some(1000.0), &cfg);
            let feed = reader.feeder();

            // A long idle stretch doesn't bank credit for a later burst.
            advance(&rt, Duration::from_secs(10)).await;
            feed.feed_now(&[0; 100]).unwrap();
            feed.feed_now(&[0; 2000]).unwrap();
            assert_eq!(transport.calls(), vec![Pause]);
            assert_eq!(
                reader.resume_deadline(),
                Some(rt.now() + Duration::from_secs(2))
            );
        });
    }

    #[test]
    fn read_waits_for_data() {
        MockRuntime::test_with_various(|rt| async move {
            let (mut reader, _) = setup(&rt, None, &ThrottleConfig::default());
            let feed = reader.feeder();

            {
                let mut read = pin!(reader.read(3));
                assert!(futures::poll!(&mut read).is_pending());
                feed.feed_now(b"hello").unwrap();
                assert_eq!(read.await.unwrap(), b"hel");
            }

            assert_eq!(reader.read(0).await.unwrap(), b"");
            assert_eq!(reader.read_any().await.unwrap(), b"lo");

            feed.feed_eof();
            assert_eq!(reader.read_any().await.unwrap(), b"");
            assert_matches!(feed.feed_now(b"more"), Err(Error::InvalidState(_)));
            // Even an empty chunk is refused after the end.
            assert_matches!(feed.feed_now(b""), Err(Error::InvalidState(_)));
        });
    }

    #[test]
    fn read_exactly() {
        MockRuntime::test_with_various(|rt| async move {
            let (mut reader, _) = setup(&rt, None, &ThrottleConfig::default());
            let feed = reader.feeder();

            {
                let mut read = pin!(reader.read_exactly(6));
                feed.feed_now(b"abc").unwrap();
                assert!(futures::poll!(&mut read).is_pending());
                feed.feed_now(b"defg").unwrap();
                assert_eq!(read.await.unwrap(), b"abcdef");
            }

            feed.feed_eof();
            let err = reader.read_exactly(5).await.unwrap_err();
            assert_matches!(
                err,
                Error::IncompleteRead { expected: 5, partial } if partial == b"g"
            );
        });
    }

    #[test]
    fn read_line() {
        MockRuntime::test_with_various(|rt| async move {
            let (mut reader, _) = setup(&rt, None, &ThrottleConfig::default());
            let feed = reader.feeder();

            feed.feed_now(b"one\ntw").unwrap();
            assert_eq!(reader.read_line().await.unwrap(), b"one\n");
            {
                let mut line = pin!(reader.read_line());
                assert!(futures::poll!(&mut line).is_pending());
                feed.feed_now(b"o\nthree").unwrap();
                assert_eq!(line.await.unwrap(), b"two\n");
            }
            feed.feed_eof();
            assert_eq!(reader.read_line().await.unwrap(), b"three");
            assert_eq!(reader.read_line().await.unwrap(), b"");
        });
    }

    #[test]
    fn error_after_data() {
        MockRuntime::test_with_various(|rt| async move {
            let (mut reader, _) = setup(&rt, None, &ThrottleConfig::default());
            reader.feeder().feed_now(b"abc").unwrap();
            reader.feed_error(io::Error::new(io::ErrorKind::ConnectionReset, "gone"));

            assert_eq!(reader.read_any().await.unwrap(), b"abc");
            let err = reader.read_any().await.unwrap_err();
            assert_matches!(&err, Error::Transport(e) if e.kind() == io::ErrorKind::ConnectionReset);
            assert_matches!(reader.feed(b"x", rt.now()), Err(Error::InvalidState(_)));
        });
    }

    #[test]
    fn async_read() {
        MockRuntime::test_with_various(|rt| async move {
            let cfg = ThrottleConfig::builder()
                .high_watermark(8)
                .low_watermark(2)
                .build()
                .unwrap();
            let (mut reader, transport) = setup(&rt, None, &cfg);
            let feed = reader.feeder();
            feed.feed_now(b"0123456789").unwrap();
            assert_eq!(transport.calls(), vec![Pause]);

            let mut buf = [0_u8; 4];
            let n = AsyncReadExt::read(&mut reader, &mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"0123");
            assert_eq!(transport.calls(), vec![Pause]);

            let mut buf = [0_u8; 5];
            AsyncReadExt::read_exact(&mut reader, &mut buf).await.unwrap();
            assert_eq!(&buf, b"45678");
            assert_eq!(transport.calls(), vec![Pause, Resume]);

            feed.feed_now(b"ab").unwrap();
            feed.feed_eof();
            let mut rest = Vec::new();
            AsyncReadExt::read_to_end(&mut reader, &mut rest).await.unwrap();
            assert_eq!(rest, b"9ab");
        });
    }

    #[test]
    fn async_read_error() {
        MockRuntime::test_with_various(|rt| async move {
            let (mut reader, _) = setup(&rt, None, &ThrottleConfig::default());
            reader.feed_error(io::Error::new(io::ErrorKind::BrokenPipe, "broken"));
            let mut buf = [0_u8; 4];
            let err = AsyncReadExt::read(&mut reader, &mut buf).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        });
    }

    #[test]
    fn bad_config() {
        MockRuntime::test_with_various(|rt| async move {
            let cfg: ThrottleConfig = toml::from_str("low_watermark = 1000000").unwrap();
            let r = ThrottledReader::new(
                rt.clone(),
                MockTransport::default(),
                &cfg,
                &RateLimitRegistry::new(),
            );
            assert_matches!(r, Err(Error::Config(_)));
        });
    }
}
