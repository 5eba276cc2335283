//! The interface we need from the transport underneath a reader.

/// Flow control for a push-driven transport.
///
/// A [`ThrottledReader`](crate::ThrottledReader) calls these to stop and
/// restart the flow of incoming data.  The reader keeps track of whether it
/// has paused the transport, and will not normally pause a paused transport
/// or resume a running one; implementations should nonetheless treat such
/// calls as no-ops rather than errors.  Likewise, `pause` on a transport that
/// is already being torn down must be tolerated.
///
/// These methods are called with the reader's internal state locked, so
/// they must not call back into the reader (for instance by feeding it
/// data synchronously).  Deliver data from a separate task instead.
///
/// A reader drops its transport when it is closed, so a transport may hold
/// on to the reader's [`ReaderFeed`](crate::ReaderFeed) without creating a
/// reference cycle.
pub trait Transport: Send + Sync + 'static {
    /// Stop delivering data until [`resume`](Transport::resume) is called.
    fn pause(&self);

    /// Start delivering data again.
    fn resume(&self);
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn pause(&self) {
        (**self).pause();
    }

    fn resume(&self) {
        (**self).resume();
    }
}
