//! Shared rate limit configuration, and the process-wide instance of it.
//!
//! A [`RateLimitRegistry`] remembers the limit that new readers should start
//! with.  Readers that have not been given a limit of their own are told
//! whenever the registry's limit changes; they never go looking for it on
//! their own.

use std::sync::{Arc, Mutex, Weak};

use educe::Educe;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::{RateLimit, Result};

/// Something that wants to hear about changes to a registry's limit.
pub(crate) trait LimitSubscriber: Send + Sync {
    /// The registry's limit has changed to `limit`.
    fn registry_limit_changed(&self, limit: Option<RateLimit>);
}

/// The state behind a [`RateLimitRegistry`].
#[derive(Default, Educe)]
#[educe(Debug)]
struct RegistryInner {
    /// The current limit, or `None` if we're not throttling.
    limit: Option<RateLimit>,
    /// Everybody who wants to hear about changes to `limit`.
    ///
    /// Entries whose referent has gone away are pruned as we go.
    #[educe(Debug(ignore))]
    subscribers: Vec<Weak<dyn LimitSubscriber>>,
}

/// A rate limit shared among many readers.
///
/// Starts out unthrottled.  This is handle-like: clones refer to the same
/// underlying state.
///
/// Most programs will want the process-wide instance from [`global`]; tests
/// and programs that need several independently-limited groups of readers
/// can make their own.
#[derive(Clone, Debug, Default)]
pub struct RateLimitRegistry {
    /// The shared state.
    inner: Arc<Mutex<RegistryInner>>,
}

impl RateLimitRegistry {
    /// Make a new, unthrottled registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the limit to `bytes_per_sec`, and tell every reader that follows
    /// this registry.
    ///
    /// Fails with [`Error::InvalidArgument`](crate::Error::InvalidArgument)
    /// unless `bytes_per_sec` is positive; in that case nothing changes.
    pub fn set_limit(&self, bytes_per_sec: f64) -> Result<()> {
        let limit = RateLimit::new(bytes_per_sec)?;
        self.update(Some(limit));
        Ok(())
    }

    /// Remove the limit, and tell every reader that follows this registry.
    pub fn clear_limit(&self) {
        self.update(None);
    }

    /// Return the current limit, if any.
    pub fn current_limit(&self) -> Option<RateLimit> {
        self.inner.lock().expect("poisoned lock").limit
    }

    /// Register `sub` to hear about changes, and tell it the current limit.
    ///
    /// The first notification is delivered under the same lock as every
    /// later one, so `sub` can't see updates out of order.
    pub(crate) fn subscribe(&self, sub: Arc<dyn LimitSubscriber>) {
        let mut inner = self.inner.lock().expect("poisoned lock");
        inner.subscribers.retain(|s| s.strong_count() > 0);
        inner.subscribers.push(Arc::downgrade(&sub));
        sub.registry_limit_changed(inner.limit);
    }

    /// Store `limit` and notify all subscribers.
    fn update(&self, limit: Option<RateLimit>) {
        let mut inner = self.inner.lock().expect("poisoned lock");
        inner.limit = limit;
        inner.subscribers.retain(|s| s.strong_count() > 0);
        match limit {
            Some(l) => debug!("rate limit set to {}", l),
            None => debug!("rate limit removed"),
        }
        // We notify while holding the lock, so that two racing updates
        // reach every subscriber in the same order they were stored.
        // Subscribers never take this lock, so this can't deadlock.
        for sub in inner.subscribers.iter().filter_map(Weak::upgrade) {
            sub.registry_limit_changed(limit);
        }
    }

    /// Return the number of live subscribers.
    #[cfg(test)]
    pub(crate) fn n_subscribers(&self) -> usize {
        let inner = self.inner.lock().expect("poisoned lock");
        inner
            .subscribers
            .iter()
            .filter(|s| s.strong_count() > 0)
            .count()
    }
}

/// The process-wide registry.
static GLOBAL: Lazy<RateLimitRegistry> = Lazy::new(RateLimitRegistry::new);

/// Return the process-wide [`RateLimitRegistry`].
pub fn global() -> &'static RateLimitRegistry {
    &GLOBAL
}

/// Limit every reader that follows the process-wide registry to
/// `bytes_per_sec`.
///
/// ```
/// bw_throttle::limit_rate(200.0 * 1024.0)?;
/// assert!(bw_throttle::current_rate_limit().is_some());
/// bw_throttle::unlimit_rate();
/// # Ok::<(), bw_throttle::Error>(())
/// ```
pub fn limit_rate(bytes_per_sec: f64) -> Result<()> {
    global().set_limit(bytes_per_sec)
}

/// Stop limiting readers that follow the process-wide registry.
pub fn unlimit_rate() {
    global().clear_limit();
}

/// Return the process-wide rate limit, if any.
pub fn current_rate_limit() -> Option<RateLimit> {
    global().current_limit()
}
