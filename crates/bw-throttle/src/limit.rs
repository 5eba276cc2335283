//! A validated bandwidth limit.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A rate limit, in bytes per second.
///
/// Always positive and finite: there is no way to construct a `RateLimit`
/// that would let nothing through, or let everything through.  "Unlimited"
/// is expressed as `Option::<RateLimit>::None`.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct RateLimit(f64);

impl RateLimit {
    /// Make a new `RateLimit` of `bytes_per_sec`.
    ///
    /// Return [`Error::InvalidArgument`] unless `bytes_per_sec` is a
    /// positive, finite number.
    pub fn new(bytes_per_sec: f64) -> Result<Self> {
        if bytes_per_sec.is_finite() && bytes_per_sec > 0.0 {
            Ok(RateLimit(bytes_per_sec))
        } else {
            Err(Error::InvalidArgument(format!(
                "rate limit must be greater than 0 bytes per second, not {}",
                bytes_per_sec
            )))
        }
    }

    /// Return the number of bytes per second this limit allows.
    pub fn bytes_per_sec(self) -> f64 {
        self.0
    }

    /// Return how long it takes to transfer `n_bytes` without going over
    /// this limit.
    ///
    /// Saturates at `Duration::MAX` for absurdly large inputs.
    pub fn time_for(self, n_bytes: u64) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let secs = n_bytes as f64 / self.0;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

impl TryFrom<f64> for RateLimit {
    type Error = Error;

    fn try_from(bytes_per_sec: f64) -> Result<Self> {
        RateLimit::new(bytes_per_sec)
    }
}

impl From<RateLimit> for f64 {
    fn from(limit: RateLimit) -> f64 {
        limit.0
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} B/s", self.0)
    }
}
