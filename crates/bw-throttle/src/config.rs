//! Configuration for a [`ThrottledReader`](crate::ThrottledReader).

use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default buffer size at which we stop reading from the transport.
///
/// Twice the usual 64 KiB stream buffer limit, so that a single large
/// read by the consumer never leaves the transport paused for buffer reasons.
const DEFAULT_HIGH_WATERMARK: usize = 2 * 64 * 1024;

/// Return the low watermark to use when only the high one is given.
fn default_low_watermark(high: usize) -> usize {
    high / 4
}

/// Default age at which an in-budget accounting window is restarted.
const DEFAULT_WINDOW_RESET: Duration = Duration::from_secs(2);

/// Tunable policy for a [`ThrottledReader`](crate::ThrottledReader).
///
/// None of these values affect correctness; they trade memory and
/// responsiveness against the number of pause/resume calls we make.
#[derive(Debug, Clone, Builder, Eq, PartialEq, Serialize, Deserialize)]
#[builder(build_fn(validate = "Self::validate"))]
#[builder(derive(Debug))]
#[serde(default)]
pub struct ThrottleConfig {
    /// Once the buffer holds at least this many bytes, pause the transport.
    #[builder(default = "DEFAULT_HIGH_WATERMARK")]
    pub(crate) high_watermark: usize,

    /// Once the buffer has drained to this many bytes or fewer, the buffer no
    /// longer keeps the transport paused.
    ///
    /// Defaults to a quarter of `high_watermark`.
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) low_watermark: Option<usize>,

    /// How old a rate accounting window may get, while the producer is within
    /// budget, before we start a fresh one.
    ///
    /// Shorter values make the rate estimate follow recent behaviour more
    /// closely; longer values let an idle period pay for a later burst.
    #[builder(default = "DEFAULT_WINDOW_RESET")]
    #[serde(with = "humantime_serde")]
    pub(crate) window_reset: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: None,
            window_reset: DEFAULT_WINDOW_RESET,
        }
    }
}

/// Check that a set of configuration values makes sense together.
fn check_values(high: usize, low: usize, window_reset: Duration) -> std::result::Result<(), String> {
    if high <= low {
        return Err(format!(
            "high_watermark ({}) must be greater than low_watermark ({})",
            high, low
        ));
    }
    if window_reset.is_zero() {
        return Err("window_reset must be nonzero".into());
    }
    Ok(())
}

impl ThrottleConfigBuilder {
    /// Check that the values in this builder are consistent.
    fn validate(&self) -> std::result::Result<(), String> {
        let high = self.high_watermark.unwrap_or(DEFAULT_HIGH_WATERMARK);
        let low = self
            .low_watermark
            .flatten()
            .unwrap_or_else(|| default_low_watermark(high));
        check_values(high, low, self.window_reset.unwrap_or(DEFAULT_WINDOW_RESET))
    }
}

impl ThrottleConfig {
    /// Return a new builder for a `ThrottleConfig`.
    pub fn builder() -> ThrottleConfigBuilder {
        ThrottleConfigBuilder::default()
    }

    /// Return the high watermark, in bytes.
    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }

    /// Return the low watermark, in bytes.
    pub fn low_watermark(&self) -> usize {
        self.low_watermark
            .unwrap_or_else(|| default_low_watermark(self.high_watermark))
    }

    /// Return the maximum age of an in-budget accounting window.
    pub fn window_reset(&self) -> Duration {
        self.window_reset
    }

    /// Check this configuration.
    ///
    /// The builder does this for us, but a configuration that came from a
    /// deserializer has not been checked yet.
    pub(crate) fn check(&self) -> Result<()> {
        check_values(self.high_watermark, self.low_watermark(), self.window_reset)
            .map_err(Error::Config)
    }
}
