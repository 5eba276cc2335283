#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list maintained by maint/add_warning @@

//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

mod config;
mod err;
mod io;
mod limit;
mod reader;
mod registry;
mod throttle;
mod transport;

pub use config::{ThrottleConfig, ThrottleConfigBuilder};
pub use err::Error;
pub use limit::RateLimit;
pub use reader::{ReaderFeed, ReaderStatus, ThrottledReader};
pub use registry::{current_rate_limit, global, limit_rate, unlimit_rate, RateLimitRegistry};
pub use throttle::Throttle;
pub use transport::Transport;

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;
