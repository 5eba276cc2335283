//! Declare an error type for the `bw-throttle` crate.

use std::sync::Arc;

use futures::task::SpawnError;
use thiserror::Error;
use tor_error::{ErrorKind, HasKind};

/// An error originating from the `bw-throttle` crate.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A caller supplied a value we can't accept, such as a rate limit
    /// that is zero, negative, or not a number.
    ///
    /// Nothing was changed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was attempted on a reader that can no longer accept it,
    /// because it has been closed or its stream has ended.
    #[error("Invalid reader state: {0}")]
    InvalidState(&'static str),

    /// The stream ended before the requested number of bytes arrived.
    #[error("Stream ended after {} of {expected} expected bytes", .partial.len())]
    IncompleteRead {
        /// How many bytes the caller asked for.
        expected: usize,
        /// The bytes that did arrive before end of stream.
        partial: Vec<u8>,
    },

    /// The transport reported a failure while feeding us data.
    #[error("Transport failed")]
    Transport(#[source] Arc<std::io::Error>),

    /// Unable to spawn the task that would resume a paused transport.
    #[error("Unable to spawn {spawning}")]
    Spawn {
        /// What we were trying to spawn.
        spawning: &'static str,
        /// What happened when we tried to spawn it.
        #[source]
        cause: Arc<SpawnError>,
    },

    /// A throttle configuration was internally inconsistent.
    #[error("Invalid throttle configuration: {0}")]
    Config(String),
}

impl Error {
    /// Construct a new `Error` from a `SpawnError`.
    pub(crate) fn from_spawn(spawning: &'static str, err: SpawnError) -> Error {
        Error::Spawn {
            spawning,
            cause: Arc::new(err),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(Arc::new(err))
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind as IoKind;
        match err {
            Error::Transport(e) => match Arc::try_unwrap(e) {
                Ok(e) => e,
                Err(e) => std::io::Error::new(e.kind(), Error::Transport(e)),
            },
            Error::IncompleteRead { .. } => std::io::Error::new(IoKind::UnexpectedEof, err),
            Error::InvalidArgument(_) | Error::Config(_) => {
                std::io::Error::new(IoKind::InvalidInput, err)
            }
            Error::InvalidState(_) | Error::Spawn { .. } => std::io::Error::other(err),
        }
    }
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        use ErrorKind as EK;
        match self {
            E::InvalidArgument(_) | E::InvalidState(_) => EK::BadApiUsage,
            E::IncompleteRead { .. } | E::Transport(_) => EK::Other,
            E::Spawn { .. } => EK::Internal,
            E::Config(_) => EK::InvalidConfig,
        }
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

    #[test]
    fn kinds() {
        assert_eq!(
            Error::InvalidArgument("x".into()).kind(),
            ErrorKind::BadApiUsage
        );
        assert_eq!(Error::InvalidState("reader is closed").kind(), ErrorKind::BadApiUsage);
        assert_eq!(Error::Config("x".into()).kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn into_io_error() {
        let e: std::io::Error = Error::IncompleteRead {
            expected: 10,
            partial: vec![1, 2, 3],
        }
        .into();
        assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof);
        assert!(e.to_string().contains("3 of 10"));

        let orig = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let e: std::io::Error = Error::from(orig).into();
        assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset);
    }
}
