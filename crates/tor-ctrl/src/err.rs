//! Declare an error type for the `tor-ctrl` crate.

use std::sync::Arc;

use crate::msg::Status;

/// An error from a control connection.
///
/// This is a separate error type from the daemon-level errors because the
/// connection has no opinion about retries or process lifecycle: every
/// failure here is terminal for the operation (and usually for the
/// connection), and recovery is the caller's concern.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An error from the underlying byte stream.
    ///
    /// (Wrapped in an `Arc` so that one failure can be reported to every
    /// command that was queued on the connection.)
    #[error("Control connection I/O failed")]
    Io(#[source] Arc<std::io::Error>),

    /// The peer sent something that is not valid control protocol.
    ///
    /// Treated exactly like an I/O failure: the connection is unusable
    /// afterwards.
    #[error("Control protocol violated: {0}")]
    Protocol(String),

    /// The connection closed before (or while) the operation completed.
    #[error("Control connection closed")]
    ConnectionLost,

    /// Tor answered with a well-formed non-2xx reply.
    #[error("Tor rejected the command: {status} {first_line}")]
    Rejected {
        /// The reply's status code.
        status: Status,
        /// The first line of the reply, for human eyes.
        first_line: String,
        /// Every line of the reply.
        lines: Vec<String>,
    },

    /// The caller's deadline elapsed before tor answered.
    ///
    /// The command is not retried and the connection stays open; the reply,
    /// when it arrives, is discarded.
    #[error("Command deadline elapsed")]
    CommandTimeout,

    /// We could not authenticate with any method tor offered.
    #[error("Control-port authentication failed: {0}")]
    Auth(String),

    /// The requested operation is not supported on this platform.
    #[error("Not supported on this platform: {0}")]
    Unsupported(&'static str),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    /// Build an [`Error::Rejected`] from a reply's parts.
    pub(crate) fn rejected(status: Status, lines: Vec<String>) -> Self {
        let first_line = lines.first().cloned().unwrap_or_default();
        Error::Rejected {
            status,
            first_line,
            lines,
        }
    }

    /// Build an [`Error::Protocol`].
    pub(crate) fn proto(msg: impl ToString) -> Self {
        Error::Protocol(msg.to_string())
    }
}

/// Shorthand for results in this crate.
pub type Result<T> = std::result::Result<T, Error>;
