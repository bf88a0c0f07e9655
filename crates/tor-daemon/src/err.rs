//! Declare an error type for the `tor-daemon` crate.

use std::sync::Arc;

use crate::config::ConfigBuildError;
use crate::job::ActionKind;

/// Classification of an error arising while driving a tor daemon.
///
/// Get the kind via [`HasKind::kind`] and compare it with equality or
/// matching; for reporting, use the whole error, which carries more
/// context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[non_exhaustive]
pub enum ErrorKind {
    /// One or more configuration values were invalid or incompatible.
    ///
    /// Produced before any I/O happens.
    #[display("invalid configuration")]
    InvalidConfig,

    /// A filesystem or socket operation failed.
    #[display("I/O failure")]
    Io,

    /// tor did not reach readiness, or reported a configuration error
    /// while starting.
    #[display("tor process failed to start")]
    ProcessStart,

    /// Framing, correlation, or authentication failure on the control
    /// connection.
    #[display("control protocol failure")]
    Protocol,

    /// tor answered a command with a well-formed error reply.
    #[display("command rejected by tor")]
    ControlRejected,

    /// A deadline elapsed.
    #[display("operation timed out")]
    Timeout,

    /// The job was cancelled before it ran.
    #[display("job cancelled")]
    Cancelled,

    /// The job was interrupted by a conflicting lifecycle action.
    #[display("job interrupted by a lifecycle action")]
    InterruptedByStop,

    /// The platform cannot perform the requested operation.
    #[display("operation unsupported on this platform")]
    Unsupported,

    /// Another runtime already uses one of the requested directories.
    #[display("environment directories already in use")]
    EnvInUse,

    /// A command needs a running daemon and there is none.
    #[display("tor daemon is not running")]
    DaemonNotRunning,

    /// Startup failed repeatedly; an explicit new start is required.
    #[display("giving up after repeated startup failures")]
    StartupFailedRepeatedly,
}

/// Errors that can be categorized as belonging to an [`ErrorKind`].
pub trait HasKind {
    /// Return the kind of this error.
    fn kind(&self) -> ErrorKind;
}

/// An error from the tor runtime.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The runtime's own configuration was unusable.
    #[error("Invalid runtime configuration")]
    Config(#[from] ConfigBuildError),

    /// The tor configuration was unusable.
    #[error("Invalid tor configuration")]
    Torrc(#[from] tor_torrc::TorrcError),

    /// A filesystem or socket operation failed.
    #[error("I/O failure: {context}")]
    Io {
        /// What we were doing.
        context: String,
        /// The failure itself.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// A private directory failed its permission check.
    #[error("Insecure directory")]
    DirPermissions(#[source] Arc<fs_mistrust::Error>),

    /// The control connection failed, or tor rejected a command.
    #[error(transparent)]
    Control(#[from] tor_ctrl::Error),

    /// tor did not come up.
    #[error("{0}")]
    ProcessStart(Arc<ProcessStartError>),

    /// The job was cancelled while still enqueued.
    #[error("Job cancelled")]
    Cancelled,

    /// The job was interrupted by a conflicting lifecycle action.
    #[error("Job interrupted by a pending {by} action")]
    InterruptedByStop {
        /// The action that won.
        by: ActionKind,
    },

    /// A command was dispatched with no live control connection.
    #[error("tor daemon is not running")]
    NotRunning,

    /// The runtime has been destroyed.
    #[error("Runtime destroyed")]
    Destroyed,

    /// One of the requested directories is already owned by another
    /// runtime in this process.
    #[error("Directory {0:?} is already in use by another runtime")]
    EnvInUse(String),

    /// Too many consecutive startup failures; further starts are rejected
    /// until the consumer asks for one explicitly again.
    #[error("{failures} consecutive startup failures; refusing to start again")]
    TooManyFailures {
        /// How many times startup failed in a row.
        failures: u32,
    },

    /// The platform cannot do what the configuration asks.
    #[error("Not supported on this platform: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Build an [`Error::Io`] with context.
    pub(crate) fn io(context: impl ToString, source: std::io::Error) -> Self {
        Error::Io {
            context: context.to_string(),
            source: Arc::new(source),
        }
    }
}

impl From<fs_mistrust::Error> for Error {
    fn from(e: fs_mistrust::Error) -> Self {
        Error::DirPermissions(Arc::new(e))
    }
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        use ErrorKind as EK;
        match self {
            E::Config(_) | E::Torrc(_) => EK::InvalidConfig,
            E::Io { .. } | E::DirPermissions(_) => EK::Io,
            E::Control(e) => match e {
                tor_ctrl::Error::Rejected { .. } => EK::ControlRejected,
                tor_ctrl::Error::CommandTimeout => EK::Timeout,
                tor_ctrl::Error::Unsupported(_) => EK::Unsupported,
                _ => EK::Protocol,
            },
            E::ProcessStart(_) => EK::ProcessStart,
            E::Cancelled | E::Destroyed => EK::Cancelled,
            E::InterruptedByStop { .. } => EK::InterruptedByStop,
            E::NotRunning => EK::DaemonNotRunning,
            E::EnvInUse(_) => EK::EnvInUse,
            E::TooManyFailures { .. } => EK::StartupFailedRepeatedly,
            E::Unsupported(_) => EK::Unsupported,
        }
    }
}

/// Details of a failed tor startup.
///
/// Carries the collected output tails so that the reason (usually a
/// configuration complaint from tor) is visible in the error itself.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ProcessStartError {
    /// The process's exit code, when it exited before we gave up.
    pub exit_code: Option<i32>,
    /// The last stdout lines we saw.
    pub stdout_tail: Vec<String>,
    /// The last stderr lines we saw.
    pub stderr_tail: Vec<String>,
    /// Why startup was declared failed.
    pub cause: String,
}

impl std::fmt::Display for ProcessStartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tor failed to start: {}", self.cause)?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit code {})", code)?;
        }
        if let Some(last) = self.stdout_tail.last() {
            write!(f, "; last output: {:?}", last)?;
        }
        Ok(())
    }
}

impl std::error::Error for ProcessStartError {}

impl From<ProcessStartError> for Error {
    fn from(e: ProcessStartError) -> Self {
        Error::ProcessStart(Arc::new(e))
    }
}

/// Shorthand for results in this crate.
pub type Result<T> = std::result::Result<T, Error>;
