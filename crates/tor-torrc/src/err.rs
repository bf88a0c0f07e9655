//! Declare an error type for the `tor-torrc` crate.

/// An error produced while building or parsing a Tor configuration.
///
/// All of these errors are produced before any I/O happens: a configuration
/// that builds successfully is one we are willing to hand to `tor`.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum TorrcError {
    /// A mandatory field was not present.
    #[error("Field was not provided: {0}")]
    MissingField(String),

    /// A single option had an argument that proved to be unusable.
    #[error("Value of {option} was incorrect: {problem}")]
    Invalid {
        /// The option whose argument was rejected.
        option: String,
        /// What was wrong with it.
        problem: String,
    },

    /// An argument of the wrong kind was supplied for an option.
    #[error("Option {option} does not take a {given} argument")]
    WrongArgumentKind {
        /// The option in question.
        option: String,
        /// A short label for the argument kind we were given.
        given: &'static str,
    },

    /// A hidden-service option appeared outside a hidden-service block.
    #[error("{option} is not valid outside a hidden-service block")]
    StrayHsOption {
        /// The offending option.
        option: String,
    },

    /// An AF_UNIX listener path exceeded the platform's limit.
    #[error("Unix socket path {path:?} is too long ({len} > {max} bytes)")]
    UnixPathTooLong {
        /// The path, lossily converted for display.
        path: String,
        /// Its length in bytes.
        len: usize,
        /// The platform limit it exceeded.
        max: usize,
    },

    /// We could not make sense of a line in a torrc document.
    #[error("Cannot parse torrc line {line}: {problem}")]
    Parse {
        /// 1-based line number within the document.
        line: usize,
        /// What went wrong on that line.
        problem: String,
    },
}

impl From<derive_builder::UninitializedFieldError> for TorrcError {
    fn from(val: derive_builder::UninitializedFieldError) -> Self {
        TorrcError::MissingField(val.field_name().to_string())
    }
}

impl TorrcError {
    /// Return an [`TorrcError::Invalid`] for `option`, with the given problem
    /// description.
    pub(crate) fn invalid(option: impl ToString, problem: impl ToString) -> Self {
        TorrcError::Invalid {
            option: option.to_string(),
            problem: problem.to_string(),
        }
    }
}
