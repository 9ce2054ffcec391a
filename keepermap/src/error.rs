//! Error types for KeeperMap operations.

use common::CoordinationError;

/// Error type for KeeperMap operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The engine was given the wrong number of arguments.
    NumberOfArgumentsDoesntMatch(String),

    /// Invalid configuration: root path, primary key or engine argument.
    BadArguments(String),

    /// The engine is disabled because no namespace prefix is configured.
    Disabled(String),

    /// The table's metadata is missing or could not be verified.
    InvalidTable(String),

    /// A write would push the number of keys over the configured limit.
    LimitExceeded {
        new_keys: u64,
        limit: u64,
        would_be: u64,
    },

    /// Errors reported by the coordination service.
    Coordination(CoordinationError),

    /// A batch of asynchronous requests was not answered in time.
    Timeout(String),

    /// Encoding or decoding errors.
    Encoding(String),

    /// Internal errors indicating bugs or invariant violations.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NumberOfArgumentsDoesntMatch(msg) => {
                write!(f, "Number of arguments doesn't match: {}", msg)
            }
            Error::BadArguments(msg) => write!(f, "Bad arguments: {}", msg),
            Error::Disabled(msg) => write!(f, "KeeperMap is disabled: {}", msg),
            Error::InvalidTable(msg) => write!(f, "Invalid table: {}", msg),
            Error::LimitExceeded {
                new_keys,
                limit,
                would_be,
            } => write!(
                f,
                "Limit would be exceeded by inserting {} new key(s). Limit is {}, while the number of keys would be {}",
                new_keys, limit, would_be
            ),
            Error::Coordination(err) => write!(f, "{}", err),
            Error::Timeout(msg) => write!(f, "Timeout: {}", msg),
            Error::Encoding(msg) => write!(f, "Encoding error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<CoordinationError> for Error {
    fn from(err: CoordinationError) -> Self {
        Error::Coordination(err)
    }
}

/// Result type alias for KeeperMap operations.
pub type Result<T> = std::result::Result<T, Error>;
