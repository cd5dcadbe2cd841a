use std::fmt::Display;

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Invalid user input, typically a malformed key or configuration value.
    InvalidArgument(String),
    /// The key is not present in the store.
    NotFound,
    /// An IO error.
    Io(String),
    /// A record failed to decode, typically a bad length field or non-UTF-8
    /// payload.
    CorruptRecord(String),
    /// Unrecoverable structural damage in a segment file other than the
    /// newest one.
    CorruptSegment(String),
    /// The operation was attempted after the database was closed.
    Closed,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::NotFound => write!(f, "key not found"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::CorruptRecord(msg) => write!(f, "corrupt record: {msg}"),
            Error::CorruptSegment(msg) => write!(f, "corrupt segment: {msg}"),
            Error::Closed => write!(f, "database is closed"),
        }
    }
}

/// Constructs an Error::CorruptRecord for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::CorruptRecord(format!($($args)*)).into() };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}
