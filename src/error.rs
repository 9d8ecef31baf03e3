//! Defines the crate error type.

use thiserror::Error;

/// Result type used by fallible operations in this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error type for decoding, fetching and training failures.
///
/// Shape mismatches between tensors are programming errors and panic instead.
#[derive(Debug, Error)]
pub enum Error {
    /// A serialized value carried a type tag that no known kind handles.
    #[error("unknown type: {0}")]
    UnknownType(String),
    /// A serialized value had a different type tag than the one requested.
    #[error("expected type {expected} but got {actual}")]
    TypeMismatch {
        /// The requested type identifier.
        expected: &'static str,
        /// The identifier found in the data.
        actual: String,
    },
    /// Serialized bytes could not be encoded or decoded, including truncated data and trailing
    /// bytes after a value.
    #[error("encoding: {0}")]
    Encoding(#[from] bincode::Error),
    /// Decoded data is structurally invalid.
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// A configuration value is out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// A fetcher was asked for an empty batch.
    #[error("empty batch")]
    EmptyBatch,
    /// A training driver was given no samples.
    #[error("empty sample list")]
    EmptySamples,
    /// An I/O failure while loading samples or models.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// An error annotated with what was being done when it occurred.
    #[error("{context}: {source}")]
    Context {
        /// Description of the failed operation.
        context: String,
        /// The underlying error.
        source: Box<Error>,
    },
}

/// Attaches context to errors.
pub trait ResultExt<T> {
    /// Wraps the error, if any, with a description of the failed operation.
    fn context<C: Into<String>>(self, context: C) -> Result<T>;

    /// Like [`ResultExt::context`] but only builds the description on failure.
    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|source| Error::Context {
            context: context.into(),
            source: Box::new(source),
        })
    }

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|source| Error::Context {
            context: f().into(),
            source: Box::new(source),
        })
    }
}
