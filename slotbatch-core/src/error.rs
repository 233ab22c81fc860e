//! Error types for slot-format batching pipelines

use std::io;
use thiserror::Error;

/// Result type for slotbatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for slotbatch operations
#[derive(Error, Debug)]
pub enum Error {
    /// An upstream stage or declared column does not match what a consumer requires
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A line could not be parsed per the declared grammar
    #[error("Format violation at line {line}: {message}")]
    FormatViolation {
        /// 1-based line number within the parser's input
        line: u64,

        /// Description of the violation
        message: String,
    },

    /// A declared shape could not be resolved against an observed byte size
    #[error("Shape inference error: {0}")]
    ShapeInference(String),

    /// Mapping a new memory region failed
    #[error("Region allocation of {size} bytes failed: {source}")]
    AllocationFailure {
        /// Requested region size in bytes
        size: usize,

        /// Error reported by the mapping call
        #[source]
        source: io::Error,
    },

    /// A user-supplied predicate or transform failed
    #[error("Callback failed in {stage}: {source}")]
    Callback {
        /// Name of the stage that invoked the callback
        stage: &'static str,

        /// Error raised by the callback
        #[source]
        source: anyhow::Error,
    },

    /// Column index outside the bound schema
    #[error("Column index {index} out of range, size={len}")]
    IndexOutOfBounds {
        /// Requested index
        index: usize,

        /// Number of columns in the schema
        len: usize,
    },

    /// A column block was allocated twice without a schema rebind
    #[error("Column '{column}' has already been allocated")]
    BlockAlreadyAllocated {
        /// Name of the column
        column: String,
    },

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// IO error while pulling bytes
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`Error::SchemaMismatch`]
    SchemaMismatch,
    /// See [`Error::FormatViolation`] and [`Error::BlockAlreadyAllocated`]
    FormatViolation,
    /// See [`Error::ShapeInference`]
    ShapeInference,
    /// See [`Error::AllocationFailure`]
    AllocationFailure,
    /// See [`Error::Callback`]
    CallbackFailure,
    /// Argument, bounds and IO errors
    Other,
}

impl Error {
    /// Build a format violation for the given line
    pub fn format(line: u64, message: impl Into<String>) -> Self {
        Error::FormatViolation {
            line,
            message: message.into(),
        }
    }

    /// Wrap a callback failure raised inside `stage`
    pub fn callback(stage: &'static str, source: anyhow::Error) -> Self {
        Error::Callback { stage, source }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            Error::FormatViolation { .. } | Error::BlockAlreadyAllocated { .. } => {
                ErrorKind::FormatViolation
            }
            Error::ShapeInference(_) => ErrorKind::ShapeInference,
            Error::AllocationFailure { .. } => ErrorKind::AllocationFailure,
            Error::Callback { .. } => ErrorKind::CallbackFailure,
            Error::IndexOutOfBounds { .. } | Error::InvalidArgument(_) | Error::Io(_) => {
                ErrorKind::Other
            }
        }
    }
}
