//! `hiveutils::error` is a module containing error utilities for the sandhive project.

use std::{
    error::Error,
    fmt::{self, Display},
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a hiveutils-related operation.
pub type HiveutilsResult<T> = Result<T, HiveutilsError>;

/// An error that occurred while running a utility operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum HiveutilsError {
    /// An error that occurred when resolving a binary
    #[error("binary not found at: {0}\nSource: {1}")]
    BinaryNotFound(String, String),

    /// An external command exited with a non-zero status
    #[error("command `{command}` failed with status {status}: {stderr}")]
    CommandFailed {
        /// The command line that was run.
        command: String,

        /// The exit status, or -1 when the process was killed by a signal.
        status: i32,

        /// Captured standard error of the command.
        stderr: String,
    },

    /// An error that occurred when signalling a process
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        /// The target process or process group.
        pid: i32,

        /// The underlying errno.
        source: nix::Error,
    },

    /// An error that occurred when performing an IO operation
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Custom error.
    #[error("Custom error: {0}")]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HiveutilsError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> HiveutilsError {
        HiveutilsError::Custom(AnyError {
            error: error.into(),
        })
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `HiveutilsResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> HiveutilsResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
