//! Error types.

use thiserror::Error;

/// Error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid configuration.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// The request pool has no free nodes.
    #[error("Request pool exhausted")]
    PoolExhausted,

    /// The stream has been closed.
    #[error("Stream is closed")]
    Closed,

    /// The stream is still opening or has failed; the operation is not valid.
    #[error("Stream is not ready")]
    NotReady,

    /// The I/O worker is no longer accepting requests.
    #[error("I/O worker unavailable")]
    WorkerUnavailable,

    /// Opening the file failed.
    #[error("Open failed (os error {code})")]
    Open { code: i32 },

    /// Reading a block failed.
    #[error("Read failed (os error {code})")]
    Read { code: i32 },

    /// Writing a block failed.
    #[error("Write failed (os error {code})")]
    Write { code: i32 },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
