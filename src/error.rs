use std::io;

/// Error is the crate-wide error type. Replica operations categorize failures
/// by kind; callers branch on the variant, not the message.
///
/// Invariant violations (watermark regression, duplicate pending op, etc.) are
/// deliberately NOT represented here. Those indicate protocol bugs and panic
/// instead of returning.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("already present: {0}")]
    AlreadyPresent(String),

    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
