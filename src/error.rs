use std::io;
use thiserror::Error;

/// Main error type for the disc matcher library.
#[derive(Error, Debug)]
pub enum MatchError {
    /// The image bytes are not in a supported format, or the claimed
    /// content type disagrees with the actual format.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    /// The input exceeds the configured size ceiling.
    #[error("image is {actual} bytes, limit is {limit}")]
    Oversize { actual: usize, limit: usize },
    /// The bytes claim a supported format but cannot be decoded.
    #[error("image could not be decoded: {0}")]
    Undecodable(String),
    /// An embedding did not have the width the store declares.
    #[error("invalid embedding dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },
    /// The backend produced a zero-norm vector; such rows are never stored.
    #[error("encoder produced a degenerate zero embedding")]
    DegenerateEmbedding,
    /// No disc row with this identity.
    #[error("unknown disc {0}")]
    UnknownDisc(i64),
    /// No image row with this identity.
    #[error("unknown image {0}")]
    UnknownImage(i64),
    /// The requested lifecycle transition is not allowed.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    /// The image row was embedded under a different encoder than the
    /// one currently active.
    #[error("image was embedded under encoder '{recorded}' but '{active}' is active")]
    EncoderMismatch { recorded: String, active: String },
    /// An encoder backend failure (model load or inference).
    #[error("encoder error: {0}")]
    Encoder(String),
    /// A vector store failure.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The operation deadline was exceeded.
    #[error("operation deadline exceeded")]
    Timeout,
    /// Bad configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),
}

impl MatchError {
    /// True for the transient kinds that are worth one automatic retry.
    pub fn is_transient(&self) -> bool {
        match self {
            MatchError::Encoder(_) => true,
            MatchError::Store(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// A specialized `Result` type for disc matching operations.
pub type Result<T> = std::result::Result<T, MatchError>;
