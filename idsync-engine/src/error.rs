//! Error types for the identity engine.

use idsync_storage::StorageError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Persistence failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Hit queue failure.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// URL construction or response decoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// HTTP client setup failure.
    #[error("http error: {0}")]
    Http(String),

    /// The service task has stopped.
    #[error("channel closed")]
    ChannelClosed,
}

/// Errors from the persistent hit queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue already holds `capacity` items.
    #[error("queue full (capacity {capacity})")]
    Full { capacity: usize },

    /// The backing store failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The queue was closed.
    #[error("queue closed")]
    Closed,
}

/// Errors from building request URLs or decoding responses.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The assembled URL does not parse.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The response body is not a valid sync response.
    #[error("failed to decode sync response: {0}")]
    DecodeFailed(String),
}
