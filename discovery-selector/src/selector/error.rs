//! Errors surfaced by the selector.

use thiserror::Error;

/// An error produced by the selector's consumer-facing surface.
///
/// Individual probe failures never surface here: they are folded into the
/// selection decision (see [`HealthStatus`](super::health::HealthStatus)).
/// Exhausting every candidate is likewise not an error but an `Option::None`
/// selection result.
#[derive(Error, Debug)]
pub enum SelectorError {
    /// An endpoint string could not be parsed into a URL.
    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    /// The HTTP client could not be constructed.
    #[error("failed to construct HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    /// No endpoint could be selected; the caller should treat this as a
    /// connectivity problem, not a poisoned selector.
    #[error("no healthy discovery nodes are available")]
    NoHealthyNodes,
    /// The injected persistent storage failed. Selection paths swallow this
    /// and proceed as if the cache were empty.
    #[error("persistent storage error: {0}")]
    Storage(#[from] StorageError),
}

/// An opaque error from the pluggable [`SelectorStorage`](super::cache::SelectorStorage)
/// capability.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct StorageError(
    /// Description of the underlying storage failure.
    pub String,
);

impl StorageError {
    /// Wraps a storage failure description.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
