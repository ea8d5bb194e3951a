//! # Error Taxonomy
//!
//! Every fallible operation in the index reports a [`MapError`]. Store
//! implementations work with `anyhow` internally and are folded into
//! [`MapError::Store`] at the trait boundary.

use thiserror::Error;

/// Errors surfaced by the tile index and its request layer.
#[derive(Debug, Error)]
pub enum MapError {
    /// Malformed coordinates, geohash alphabet violations, oversized boxes,
    /// empty required fields.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation requires a caller identity and none was supplied.
    #[error("caller identity is required")]
    Unauthenticated,

    /// The persistent store failed or was unavailable.
    #[error("store failure: {message}")]
    Store { message: String, retryable: bool },

    /// A store call did not complete within the configured deadline.
    #[error("{0} timed out")]
    Timeout(String),

    /// An optimistic tile write lost the race too many times in a row.
    #[error("concurrent update conflict on tile {key}")]
    Conflict { key: String },
}

pub type MapResult<T> = Result<T, MapError>;

impl MapError {
    pub fn invalid(message: impl Into<String>) -> Self {
        MapError::InvalidArgument(message.into())
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            MapError::Timeout(_) | MapError::Conflict { .. } => true,
            MapError::Store { retryable, .. } => *retryable,
            MapError::InvalidArgument(_) | MapError::Unauthenticated => false,
        }
    }
}

impl From<anyhow::Error> for MapError {
    fn from(err: anyhow::Error) -> Self {
        MapError::Store {
            message: format!("{err:#}"),
            retryable: true,
        }
    }
}
