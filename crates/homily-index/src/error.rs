//! Search error types.

use homily_providers::ProviderError;
use thiserror::Error;

/// The relational store failed or is unreachable. Never recovered from.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct StorageError(pub String);

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError(e.to_string())
    }
}

/// Errors surfaced by [`crate::SearchEngine`].
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("search cancelled")]
    Cancelled,

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl From<rusqlite::Error> for SearchError {
    fn from(e: rusqlite::Error) -> Self {
        SearchError::Storage(e.into())
    }
}

impl SearchError {
    /// Whether retrying with a different configuration could help.
    pub fn is_configuration(&self) -> bool {
        match self {
            SearchError::Configuration(_) => true,
            SearchError::Provider(e) => e.is_configuration(),
            _ => false,
        }
    }
}
