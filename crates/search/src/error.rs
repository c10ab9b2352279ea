use codesearch_indexer::{NotQueryable, StaleReason};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SearchError>;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Vector store error: {0}")]
    VectorStoreError(#[from] codesearch_vector_store::VectorStoreError),

    #[error("Reranker {reranker} failed: {message}")]
    Rerank { reranker: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Rejected before touching the store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Empty query")]
    EmptyQuery,

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Index was built with model {index}, query embedder is {query}")]
    ModelMismatch { index: String, query: String },

    #[error("Index is empty; run a full index first")]
    IndexEmpty,

    #[error("Index is stale ({0}); rebuild required")]
    IndexStale(String),

    #[error("{stage} timed out after {timeout_ms}ms")]
    Timeout { stage: &'static str, timeout_ms: u64 },
}

impl From<NotQueryable> for QueryError {
    fn from(value: NotQueryable) -> Self {
        match value {
            NotQueryable::Empty => Self::IndexEmpty,
            NotQueryable::Stale(StaleReason::ModelChanged { index, embedder }) => {
                Self::ModelMismatch {
                    index,
                    query: embedder,
                }
            }
            NotQueryable::Stale(reason) => Self::IndexStale(reason.to_string()),
            NotQueryable::ModelMismatch { index, query } => Self::ModelMismatch { index, query },
        }
    }
}

impl SearchError {
    /// The query-level cause, if this error is one.
    #[must_use]
    pub const fn as_query(&self) -> Option<&QueryError> {
        match self {
            Self::Query(err) => Some(err),
            _ => None,
        }
    }
}
