use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexerError>;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Vector store error: {0}")]
    VectorStoreError(#[from] codesearch_vector_store::VectorStoreError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Embedder kept failing for one chunk; the chunk is skipped, the run goes on.
    #[error("Embedding with {model} failed after {attempts} attempt(s): {message}")]
    Embedding {
        model: String,
        attempts: u32,
        message: String,
    },

    #[error("Embedder model {embedder} does not match index model {index}; run a full rebuild")]
    ModelMismatch { index: String, embedder: String },

    #[error("Index is stale ({reason}); run a full rebuild")]
    StaleIndex { reason: String },

    #[error("Indexing cancelled")]
    Cancelled,

    #[error("Invalid project path: {0}")]
    InvalidPath(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Errors limited to a single chunk; everything else aborts the run.
    #[must_use]
    pub const fn is_chunk_local(&self) -> bool {
        matches!(self, Self::Embedding { .. })
    }
}
