use thiserror::Error;

pub type Result<T> = std::result::Result<T, VectorStoreError>;

#[derive(Error, Debug)]
pub enum VectorStoreError {
    #[error("Embedding error ({model}): {message}")]
    EmbeddingError { model: String, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Persisted data was written by an incompatible schema or is unreadable.
    #[error("Incompatible format in {path}: {reason}")]
    IncompatibleFormat { path: String, reason: String },

    /// A fingerprint already maps to a different vector.
    #[error("Embedding cache conflict for fingerprint {fingerprint}")]
    CacheConflict { fingerprint: String },

    #[error("Similarity mismatch: store uses {store}, requested {requested}")]
    SimilarityMismatch { store: String, requested: String },
}

impl VectorStoreError {
    pub fn embedding(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EmbeddingError {
            model: model.into(),
            message: message.into(),
        }
    }
}
