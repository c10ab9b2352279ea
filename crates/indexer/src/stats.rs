use crate::embed_pool::EmbedSource;
use crate::project::IndexMode;
use serde::{Deserialize, Serialize};

/// Statistics about one indexing run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub mode: IndexMode,

    /// Index version the run wrote under
    pub index_version: u64,

    pub files_scanned: usize,

    /// Files read, chunked and (where needed) embedded
    pub files_processed: usize,

    /// Files whose mtime or content hash showed no change
    pub files_unchanged: usize,

    /// Binary or unreadable files
    pub files_skipped: usize,

    pub files_removed: usize,

    /// Live chunks after the run
    pub chunks: usize,

    pub upserts: usize,
    pub deletes: usize,

    pub cache_hits: usize,
    pub embedded: usize,
    /// Embeddings shared with a concurrent identical request
    pub shared: usize,
    pub embedding_failures: usize,

    /// Chunks produced by the whole-file fallback
    pub fallback_chunks: usize,

    pub lock_wait_ms: u64,

    /// Time taken in milliseconds
    pub time_ms: u64,

    /// Errors encountered
    pub errors: Vec<String>,
}

impl IndexStats {
    pub fn new(mode: IndexMode) -> Self {
        Self {
            mode,
            index_version: 0,
            files_scanned: 0,
            files_processed: 0,
            files_unchanged: 0,
            files_skipped: 0,
            files_removed: 0,
            chunks: 0,
            upserts: 0,
            deletes: 0,
            cache_hits: 0,
            embedded: 0,
            shared: 0,
            embedding_failures: 0,
            fallback_chunks: 0,
            lock_wait_ms: 0,
            time_ms: 0,
            errors: Vec::new(),
        }
    }

    pub(crate) fn record_embed(&mut self, source: EmbedSource) {
        match source {
            EmbedSource::Cache => self.cache_hits += 1,
            EmbedSource::Embedded => self.embedded += 1,
            EmbedSource::Shared => self.shared += 1,
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    /// Whether the run changed the store.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.upserts > 0 || self.deletes > 0
    }
}
