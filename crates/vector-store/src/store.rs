use crate::error::Result;
use crate::filter::MetadataFilter;
use crate::types::{CommitStats, RecordInfo, ScoredId, Similarity, VectorRecord, WriteBatch};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Read-only view of one published generation of a store.
pub trait GenerationView: Send + Sync {
    fn generation(&self) -> u64;

    fn similarity(&self) -> Similarity;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, chunk_id: &str) -> Option<Arc<VectorRecord>>;

    /// Top `k` records by similarity, descending; equal scores ordered by chunk id.
    fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredId>>;

    fn inventory(&self) -> BTreeMap<String, RecordInfo>;
}

/// Snapshot token: holds a generation alive for as long as a reader needs it.
pub type Generation = Arc<dyn GenerationView>;

/// Vector storage capability.
///
/// Writers publish whole generations; readers take a [`Generation`] and never
/// observe a partially applied batch.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn similarity(&self) -> Similarity;

    fn snapshot(&self) -> Generation;

    /// Apply deletes then upserts as one new generation.
    async fn commit(&self, batch: WriteBatch) -> Result<CommitStats>;

    /// Write the current generation to durable storage, if the backend has any.
    async fn persist(&self) -> Result<()>;

    /// Remove every record.
    async fn clear(&self) -> Result<()>;

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<CommitStats> {
        self.commit(WriteBatch::upserts(records)).await
    }

    async fn delete(&self, chunk_ids: Vec<String>) -> Result<CommitStats> {
        self.commit(WriteBatch::deletes(chunk_ids)).await
    }

    fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredId>> {
        self.snapshot().query(vector, k, filter)
    }

    fn query_at(
        &self,
        generation: &Generation,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredId>> {
        generation.query(vector, k, filter)
    }

    fn get(&self, chunk_id: &str) -> Option<Arc<VectorRecord>> {
        self.snapshot().get(chunk_id)
    }

    fn inventory(&self) -> BTreeMap<String, RecordInfo> {
        self.snapshot().inventory()
    }

    fn len(&self) -> usize {
        self.snapshot().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
