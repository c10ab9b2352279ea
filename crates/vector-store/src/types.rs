use codesearch_chunker::{Chunk, ChunkKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Similarity metric, fixed per store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Similarity {
    #[default]
    Cosine,
    InnerProduct,
}

impl Similarity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::InnerProduct => "inner_product",
        }
    }

    #[must_use]
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => crate::embeddings::cosine_similarity(a, b),
            Self::InnerProduct => crate::embeddings::dot(a, b),
        }
    }
}

impl fmt::Display for Similarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ChunkKind,
    pub name: String,
    pub start_line: usize,
    pub end_line: usize,
    #[serde(rename = "model")]
    pub model_id: String,
    pub index_version: u64,
}

/// A chunk's embedding plus everything retrieval needs without re-reading the file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    #[serde(rename = "id")]
    pub chunk_id: String,
    pub text: String,
    #[serde(rename = "embedding")]
    pub vector: Vec<f32>,
    pub metadata: RecordMetadata,
}

impl VectorRecord {
    #[must_use]
    pub fn from_chunk(chunk: &Chunk, vector: Vec<f32>, model_id: &str, index_version: u64) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            text: chunk.text.clone(),
            vector,
            metadata: RecordMetadata {
                path: chunk.path.clone(),
                kind: chunk.kind,
                name: chunk.name.clone(),
                start_line: chunk.start_line(),
                end_line: chunk.end_line(),
                model_id: model_id.to_string(),
                index_version,
            },
        }
    }
}

/// Retrieval hit: chunk id and its similarity score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredId {
    pub chunk_id: String,
    pub score: f32,
}

/// What the indexer needs to garbage-collect a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    pub path: String,
    pub index_version: u64,
}

/// Upserts and deletes applied together as one generation
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub upserts: Vec<VectorRecord>,
    pub deletes: Vec<String>,
}

impl WriteBatch {
    #[must_use]
    pub fn upserts(records: Vec<VectorRecord>) -> Self {
        Self {
            upserts: records,
            deletes: Vec::new(),
        }
    }

    #[must_use]
    pub fn deletes(chunk_ids: Vec<String>) -> Self {
        Self {
            upserts: Vec::new(),
            deletes: chunk_ids,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Effect of one commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub generation: u64,
    pub upserted: usize,
    pub deleted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use codesearch_chunker::LineSpan;
    use pretty_assertions::assert_eq;

    #[test]
    fn record_json_shape() {
        let chunk = Chunk::new(
            "app/views.py",
            LineSpan::new(3, 7),
            ChunkKind::Function,
            "paginate",
            "def paginate():\n    pass",
        );
        let record = VectorRecord::from_chunk(&chunk, vec![0.5, 0.5], "hash-v1", 4);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["id"], chunk.id.as_str());
        assert_eq!(json["embedding"][1], 0.5);
        assert_eq!(json["metadata"]["type"], "function");
        assert_eq!(json["metadata"]["model"], "hash-v1");
        assert_eq!(json["metadata"]["start_line"], 3);
        assert_eq!(json["metadata"]["index_version"], 4);
    }
}
