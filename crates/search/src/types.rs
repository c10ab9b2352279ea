use codesearch_vector_store::{ChunkKind, VectorRecord};
use serde::{Deserialize, Serialize};

/// One ranked retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ChunkKind,
    pub name: String,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    /// Similarity reported by the store.
    pub score: f32,
    /// `None` when the reranker failed or timed out.
    pub rerank_score: Option<f32>,
    /// Zero-based position in the store's result list.
    pub retrieval_rank: usize,
}

impl SearchHit {
    #[must_use]
    pub fn from_record(record: &VectorRecord, score: f32, retrieval_rank: usize) -> Self {
        let meta = &record.metadata;
        Self {
            chunk_id: record.chunk_id.clone(),
            path: meta.path.clone(),
            kind: meta.kind,
            name: meta.name.clone(),
            start_line: meta.start_line,
            end_line: meta.end_line,
            text: record.text.clone(),
            score,
            rerank_score: None,
            retrieval_rank,
        }
    }

    /// True when `other` lies entirely within this hit's span of the same file.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.path == other.path
            && self.start_line <= other.start_line
            && other.end_line <= self.end_line
    }

    #[must_use]
    pub fn header(&self) -> String {
        format!(
            "File: {}, Type: {}, Name: {}, Lines: {}-{}",
            self.path, self.kind, self.name, self.start_line, self.end_line
        )
    }
}

/// A hit admitted into an aggregated context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBlock {
    pub hit: SearchHit,
    /// Body as included; shorter than `hit.text` when truncated.
    pub text: String,
    pub tokens: usize,
    pub truncated: bool,
}

impl ContextBlock {
    #[must_use]
    pub fn render(&self) -> String {
        format!("{}\n{}", self.hit.header(), self.text)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub token_count: usize,
    pub budget: usize,
    pub included: usize,
    pub skipped_nested: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResult {
    /// Ranked search results the context was built from.
    pub results: Vec<SearchHit>,
    pub blocks: Vec<ContextBlock>,
    pub aggregated_text: String,
    pub token_count: usize,
    pub budget: usize,
    pub included: usize,
    pub skipped_nested: usize,
    pub truncated: bool,
}

impl ContextResult {
    #[must_use]
    pub fn summary(&self) -> ContextSummary {
        ContextSummary {
            token_count: self.token_count,
            budget: self.budget,
            included: self.included,
            skipped_nested: self.skipped_nested,
            truncated: self.truncated,
        }
    }
}

/// Items produced by `Searcher::context_stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ContextEvent {
    Chunk(ContextBlock),
    Summary(ContextSummary),
    Failed { message: String },
}
