use crate::aggregate::{aggregate, Admission, ContextAggregator};
use crate::config::SearchConfig;
use crate::error::{QueryError, Result, SearchError};
use crate::filter::validate_filter;
use crate::rerank::{LexicalReranker, Reranker};
use crate::tokens::{HeuristicTokenCounter, TokenCounter};
use crate::types::{ContextEvent, ContextResult, SearchHit};
use codesearch_indexer::{ProjectIndex, ProjectIndexer};
use codesearch_vector_store::{Embedder, Generation, MetadataFilter, VectorStoreError};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Read side of a project index.
///
/// Every query runs against one store generation taken up front, so results
/// never mix records from two commits even while the indexer is writing.
pub struct Searcher {
    index: Arc<ProjectIndex>,
    embedder: Arc<dyn Embedder>,
    reranker: Arc<dyn Reranker>,
    counter: Arc<dyn TokenCounter>,
    config: SearchConfig,
}

impl Searcher {
    pub fn new(index: Arc<ProjectIndex>, embedder: Arc<dyn Embedder>, config: SearchConfig) -> Self {
        Self {
            index,
            embedder,
            reranker: Arc::new(LexicalReranker::default()),
            counter: Arc::new(HeuristicTokenCounter),
            config: config.normalized(),
        }
    }

    /// Share the indexer's project handle and embedder.
    pub fn for_indexer(indexer: &ProjectIndexer, config: SearchConfig) -> Self {
        Self::new(
            Arc::clone(indexer.index()),
            Arc::clone(indexer.pool().embedder()),
            config,
        )
    }

    #[must_use]
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = reranker;
        self
    }

    #[must_use]
    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<ProjectIndex> {
        &self.index
    }

    /// Top `k` chunks for `query`, re-ranked.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        let query = normalize_query(query)?;
        let generation = self.snapshot()?;
        self.search_at(&generation, &query, k, filter).await
    }

    /// Run several queries against the same generation.
    ///
    /// Readiness is checked once; each query then succeeds or fails on its own.
    pub async fn search_batch(
        &self,
        queries: &[&str],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Result<Vec<SearchHit>>>> {
        let generation = self.snapshot()?;
        let mut results = Vec::with_capacity(queries.len());
        for raw in queries {
            let result = match normalize_query(raw) {
                Ok(query) => self.search_at(&generation, &query, k, filter).await,
                Err(err) => Err(err.into()),
            };
            results.push(result);
        }
        Ok(results)
    }

    /// Search, then pack the ranked chunks into `budget` tokens.
    pub async fn context(&self, query: &str, budget: usize) -> Result<ContextResult> {
        let results = self.search(query, self.config.default_k, None).await?;
        let context = aggregate(results, self.counter.as_ref(), budget);
        log::debug!(
            "Context for {query:?}: {} of {} chunks, {}/{} tokens",
            context.included,
            context.results.len(),
            context.token_count,
            context.budget
        );
        Ok(context)
    }

    /// Streaming form of [`Searcher::context`].
    ///
    /// Emits one `Chunk` per included block in rank order and a final
    /// `Summary`, or a single `Failed`. Dropping the receiver stops the
    /// producer.
    pub fn context_stream(self: &Arc<Self>, query: &str, budget: usize) -> mpsc::Receiver<ContextEvent> {
        let (tx, rx) = mpsc::channel(self.config.stream_buffer);
        let searcher = Arc::clone(self);
        let query = query.to_string();

        tokio::spawn(async move {
            let results = match searcher.search(&query, searcher.config.default_k, None).await {
                Ok(results) => results,
                Err(err) => {
                    let _ = tx
                        .send(ContextEvent::Failed {
                            message: err.to_string(),
                        })
                        .await;
                    return;
                }
            };

            let mut aggregator = ContextAggregator::new(searcher.counter.as_ref(), budget);
            for hit in &results {
                match aggregator.offer(hit) {
                    Admission::Included(block) => {
                        if tx.send(ContextEvent::Chunk(block)).await.is_err() {
                            log::debug!("Context stream receiver dropped for {query:?}");
                            return;
                        }
                    }
                    Admission::Nested => {}
                    Admission::Exhausted => break,
                }
            }
            let _ = tx.send(ContextEvent::Summary(aggregator.summary())).await;
        });

        rx
    }

    fn snapshot(&self) -> Result<Generation> {
        self.index
            .queryable_state(self.embedder.model_id())
            .map_err(QueryError::from)?;
        Ok(self.index.store().snapshot())
    }

    async fn search_at(
        &self,
        generation: &Generation,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        if let Some(filter) = filter {
            validate_filter(filter)?;
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let vector = self.embed_query(query).await?;
        let fetch = self.config.candidate_count(k);
        let scored = generation
            .query(&vector, fetch, filter)
            .map_err(|err| match err {
                VectorStoreError::InvalidFilter(msg) => SearchError::from(QueryError::InvalidFilter(msg)),
                other => other.into(),
            })?;

        let mut hits: Vec<SearchHit> = scored
            .iter()
            .enumerate()
            .filter_map(|(rank, scored)| {
                generation
                    .get(&scored.chunk_id)
                    .map(|record| SearchHit::from_record(&record, scored.score, rank))
            })
            .collect();

        self.rerank(query, &mut hits).await;
        hits.truncate(k);
        Ok(hits)
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let timeout = self.config.query_timeout();
        match tokio::time::timeout(timeout, self.embedder.embed(query)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(QueryError::Timeout {
                stage: "query embedding",
                timeout_ms: self.config.query_timeout_ms,
            }
            .into()),
        }
    }

    /// Reorder `hits` by reranker score; on failure or timeout leave them in
    /// retrieval order.
    async fn rerank(&self, query: &str, hits: &mut [SearchHit]) {
        if hits.is_empty() {
            return;
        }
        let texts: Vec<&str> = hits.iter().map(|h| h.text.as_str()).collect();
        let outcome = tokio::time::timeout(
            self.config.rerank_timeout(),
            self.reranker.score_batch(query, &texts),
        )
        .await;

        let scores = match outcome {
            Ok(Ok(scores)) if scores.len() == hits.len() => scores,
            Ok(Ok(scores)) => {
                log::warn!(
                    "Reranker {} returned {} scores for {} candidates; keeping retrieval order",
                    self.reranker.name(),
                    scores.len(),
                    hits.len()
                );
                return;
            }
            Ok(Err(err)) => {
                log::warn!(
                    "Reranker {} failed: {err}; keeping retrieval order",
                    self.reranker.name()
                );
                return;
            }
            Err(_) => {
                log::warn!(
                    "Reranker {} timed out after {}ms; keeping retrieval order",
                    self.reranker.name(),
                    self.config.rerank_timeout_ms
                );
                return;
            }
        };

        for (hit, score) in hits.iter_mut().zip(scores) {
            hit.rerank_score = Some(if score.is_finite() {
                score
            } else {
                f32::NEG_INFINITY
            });
        }
        hits.sort_by(|a, b| {
            let a_score = a.rerank_score.unwrap_or(f32::NEG_INFINITY);
            let b_score = b.rerank_score.unwrap_or(f32::NEG_INFINITY);
            b_score
                .partial_cmp(&a_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.retrieval_rank.cmp(&b.retrieval_rank))
        });
    }
}

/// Lowercase and collapse whitespace.
pub fn normalize_query(query: &str) -> std::result::Result<String, QueryError> {
    let normalized = query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");
    if normalized.is_empty() {
        return Err(QueryError::EmptyQuery);
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        assert_eq!(
            normalize_query("  Paginate\t QuerySet \n").unwrap(),
            "paginate queryset"
        );
        assert_eq!(normalize_query(" \n\t"), Err(QueryError::EmptyQuery));
    }
}
