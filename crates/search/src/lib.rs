//! Query side of the code index: embed, retrieve, re-rank, and pack ranked
//! chunks into a token budget.
//!
//! ```no_run
//! use codesearch_indexer::ProjectIndexer;
//! use codesearch_search::{SearchConfig, Searcher};
//! use codesearch_vector_store::HashEmbedder;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let indexer = ProjectIndexer::open(".", Arc::new(HashEmbedder::default())).await?;
//! indexer.index_incremental().await?;
//!
//! let searcher = Searcher::for_indexer(&indexer, SearchConfig::load(indexer.index().root())?);
//! let context = searcher.context("paginate queryset", 8000).await?;
//! println!("{}", context.aggregated_text);
//! # Ok(())
//! # }
//! ```

mod aggregate;
mod config;
mod error;
mod filter;
mod rerank;
mod searcher;
mod tokens;
mod types;

pub use aggregate::{aggregate, Admission, ContextAggregator};
pub use config::{SearchConfig, DEFAULT_K, DEFAULT_TOKEN_BUDGET};
pub use error::{QueryError, Result, SearchError};
pub use filter::{filter_from_value, parse_filter, validate_filter};
pub use rerank::{Bm25Config, LexicalReranker, Reranker};
pub use searcher::{normalize_query, Searcher};
pub use tokens::{HeuristicTokenCounter, TokenCounter, WordTokenCounter};
pub use types::{ContextBlock, ContextEvent, ContextResult, ContextSummary, SearchHit};
