//! # Code Search Indexer
//!
//! Keeps a project's vector index in step with its source tree.
//!
//! ## Pipeline
//!
//! ```text
//! Directory
//!     │
//!     ├──> FileScanner (IgnoreFilter: .gitignore, .codesearchignore, built-in scopes)
//!     │      └─> ScannedFile { rel_path, mtime, size }
//!     │
//!     ├──> Chunker (tree-sitter, whole-file fallback)
//!     │      └─> Chunk[] with stable ids
//!     │
//!     ├──> EmbeddingPool (cache first, single-flight, bounded, retried)
//!     │
//!     └──> VectorStore commit ──> state.json ──> ProjectIndex (Ready)
//! ```
//!
//! Full runs rebuild everything not already stored under the current index
//! version; incremental runs touch only files whose mtime and content changed.
//! [`IndexCoordinator`] collapses overlapping requests, and [`WatchIndexer`]
//! drives incremental runs from filesystem events.
//!
//! ## Example
//!
//! ```no_run
//! use codesearch_indexer::ProjectIndexer;
//! use codesearch_vector_store::HashEmbedder;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let indexer = ProjectIndexer::open("/path/to/project", Arc::new(HashEmbedder::default())).await?;
//!     let stats = indexer.index_incremental().await?;
//!
//!     println!("Indexed {} files, {} chunks", stats.files_processed, stats.chunks);
//!     Ok(())
//! }
//! ```

mod config;
mod coordinator;
mod embed_pool;
mod error;
mod ignore_filter;
mod index_lock;
mod index_state;
mod indexer;
mod limits;
mod project;
mod scanner;
mod stats;
mod watcher;

pub use config::{IndexerConfig, ENV_EMBED_CONCURRENCY, ENV_MAX_FILE_BYTES};
pub use coordinator::{IndexCoordinator, RunOutcome};
pub use embed_pool::{EmbedSource, EmbeddedVector, EmbeddingPool, RetryPolicy};
pub use error::{IndexerError, Result};
pub use ignore_filter::{IgnoreFilter, CODESEARCH_IGNORE_FILE, GITIGNORE_FILE};
pub use index_lock::{index_write_lock_wait_ms_last, index_write_lock_wait_ms_max};
pub use index_state::{
    load_state, save_state, state_json_schema, state_path_for_project_root, FileIndexState,
    ProjectIndexState, StateLoad, INDEX_STATE_SCHEMA_VERSION,
};
pub use indexer::ProjectIndexer;
pub use limits::{ConcurrencySnapshot, MAX_EMBED_CONCURRENCY};
pub use project::{IndexMode, IndexPhase, NotQueryable, ProjectIndex, StaleReason};
pub use scanner::{is_probably_binary, FileScanner, ScannedFile, MAX_FILE_SIZE_BYTES};
pub use stats::IndexStats;
pub use watcher::{IndexUpdate, WatchConfig, WatchHealth, WatchIndexer};
