//! # Code Search Chunker
//!
//! Splits source files into content-addressed chunks for embedding and retrieval.
//!
//! ## Architecture
//!
//! ```text
//! Source bytes
//!     │
//!     ├──> Language Detection (from extension)
//!     │
//!     ├──> Chunker capability → ChunkBoundary[] (line spans, kind, name)
//!     │         └─> TreeSitterChunker for Rust / Python / JS / TS
//!     │
//!     └──> chunk_source
//!          ├─> Attach text, derive ids from (path, span, content hash)
//!          └─> Whole-file fallback on error or empty output
//! ```
//!
//! ## Example
//!
//! ```rust
//! use codesearch_chunker::{chunk_source, ChunkKind, TreeSitterChunker};
//!
//! let code = "def paginate(items, size):\n    return items[:size]\n";
//! let file = chunk_source(&TreeSitterChunker::new(), "app/pages.py", code);
//!
//! assert_eq!(file.chunks.len(), 1);
//! assert_eq!(file.chunks[0].kind, ChunkKind::Function);
//! assert_eq!(file.chunks[0].name, "paginate");
//! ```

mod ast_analyzer;
mod chunker;
mod error;
mod language;
mod types;

pub use ast_analyzer::TreeSitterChunker;
pub use chunker::{chunk_source, whole_file_chunk, ChunkedFile, Chunker, FallbackReason};
pub use error::{ChunkerError, Result};
pub use language::Language;
pub use types::{chunk_id, content_hash, Chunk, ChunkBoundary, ChunkKind, LineSpan};
