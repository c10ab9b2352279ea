//! # Code Search Vector Store
//!
//! Vector storage, embedding capability and the durable embedding cache.
//!
//! ## Architecture
//!
//! ```text
//! Chunk[]
//!     │
//!     ├──> Embedder capability (HashEmbedder by default)
//!     │      └─> EmbeddingCache (fingerprint → vector, LRU + sharded files)
//!     │
//!     └──> VectorStore capability
//!            ├─> commit(WriteBatch) publishes a new generation
//!            └─> snapshot() → Generation for consistent reads
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use codesearch_vector_store::{Embedder, HashEmbedder, InMemoryVectorStore, Similarity, VectorStore};
//!
//! #[tokio::main]
//! async fn main() -> codesearch_vector_store::Result<()> {
//!     let store = InMemoryVectorStore::open(".codesearch/vectors.json", Similarity::Cosine).await?;
//!     let embedder = HashEmbedder::default();
//!
//!     let query = embedder.embed("paginate queryset").await?;
//!     for hit in store.query(&query, 10, None)? {
//!         println!("{}: {:.3}", hit.chunk_id, hit.score);
//!     }
//!     Ok(())
//! }
//! ```

mod embedding_cache;
mod embeddings;
mod error;
mod filter;
mod memory_store;
pub mod paths;
mod store;
mod types;

pub use embedding_cache::{
    CacheStats, EmbeddingCache, Fingerprint, CACHE_FORMAT_VERSION, DEFAULT_LRU_CAPACITY,
};
pub use embeddings::{cosine_similarity, dot, Embedder, HashEmbedder, DEFAULT_HASH_DIMENSION};
pub use error::{Result, VectorStoreError};
pub use filter::{CompiledFilter, MetadataFilter};
pub use memory_store::{InMemoryVectorStore, VECTOR_STORE_SCHEMA_VERSION};
pub use store::{Generation, GenerationView, VectorStore};
pub use types::{
    CommitStats, RecordInfo, RecordMetadata, ScoredId, Similarity, VectorRecord, WriteBatch,
};

// Re-export chunk types for convenience
pub use codesearch_chunker::{Chunk, ChunkKind};
