use crate::error::{Result, VectorStoreError};
use crate::filter::MetadataFilter;
use crate::store::{Generation, GenerationView, VectorStore};
use crate::types::{CommitStats, RecordInfo, ScoredId, Similarity, VectorRecord, WriteBatch};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

pub const VECTOR_STORE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug)]
struct MemoryGeneration {
    id: u64,
    similarity: Similarity,
    dimension: Option<usize>,
    records: BTreeMap<String, Arc<VectorRecord>>,
}

impl GenerationView for MemoryGeneration {
    fn generation(&self) -> u64 {
        self.id
    }

    fn similarity(&self) -> Similarity {
        self.similarity
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, chunk_id: &str) -> Option<Arc<VectorRecord>> {
        self.records.get(chunk_id).cloned()
    }

    fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredId>> {
        let compiled = filter
            .filter(|f| !f.is_empty())
            .map(MetadataFilter::compile)
            .transpose()?;
        if k == 0 || self.records.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(expected) = self.dimension {
            if vector.len() != expected {
                return Err(VectorStoreError::InvalidDimension {
                    expected,
                    actual: vector.len(),
                });
            }
        }

        let mut scored: Vec<(f32, &str)> = self
            .records
            .values()
            .filter(|record| {
                compiled
                    .as_ref()
                    .map_or(true, |f| f.matches(&record.metadata))
            })
            .map(|record| {
                (
                    self.similarity.score(vector, &record.vector),
                    record.chunk_id.as_str(),
                )
            })
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, chunk_id)| ScoredId {
                chunk_id: chunk_id.to_string(),
                score,
            })
            .collect())
    }

    fn inventory(&self) -> BTreeMap<String, RecordInfo> {
        self.records
            .iter()
            .map(|(id, record)| {
                (
                    id.clone(),
                    RecordInfo {
                        path: record.metadata.path.clone(),
                        index_version: record.metadata.index_version,
                    },
                )
            })
            .collect()
    }
}

#[derive(Serialize)]
struct PersistedStoreOut<'a> {
    schema_version: u32,
    similarity: Similarity,
    dimension: Option<usize>,
    generation: u64,
    records: Vec<&'a VectorRecord>,
}

#[derive(Deserialize)]
struct PersistedStoreIn {
    schema_version: u32,
    similarity: Similarity,
    dimension: Option<usize>,
    generation: u64,
    records: Vec<VectorRecord>,
}

/// Brute-force store: copy-on-write record map behind an `Arc` that is swapped
/// under a short write lock. Optionally persisted as one JSON document.
pub struct InMemoryVectorStore {
    path: Option<PathBuf>,
    similarity: Similarity,
    current: RwLock<Arc<MemoryGeneration>>,
    writer: tokio::sync::Mutex<()>,
}

impl InMemoryVectorStore {
    /// Volatile store.
    #[must_use]
    pub fn new(similarity: Similarity) -> Self {
        Self::from_generation(None, empty_generation(0, similarity))
    }

    /// Load `path` if it exists, otherwise start empty. Commits are persisted to `path`.
    pub async fn open(path: impl AsRef<Path>, similarity: Similarity) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::from_generation(
                    Some(path),
                    empty_generation(0, similarity),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        let persisted: PersistedStoreIn =
            serde_json::from_slice(&bytes).map_err(|err| VectorStoreError::IncompatibleFormat {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;
        if persisted.schema_version != VECTOR_STORE_SCHEMA_VERSION {
            return Err(VectorStoreError::IncompatibleFormat {
                path: path.display().to_string(),
                reason: format!(
                    "schema_version {} (expected {VECTOR_STORE_SCHEMA_VERSION})",
                    persisted.schema_version
                ),
            });
        }
        if persisted.similarity != similarity {
            return Err(VectorStoreError::SimilarityMismatch {
                store: persisted.similarity.to_string(),
                requested: similarity.to_string(),
            });
        }

        let mut records = BTreeMap::new();
        for record in persisted.records {
            if let Some(expected) = persisted.dimension {
                if record.vector.len() != expected {
                    return Err(VectorStoreError::IncompatibleFormat {
                        path: path.display().to_string(),
                        reason: format!(
                            "record {} has dimension {} (expected {expected})",
                            record.chunk_id,
                            record.vector.len()
                        ),
                    });
                }
            }
            records.insert(record.chunk_id.clone(), Arc::new(record));
        }

        log::info!("Loaded {} vectors from {}", records.len(), path.display());
        Ok(Self::from_generation(
            Some(path),
            MemoryGeneration {
                id: persisted.generation,
                similarity,
                dimension: persisted.dimension,
                records,
            },
        ))
    }

    fn from_generation(path: Option<PathBuf>, generation: MemoryGeneration) -> Self {
        Self {
            path,
            similarity: generation.similarity,
            current: RwLock::new(Arc::new(generation)),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn current(&self) -> Arc<MemoryGeneration> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn publish(&self, generation: MemoryGeneration) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(generation);
    }

    async fn write_to_disk(&self, generation: &MemoryGeneration) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let persisted = PersistedStoreOut {
            schema_version: VECTOR_STORE_SCHEMA_VERSION,
            similarity: generation.similarity,
            dimension: generation.dimension,
            generation: generation.id,
            records: generation.records.values().map(AsRef::as_ref).collect(),
        };
        let bytes = serde_json::to_vec(&persisted)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn empty_generation(id: u64, similarity: Similarity) -> MemoryGeneration {
    MemoryGeneration {
        id,
        similarity,
        dimension: None,
        records: BTreeMap::new(),
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn similarity(&self) -> Similarity {
        self.similarity
    }

    fn snapshot(&self) -> Generation {
        self.current()
    }

    async fn commit(&self, batch: WriteBatch) -> Result<CommitStats> {
        let _writer = self.writer.lock().await;
        let current = self.current();
        if batch.is_empty() {
            return Ok(CommitStats {
                generation: current.id,
                upserted: 0,
                deleted: 0,
            });
        }

        let mut records = current.records.clone();
        let mut dimension = current.dimension;
        let mut deleted = 0;
        for chunk_id in &batch.deletes {
            if records.remove(chunk_id).is_some() {
                deleted += 1;
            }
        }
        if records.is_empty() {
            dimension = None;
        }

        let upserted = batch.upserts.len();
        for record in batch.upserts {
            let expected = *dimension.get_or_insert(record.vector.len());
            if record.vector.len() != expected {
                return Err(VectorStoreError::InvalidDimension {
                    expected,
                    actual: record.vector.len(),
                });
            }
            records.insert(record.chunk_id.clone(), Arc::new(record));
        }

        let next = MemoryGeneration {
            id: current.id + 1,
            similarity: self.similarity,
            dimension,
            records,
        };
        // A failed write leaves `current` published.
        self.write_to_disk(&next).await?;
        let generation = next.id;
        self.publish(next);

        log::debug!("Published generation {generation}: +{upserted} -{deleted}");
        Ok(CommitStats {
            generation,
            upserted,
            deleted,
        })
    }

    async fn persist(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let current = self.current();
        self.write_to_disk(&current).await
    }

    async fn clear(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let current = self.current();
        let next = empty_generation(current.id + 1, self.similarity);
        self.write_to_disk(&next).await?;
        self.publish(next);
        Ok(())
    }
}
