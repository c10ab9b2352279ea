use crate::config::IndexerConfig;
use crate::embed_pool::EmbeddingPool;
use crate::index_lock::acquire_index_write_lock;
use crate::index_state::{
    remove_state, stage_state, state_path_for_project_root, FileIndexState, ProjectIndexState,
};
use crate::project::{IndexMode, ProjectIndex, StaleReason};
use crate::scanner::{is_probably_binary, FileScanner, ScannedFile};
use crate::stats::IndexStats;
use crate::{IndexerError, Result};
use codesearch_chunker::{
    chunk_source, content_hash, Chunk, Chunker, FallbackReason, TreeSitterChunker,
};
use codesearch_vector_store::paths::embedding_cache_dir_for_project_root;
use codesearch_vector_store::{Embedder, EmbeddingCache, RecordInfo, VectorRecord, WriteBatch};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A file that was read and chunked in this run.
struct FileWork {
    rel_path: String,
    mtime_ms: u64,
    content_hash: String,
    chunks: Vec<Chunk>,
    /// Chunks that still need a vector.
    pending: Vec<usize>,
    failed: HashSet<usize>,
}

impl FileWork {
    fn into_state(self) -> FileIndexState {
        let chunk_ids = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(idx, _)| !self.failed.contains(idx))
            .map(|(_, chunk)| chunk.id.clone())
            .collect();
        FileIndexState {
            path: self.rel_path,
            mtime_ms: self.mtime_ms,
            content_hash: self.content_hash,
            chunk_ids,
            complete: self.failed.is_empty(),
        }
    }
}

enum SourceRead {
    Text(Vec<u8>),
    Binary,
    Unreadable(String),
}

/// Builds and maintains the index of one project.
///
/// Runs are serialized: in-process by an async mutex, across processes by the
/// `.codesearch/index.lock` file lock. Every run ends in at most one store
/// commit followed by one state save, so readers see either the previous
/// index or the new one.
pub struct ProjectIndexer {
    index: Arc<ProjectIndex>,
    chunker: Arc<dyn Chunker>,
    pool: Arc<EmbeddingPool>,
    config: IndexerConfig,
    writer: tokio::sync::Mutex<()>,
}

impl ProjectIndexer {
    pub async fn new(
        index: Arc<ProjectIndex>,
        embedder: Arc<dyn Embedder>,
        config: IndexerConfig,
    ) -> Result<Self> {
        let cache_dir = embedding_cache_dir_for_project_root(index.root());
        let cache = EmbeddingCache::open(&cache_dir, config.cache_lru_capacity).await?;
        if cache.recovered_from_corruption() {
            log::warn!("Embedding cache at {} was reset", cache_dir.display());
        }

        index.note_embedder_model(embedder.model_id());
        let pool = EmbeddingPool::new(
            embedder,
            Arc::new(cache),
            config.embed_concurrency,
            config.retry_policy(),
        );

        Ok(Self {
            index,
            chunker: Arc::new(TreeSitterChunker),
            pool: Arc::new(pool),
            config,
            writer: tokio::sync::Mutex::new(()),
        })
    }

    /// Open `root` with its `.codesearch/config.toml` settings.
    pub async fn open(root: impl AsRef<Path>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let config = IndexerConfig::load(root.as_ref())
            .map_err(|err| IndexerError::Other(format!("{err:#}")))?;
        let index = ProjectIndex::open(root, config.similarity).await?;
        Self::new(index, embedder, config).await
    }

    #[must_use]
    pub fn with_chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn index(&self) -> &Arc<ProjectIndex> {
        &self.index
    }

    pub fn pool(&self) -> &EmbeddingPool {
        &self.pool
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn model_id(&self) -> &str {
        self.pool.model_id()
    }

    pub async fn index_full(&self) -> Result<IndexStats> {
        self.run(IndexMode::Full, &CancellationToken::new()).await
    }

    pub async fn index_incremental(&self) -> Result<IndexStats> {
        self.run(IndexMode::Incremental, &CancellationToken::new()).await
    }

    /// Run one indexing pass. Cancelling `cancel` before the commit leaves the
    /// committed index untouched.
    pub async fn run(&self, mode: IndexMode, cancel: &CancellationToken) -> Result<IndexStats> {
        let start = Instant::now();
        let _writer = self.writer.lock().await;
        let lock = acquire_index_write_lock(self.index.root()).await?;

        let mode = self.resolve_mode(mode)?;
        let _running = self.index.begin_run(mode);
        log::info!(
            "Starting {} index of {}",
            mode.as_str(),
            self.index.root().display()
        );

        let mut stats = IndexStats::new(mode);
        stats.lock_wait_ms = lock.wait_ms();
        let result = match mode {
            IndexMode::Full => self.run_full(cancel, &mut stats).await,
            IndexMode::Incremental => self.run_incremental(cancel, &mut stats).await,
        };
        stats.time_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(()) => {
                log::info!(
                    "Indexed {} files ({} unchanged) in {}ms: +{} -{} chunks, {} cache hits, {} embedded",
                    stats.files_processed,
                    stats.files_unchanged,
                    stats.time_ms,
                    stats.upserts,
                    stats.deletes,
                    stats.cache_hits,
                    stats.embedded
                );
                Ok(stats)
            }
            Err(err) => {
                log::warn!("{} index of {} failed: {err}", mode.as_str(), self.index.root().display());
                Err(err)
            }
        }
    }

    /// Delete the persisted state and every stored vector.
    pub async fn wipe(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let _lock = acquire_index_write_lock(self.index.root()).await?;
        self.index.store().clear().await?;
        remove_state(&state_path_for_project_root(self.index.root())).await?;
        self.index.reset();
        log::info!("Wiped index for {}", self.index.root().display());
        Ok(())
    }

    fn resolve_mode(&self, requested: IndexMode) -> Result<IndexMode> {
        if requested == IndexMode::Full {
            return Ok(IndexMode::Full);
        }
        if let Some(reason) = self.index.stale_reason() {
            return Err(match reason {
                StaleReason::ModelChanged { index, embedder } => {
                    IndexerError::ModelMismatch { index, embedder }
                }
                other => IndexerError::StaleIndex {
                    reason: other.to_string(),
                },
            });
        }
        match self.index.state() {
            None => {
                log::info!(
                    "No committed index for {}; running a full build",
                    self.index.root().display()
                );
                Ok(IndexMode::Full)
            }
            Some(state) if state.model_id != self.pool.model_id() => {
                Err(IndexerError::ModelMismatch {
                    index: state.model_id.clone(),
                    embedder: self.pool.model_id().to_string(),
                })
            }
            Some(_) => Ok(IndexMode::Incremental),
        }
    }

    async fn run_full(&self, cancel: &CancellationToken, stats: &mut IndexStats) -> Result<()> {
        let model = self.pool.model_id().to_string();
        let similarity = self.index.store().similarity();
        let inventory = self.index.store().inventory();
        let current = self.index.state();

        // Records already written under the current version are reused;
        // anything else gets a fresh version so stale vectors cannot mix in.
        let reusable = current.as_ref().filter(|state| {
            state.model_id == model
                && state.similarity == similarity
                && self.index.stale_reason().is_none()
        });
        let index_version = match reusable {
            Some(state) => state.index_version,
            None => {
                current
                    .as_ref()
                    .map(|state| state.index_version)
                    .into_iter()
                    .chain(inventory.values().map(|info| info.index_version))
                    .max()
                    .unwrap_or(0)
                    + 1
            }
        };
        stats.index_version = index_version;

        let files = self.scan().await?;
        stats.files_scanned = files.len();

        let mut works = Vec::with_capacity(files.len());
        let mut retained = Vec::new();
        for file in &files {
            check_cancelled(cancel)?;
            let bytes = match read_source(file).await {
                SourceRead::Text(bytes) => bytes,
                SourceRead::Binary => {
                    stats.files_skipped += 1;
                    continue;
                }
                SourceRead::Unreadable(err) => {
                    stats.files_skipped += 1;
                    stats.add_error(err);
                    let previous = current
                        .as_ref()
                        .and_then(|state| state.files.get(&file.rel_path));
                    retained.extend(retained_state(previous, &inventory, index_version));
                    continue;
                }
            };

            let hash = content_hash(&bytes);
            let mut work = self.chunk_file(file, &bytes, hash, stats);
            work.pending = work
                .chunks
                .iter()
                .enumerate()
                .filter(|(_, chunk)| {
                    !inventory
                        .get(&chunk.id)
                        .is_some_and(|info| info.index_version == index_version)
                })
                .map(|(idx, _)| idx)
                .collect();
            stats.files_processed += 1;
            works.push(work);
        }

        let upserts = self.embed_pending(&mut works, index_version, cancel, stats).await?;

        let files: BTreeMap<String, FileIndexState> = works
            .into_iter()
            .map(FileWork::into_state)
            .chain(retained)
            .map(|state| (state.path.clone(), state))
            .collect();
        let live: HashSet<&str> = files
            .values()
            .flat_map(|file| file.chunk_ids.iter().map(String::as_str))
            .collect();
        let deletes: Vec<String> = inventory
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();

        self.commit(upserts, deletes, files, index_version, cancel, stats)
            .await
    }

    async fn run_incremental(
        &self,
        cancel: &CancellationToken,
        stats: &mut IndexStats,
    ) -> Result<()> {
        let Some(state) = self.index.state() else {
            return Err(IndexerError::Other(
                "incremental run without a committed index".to_string(),
            ));
        };
        let index_version = state.index_version;
        stats.index_version = index_version;

        let files = self.scan().await?;
        stats.files_scanned = files.len();

        let mut next: BTreeMap<String, FileIndexState> = BTreeMap::new();
        let mut works = Vec::new();
        let mut deletes = Vec::new();
        let mut seen = HashSet::with_capacity(files.len());

        for file in &files {
            check_cancelled(cancel)?;
            seen.insert(file.rel_path.as_str());
            let previous = state.files.get(&file.rel_path);

            if let Some(prev) = previous.filter(|p| p.complete && p.mtime_ms == file.mtime_ms) {
                next.insert(file.rel_path.clone(), prev.clone());
                stats.files_unchanged += 1;
                continue;
            }

            let bytes = match read_source(file).await {
                SourceRead::Text(bytes) => bytes,
                SourceRead::Binary => {
                    stats.files_skipped += 1;
                    if let Some(prev) = previous {
                        deletes.extend(prev.chunk_ids.iter().cloned());
                    }
                    continue;
                }
                SourceRead::Unreadable(err) => {
                    stats.files_skipped += 1;
                    stats.add_error(err);
                    let inventory = self.index.store().inventory();
                    if let Some(kept) = retained_state(previous, &inventory, index_version) {
                        next.insert(kept.path.clone(), kept);
                    }
                    continue;
                }
            };

            let hash = content_hash(&bytes);
            if let Some(prev) = previous.filter(|p| p.complete && p.content_hash == hash) {
                next.insert(
                    file.rel_path.clone(),
                    FileIndexState {
                        mtime_ms: file.mtime_ms,
                        ..prev.clone()
                    },
                );
                stats.files_unchanged += 1;
                continue;
            }

            let mut work = self.chunk_file(file, &bytes, hash, stats);
            let old: HashSet<&str> = previous
                .map(|prev| prev.chunk_ids.iter().map(String::as_str).collect())
                .unwrap_or_default();
            let new: HashSet<&str> = work.chunks.iter().map(|c| c.id.as_str()).collect();
            deletes.extend(old.difference(&new).map(|id| (*id).to_string()));
            work.pending = work
                .chunks
                .iter()
                .enumerate()
                .filter(|(_, chunk)| !old.contains(chunk.id.as_str()))
                .map(|(idx, _)| idx)
                .collect();
            stats.files_processed += 1;
            works.push(work);
        }

        for (path, prev) in &state.files {
            if !seen.contains(path.as_str()) {
                log::debug!("{path} removed; dropping {} chunks", prev.chunk_ids.len());
                deletes.extend(prev.chunk_ids.iter().cloned());
                stats.files_removed += 1;
            }
        }

        let upserts = self.embed_pending(&mut works, index_version, cancel, stats).await?;
        for work in works {
            let file = work.into_state();
            next.insert(file.path.clone(), file);
        }
        deletes.sort();
        deletes.dedup();

        self.commit(upserts, deletes, next, index_version, cancel, stats)
            .await
    }

    fn chunk_file(
        &self,
        file: &ScannedFile,
        bytes: &[u8],
        hash: String,
        stats: &mut IndexStats,
    ) -> FileWork {
        let text = String::from_utf8_lossy(bytes);
        let chunked = chunk_source(self.chunker.as_ref(), &file.rel_path, &text);
        if let Some(reason) = &chunked.fallback {
            stats.fallback_chunks += chunked.chunks.len();
            if let FallbackReason::Failed(message) = reason {
                stats.add_error(format!(
                    "{}: chunking failed ({message}); indexed as one chunk",
                    file.rel_path
                ));
            }
        }

        FileWork {
            rel_path: file.rel_path.clone(),
            mtime_ms: file.mtime_ms,
            content_hash: hash,
            chunks: chunked.chunks,
            pending: Vec::new(),
            failed: HashSet::new(),
        }
    }

    /// Embed every pending chunk concurrently (bounded by the pool).
    ///
    /// A chunk whose embedding keeps failing is skipped and its file marked
    /// incomplete; any other error aborts the run.
    async fn embed_pending(
        &self,
        works: &mut [FileWork],
        index_version: u64,
        cancel: &CancellationToken,
        stats: &mut IndexStats,
    ) -> Result<Vec<VectorRecord>> {
        let mut tasks = JoinSet::new();
        for (file_idx, work) in works.iter().enumerate() {
            for &chunk_idx in &work.pending {
                let pool = Arc::clone(&self.pool);
                let text = work.chunks[chunk_idx].text.clone();
                tasks.spawn(async move { (file_idx, chunk_idx, pool.embed(&text).await) });
            }
        }

        let model = self.pool.model_id().to_string();
        let mut records = Vec::with_capacity(tasks.len());
        loop {
            let joined = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(IndexerError::Cancelled),
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            let (file_idx, chunk_idx, outcome) = joined
                .map_err(|err| IndexerError::Other(format!("embedding task failed: {err}")))?;

            let work = &mut works[file_idx];
            match outcome {
                Ok(embedded) => {
                    stats.record_embed(embedded.source);
                    records.push(VectorRecord::from_chunk(
                        &work.chunks[chunk_idx],
                        embedded.vector,
                        &model,
                        index_version,
                    ));
                }
                Err(err) if err.is_chunk_local() => {
                    let chunk = &work.chunks[chunk_idx];
                    log::warn!(
                        "Skipping chunk {} ({}) in {}: {err}",
                        chunk.name,
                        chunk.id,
                        work.rel_path
                    );
                    stats.embedding_failures += 1;
                    stats.add_error(format!(
                        "{}:{}-{} {}: {err}",
                        work.rel_path,
                        chunk.start_line(),
                        chunk.end_line(),
                        chunk.name
                    ));
                    work.failed.insert(chunk_idx);
                }
                Err(err) => return Err(err),
            }
        }

        records.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
        Ok(records)
    }

    async fn commit(
        &self,
        upserts: Vec<VectorRecord>,
        deletes: Vec<String>,
        files: BTreeMap<String, FileIndexState>,
        index_version: u64,
        cancel: &CancellationToken,
        stats: &mut IndexStats,
    ) -> Result<()> {
        check_cancelled(cancel)?;

        let mut state = ProjectIndexState::new(
            self.pool.model_id(),
            self.index.store().similarity(),
            index_version,
        );
        state.files = files;
        state.last_full_build_unix_ms = match stats.mode {
            IndexMode::Full => unix_ms_now(),
            IndexMode::Incremental => self
                .index
                .state()
                .map_or(0, |previous| previous.last_full_build_unix_ms),
        };
        stats.chunks = state.chunk_count();
        stats.upserts = upserts.len();
        stats.deletes = deletes.len();

        // Staged before the store commit; only the rename follows it.
        let staged = stage_state(&state_path_for_project_root(self.index.root()), &state).await?;
        let committed = match self
            .index
            .store()
            .commit(WriteBatch { upserts, deletes })
            .await
        {
            Ok(committed) => committed,
            Err(err) => {
                staged.discard().await;
                return Err(err.into());
            }
        };

        let published = staged.publish().await;
        self.index.publish_state(state);
        if let Err(err) = published {
            log::error!(
                "Store generation {} committed but state.json was not replaced ({err}); \
                 the next run reconciles against the previous state file",
                committed.generation
            );
            return Err(err);
        }
        log::debug!(
            "Published index version {index_version} (store generation {})",
            committed.generation
        );
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<ScannedFile>> {
        let scanner = FileScanner::new(self.index.root(), self.config.max_file_bytes);
        tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .map_err(|err| IndexerError::Other(format!("join scan task: {err}")))
    }
}

async fn read_source(file: &ScannedFile) -> SourceRead {
    match tokio::fs::read(&file.path).await {
        Ok(bytes) if is_probably_binary(&bytes) => {
            log::debug!("Skipping binary file {}", file.rel_path);
            SourceRead::Binary
        }
        Ok(bytes) => SourceRead::Text(bytes),
        Err(err) => {
            log::warn!("Failed to read {}: {err}", file.path.display());
            SourceRead::Unreadable(format!("{}: {err}", file.rel_path))
        }
    }
}

/// State to carry over for a file that could not be read this run.
///
/// Its previous chunks keep serving as long as every one of them is still in
/// the store under `index_version`; otherwise the file drops out until it can
/// be read again.
fn retained_state(
    previous: Option<&FileIndexState>,
    inventory: &BTreeMap<String, RecordInfo>,
    index_version: u64,
) -> Option<FileIndexState> {
    let previous = previous?;
    let current = previous.chunk_ids.iter().all(|id| {
        inventory
            .get(id)
            .is_some_and(|info| info.index_version == index_version)
    });
    if current {
        log::debug!(
            "Keeping {} previous chunks of unreadable {}",
            previous.chunk_ids.len(),
            previous.path
        );
        Some(previous.clone())
    } else {
        None
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(IndexerError::Cancelled)
    } else {
        Ok(())
    }
}

fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_state(path: &str, ids: &[&str]) -> FileIndexState {
        FileIndexState {
            path: path.to_string(),
            mtime_ms: 1,
            content_hash: "h".to_string(),
            chunk_ids: ids.iter().map(|id| (*id).to_string()).collect(),
            complete: true,
        }
    }

    fn inventory(entries: &[(&str, u64)]) -> BTreeMap<String, RecordInfo> {
        entries
            .iter()
            .map(|(id, version)| {
                (
                    (*id).to_string(),
                    RecordInfo {
                        path: "a.py".to_string(),
                        index_version: *version,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn unreadable_file_keeps_chunks_of_current_version() {
        let previous = file_state("a.py", &["a1", "a2"]);
        let kept = retained_state(Some(&previous), &inventory(&[("a1", 4), ("a2", 4)]), 4);
        assert_eq!(kept, Some(previous));
    }

    #[test]
    fn unreadable_file_drops_out_after_version_bump() {
        let previous = file_state("a.py", &["a1"]);
        assert_eq!(retained_state(Some(&previous), &inventory(&[("a1", 4)]), 5), None);
        assert_eq!(retained_state(Some(&previous), &inventory(&[]), 4), None);
        assert_eq!(retained_state(None, &inventory(&[("a1", 4)]), 4), None);
    }
}
