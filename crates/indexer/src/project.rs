use crate::index_state::{load_state, state_path_for_project_root, ProjectIndexState, StateLoad};
use crate::{IndexerError, Result};
use codesearch_vector_store::paths::{state_dir_for_project_root, vectors_path_for_project_root};
use codesearch_vector_store::{InMemoryVectorStore, Similarity, VectorStore, VectorStoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    Full,
    Incremental,
}

impl IndexMode {
    /// Coalesced requests: a full rebuild subsumes an incremental one.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Incremental, Self::Incremental) => Self::Incremental,
            _ => Self::Full,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

/// Why an index cannot serve queries until a full rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    ModelChanged { index: String, embedder: String },
    StateIncompatible(String),
    StoreIncompatible(String),
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelChanged { index, embedder } => {
                write!(f, "index built with {index}, embedder is {embedder}")
            }
            Self::StateIncompatible(reason) => write!(f, "state: {reason}"),
            Self::StoreIncompatible(reason) => write!(f, "store: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexPhase {
    Empty,
    Indexing(IndexMode),
    Ready,
    Stale(StaleReason),
}

/// Why a query cannot be answered right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotQueryable {
    Empty,
    Stale(StaleReason),
    ModelMismatch { index: String, query: String },
}

#[derive(Debug, Default)]
struct Status {
    state: Option<Arc<ProjectIndexState>>,
    stale: Option<StaleReason>,
    running: Option<IndexMode>,
}

impl Status {
    fn phase(&self) -> IndexPhase {
        if let Some(mode) = self.running {
            return IndexPhase::Indexing(mode);
        }
        if let Some(reason) = &self.stale {
            return IndexPhase::Stale(reason.clone());
        }
        if self.state.is_some() {
            IndexPhase::Ready
        } else {
            IndexPhase::Empty
        }
    }
}

/// Shared handle on one project's index: its store, committed state and
/// lifecycle phase. Readers and the indexer both hold it.
pub struct ProjectIndex {
    root: PathBuf,
    store: Arc<dyn VectorStore>,
    status: RwLock<Status>,
    phase_tx: watch::Sender<IndexPhase>,
}

impl std::fmt::Debug for ProjectIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectIndex")
            .field("root", &self.root)
            .field("phase", &self.phase())
            .finish()
    }
}

impl ProjectIndex {
    /// Open the persisted index under `<root>/.codesearch`.
    ///
    /// A store written in an incompatible format is discarded and the index
    /// comes up Stale; a missing store comes up Empty.
    pub async fn open(root: impl AsRef<Path>, similarity: Similarity) -> Result<Arc<Self>> {
        let root = canonical_root(root.as_ref()).await?;
        let vectors_path = vectors_path_for_project_root(&root);

        let (store, stale) = match InMemoryVectorStore::open(&vectors_path, similarity).await {
            Ok(store) => (store, None),
            Err(
                err @ (VectorStoreError::IncompatibleFormat { .. }
                | VectorStoreError::SimilarityMismatch { .. }),
            ) => {
                log::warn!("Discarding vector store at {}: {err}", vectors_path.display());
                tokio::fs::remove_file(&vectors_path).await?;
                let store = InMemoryVectorStore::open(&vectors_path, similarity).await?;
                (store, Some(StaleReason::StoreIncompatible(err.to_string())))
            }
            Err(err) => return Err(err.into()),
        };

        let index = Self::with_store(&root, Arc::new(store)).await?;
        if let Some(reason) = stale {
            index.mark_stale(reason);
        }
        Ok(index)
    }

    /// Attach a caller-provided store to the persisted state of `root`.
    pub async fn with_store(root: impl AsRef<Path>, store: Arc<dyn VectorStore>) -> Result<Arc<Self>> {
        let root = canonical_root(root.as_ref()).await?;
        let state_path = state_path_for_project_root(&root);

        let mut status = Status::default();
        match load_state(&state_path).await? {
            StateLoad::Missing => {}
            StateLoad::Loaded(state) if state.similarity != store.similarity() => {
                status.stale = Some(StaleReason::StateIncompatible(format!(
                    "state built with {} similarity, store uses {}",
                    state.similarity,
                    store.similarity()
                )));
                status.state = Some(Arc::new(state));
            }
            StateLoad::Loaded(state) => status.state = Some(Arc::new(state)),
            StateLoad::Incompatible(reason) => {
                log::warn!("Index state at {} unusable: {reason}", state_path.display());
                status.stale = Some(StaleReason::StateIncompatible(reason));
            }
        }

        let (phase_tx, _) = watch::channel(status.phase());
        Ok(Arc::new(Self {
            root,
            store,
            status: RwLock::new(status),
            phase_tx,
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        state_dir_for_project_root(&self.root)
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Last committed state, if any.
    pub fn state(&self) -> Option<Arc<ProjectIndexState>> {
        self.read_status().state.clone()
    }

    pub fn stale_reason(&self) -> Option<StaleReason> {
        self.read_status().stale.clone()
    }

    pub fn phase(&self) -> IndexPhase {
        self.read_status().phase()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<IndexPhase> {
        self.phase_tx.subscribe()
    }

    /// State a query against `model_id` may read, or why none is available.
    ///
    /// An index being rebuilt keeps serving its previous committed state.
    pub fn queryable_state(
        &self,
        model_id: &str,
    ) -> std::result::Result<Arc<ProjectIndexState>, NotQueryable> {
        let status = self.read_status();
        if let Some(reason) = &status.stale {
            return Err(NotQueryable::Stale(reason.clone()));
        }
        let Some(state) = &status.state else {
            return Err(NotQueryable::Empty);
        };
        if state.model_id != model_id {
            return Err(NotQueryable::ModelMismatch {
                index: state.model_id.clone(),
                query: model_id.to_string(),
            });
        }
        Ok(Arc::clone(state))
    }

    /// Flag the index Stale when `model_id` differs from the committed one.
    pub fn note_embedder_model(&self, model_id: &str) {
        let reason = {
            let status = self.read_status();
            match &status.state {
                Some(state) if state.model_id != model_id && status.stale.is_none() => {
                    Some(StaleReason::ModelChanged {
                        index: state.model_id.clone(),
                        embedder: model_id.to_string(),
                    })
                }
                _ => None,
            }
        };
        if let Some(reason) = reason {
            log::warn!("Index for {} is stale: {reason}", self.root.display());
            self.mark_stale(reason);
        }
    }

    pub(crate) fn begin_run(&self, mode: IndexMode) -> RunningGuard<'_> {
        self.update(|status| status.running = Some(mode));
        RunningGuard { index: self }
    }

    /// Publish a freshly committed state; clears any staleness.
    pub(crate) fn publish_state(&self, state: ProjectIndexState) {
        self.update(|status| {
            status.state = Some(Arc::new(state));
            status.stale = None;
        });
    }

    pub(crate) fn mark_stale(&self, reason: StaleReason) {
        self.update(|status| status.stale = Some(reason));
    }

    pub(crate) fn reset(&self) {
        self.update(|status| {
            status.state = None;
            status.stale = None;
        });
    }

    fn update(&self, apply: impl FnOnce(&mut Status)) {
        let phase = {
            let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
            apply(&mut status);
            status.phase()
        };
        self.phase_tx.send_replace(phase);
    }

    fn read_status(&self) -> std::sync::RwLockReadGuard<'_, Status> {
        self.status.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the running mode when a run ends, however it ends.
pub(crate) struct RunningGuard<'a> {
    index: &'a ProjectIndex,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.index.update(|status| status.running = None);
    }
}

async fn canonical_root(root: &Path) -> Result<PathBuf> {
    let canonical = tokio::fs::canonicalize(root)
        .await
        .map_err(|err| IndexerError::InvalidPath(format!("{}: {err}", root.display())))?;
    if !tokio::fs::metadata(&canonical).await?.is_dir() {
        return Err(IndexerError::InvalidPath(format!(
            "{} is not a directory",
            canonical.display()
        )));
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_state::save_state;
    use tempfile::TempDir;

    #[test]
    fn full_dominates_when_merging() {
        assert_eq!(IndexMode::Incremental.merge(IndexMode::Incremental), IndexMode::Incremental);
        assert_eq!(IndexMode::Incremental.merge(IndexMode::Full), IndexMode::Full);
        assert_eq!(IndexMode::Full.merge(IndexMode::Incremental), IndexMode::Full);
    }

    #[tokio::test]
    async fn fresh_project_is_empty() {
        let dir = TempDir::new().unwrap();
        let index = ProjectIndex::open(dir.path(), Similarity::Cosine).await.unwrap();
        assert_eq!(index.phase(), IndexPhase::Empty);
        assert_eq!(index.queryable_state("m"), Err(NotQueryable::Empty));
    }

    #[tokio::test]
    async fn missing_root_is_invalid() {
        let dir = TempDir::new().unwrap();
        let err = ProjectIndex::open(dir.path().join("nope"), Similarity::Cosine)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn corrupt_store_comes_up_stale() {
        let dir = TempDir::new().unwrap();
        let vectors = vectors_path_for_project_root(dir.path());
        std::fs::create_dir_all(vectors.parent().unwrap()).unwrap();
        std::fs::write(&vectors, b"garbage").unwrap();

        let index = ProjectIndex::open(dir.path(), Similarity::Cosine).await.unwrap();
        assert!(matches!(
            index.phase(),
            IndexPhase::Stale(StaleReason::StoreIncompatible(_))
        ));
        assert!(index.store().is_empty());
    }

    #[tokio::test]
    async fn model_change_marks_stale() {
        let dir = TempDir::new().unwrap();
        let state = ProjectIndexState::new("model-a", Similarity::Cosine, 1);
        save_state(&state_path_for_project_root(dir.path()), &state)
            .await
            .unwrap();

        let index = ProjectIndex::open(dir.path(), Similarity::Cosine).await.unwrap();
        assert_eq!(index.phase(), IndexPhase::Ready);
        assert!(matches!(
            index.queryable_state("model-b"),
            Err(NotQueryable::ModelMismatch { .. })
        ));

        let mut phases = index.subscribe_phase();
        index.note_embedder_model("model-b");
        assert!(phases.has_changed().unwrap());
        assert!(matches!(
            *phases.borrow_and_update(),
            IndexPhase::Stale(StaleReason::ModelChanged { .. })
        ));
    }
}
