use crate::Result;
use codesearch_vector_store::paths::{state_dir_for_project_root, STATE_FILE_NAME};
use codesearch_vector_store::Similarity;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const INDEX_STATE_SCHEMA_VERSION: u32 = 1;

/// What the index knows about one source file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct FileIndexState {
    pub path: String,
    pub mtime_ms: u64,
    pub content_hash: String,
    /// Chunks of this file present in the store.
    pub chunk_ids: Vec<String>,
    /// False when some chunk failed to embed; the file is retried next run.
    #[serde(default = "default_complete")]
    pub complete: bool,
}

const fn default_complete() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct ProjectIndexState {
    pub schema_version: u32,
    pub index_version: u64,
    pub model_id: String,
    #[schemars(with = "String")]
    pub similarity: Similarity,
    #[serde(default)]
    pub last_full_build_unix_ms: u64,
    #[serde(default)]
    pub files: BTreeMap<String, FileIndexState>,
}

impl ProjectIndexState {
    #[must_use]
    pub fn new(model_id: impl Into<String>, similarity: Similarity, index_version: u64) -> Self {
        Self {
            schema_version: INDEX_STATE_SCHEMA_VERSION,
            index_version,
            model_id: model_id.into(),
            similarity,
            last_full_build_unix_ms: 0,
            files: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.files.values().map(|f| f.chunk_ids.len()).sum()
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = &str> {
        self.files
            .values()
            .flat_map(|f| f.chunk_ids.iter().map(String::as_str))
    }
}

/// Result of reading `state.json`.
#[derive(Debug)]
pub enum StateLoad {
    Missing,
    Loaded(ProjectIndexState),
    /// Present but unreadable or from another schema.
    Incompatible(String),
}

#[must_use]
pub fn state_path_for_project_root(root: &Path) -> PathBuf {
    state_dir_for_project_root(root).join(STATE_FILE_NAME)
}

pub async fn load_state(path: &Path) -> Result<StateLoad> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(StateLoad::Missing),
        Err(err) => return Err(err.into()),
    };

    let state: ProjectIndexState = match serde_json::from_slice(&raw) {
        Ok(state) => state,
        Err(err) => return Ok(StateLoad::Incompatible(format!("corrupt state file: {err}"))),
    };
    if state.schema_version != INDEX_STATE_SCHEMA_VERSION {
        return Ok(StateLoad::Incompatible(format!(
            "state schema {} (expected {INDEX_STATE_SCHEMA_VERSION})",
            state.schema_version
        )));
    }
    Ok(StateLoad::Loaded(state))
}

/// Write via a temp file and rename so readers never see a torn file.
pub async fn save_state(path: &Path, state: &ProjectIndexState) -> Result<()> {
    stage_state(path, state).await?.publish().await
}

/// A serialized state written next to `state.json` but not yet in place.
#[derive(Debug)]
pub struct StagedState {
    tmp: PathBuf,
    path: PathBuf,
}

/// Write `state` to its temp file; nothing is visible until [`StagedState::publish`].
pub async fn stage_state(path: &Path, state: &ProjectIndexState) -> Result<StagedState> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    Ok(StagedState {
        tmp,
        path: path.to_path_buf(),
    })
}

impl StagedState {
    pub async fn publish(self) -> Result<()> {
        tokio::fs::rename(&self.tmp, &self.path).await?;
        Ok(())
    }

    pub async fn discard(self) {
        if let Err(err) = tokio::fs::remove_file(&self.tmp).await {
            log::debug!("Failed to remove staged state {}: {err}", self.tmp.display());
        }
    }
}

pub async fn remove_state(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// JSON schema of the persisted state file.
pub fn state_json_schema() -> Result<serde_json::Value> {
    Ok(serde_json::to_value(schemars::schema_for!(
        ProjectIndexState
    ))?)
}
