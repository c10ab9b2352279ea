use std::path::{Path, PathBuf};

pub const STATE_DIR_NAME: &str = ".codesearch";

pub const VECTORS_FILE_NAME: &str = "vectors.json";
pub const STATE_FILE_NAME: &str = "state.json";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const LOCK_FILE_NAME: &str = "index.lock";

#[must_use]
pub fn state_dir_for_project_root(root: &Path) -> PathBuf {
    root.join(STATE_DIR_NAME)
}

#[must_use]
pub fn vectors_path_for_project_root(root: &Path) -> PathBuf {
    state_dir_for_project_root(root).join(VECTORS_FILE_NAME)
}

#[must_use]
pub fn embedding_cache_dir_for_project_root(root: &Path) -> PathBuf {
    state_dir_for_project_root(root)
        .join("cache")
        .join("embeddings")
}

#[must_use]
pub fn is_state_dir_name(name: &str) -> bool {
    name == STATE_DIR_NAME
}
