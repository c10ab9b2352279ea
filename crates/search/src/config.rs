use anyhow::Context;
use codesearch_vector_store::paths::{state_dir_for_project_root, CONFIG_FILE_NAME};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_K: usize = 10;
pub const DEFAULT_TOKEN_BUDGET: usize = 8000;

/// Retrieval and aggregation settings (`[search]` in `.codesearch/config.toml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_k: usize,
    /// Candidates fetched per requested result before re-ranking.
    pub over_fetch: usize,
    pub max_candidates: usize,
    pub token_budget: usize,
    pub rerank_timeout_ms: u64,
    pub query_timeout_ms: u64,
    /// Capacity of the `context_stream` channel.
    pub stream_buffer: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_k: DEFAULT_K,
            over_fetch: 3,
            max_candidates: 200,
            token_budget: DEFAULT_TOKEN_BUDGET,
            rerank_timeout_ms: 500,
            query_timeout_ms: 2000,
            stream_buffer: 16,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    search: Option<SearchConfig>,
}

impl SearchConfig {
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        let path = state_dir_for_project_root(root).join(CONFIG_FILE_NAME);
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                Self::from_toml_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Parse a config document; tables other than `[search]` are ignored.
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = toml::from_str(raw).context("Invalid config TOML")?;
        Ok(file.search.unwrap_or_default().normalized())
    }

    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.default_k = self.default_k.max(1);
        self.over_fetch = self.over_fetch.max(1);
        self.max_candidates = self.max_candidates.max(1);
        self.stream_buffer = self.stream_buffer.max(1);
        self
    }

    /// Number of candidates to pull from the store for `k` results.
    #[must_use]
    pub fn candidate_count(&self, k: usize) -> usize {
        k.saturating_mul(self.over_fetch).min(self.max_candidates)
    }

    #[must_use]
    pub const fn rerank_timeout(&self) -> Duration {
        Duration::from_millis(self.rerank_timeout_ms)
    }

    #[must_use]
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}
