use crate::embed_pool::RetryPolicy;
use crate::limits::{default_embed_concurrency, parse_concurrency};
use crate::scanner::MAX_FILE_SIZE_BYTES;
use crate::watcher::WatchConfig;
use anyhow::Context;
use codesearch_vector_store::paths::{state_dir_for_project_root, CONFIG_FILE_NAME};
use codesearch_vector_store::{Similarity, DEFAULT_LRU_CAPACITY};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_EMBED_CONCURRENCY: &str = "CODESEARCH_EMBED_CONCURRENCY";
pub const ENV_MAX_FILE_BYTES: &str = "CODESEARCH_MAX_FILE_BYTES";

/// Indexer settings, read from the `[indexer]` table of
/// `<root>/.codesearch/config.toml` and then overridden from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub embed_concurrency: usize,
    pub max_file_bytes: u64,
    pub embed_retry_attempts: u32,
    pub embed_retry_base_ms: u64,
    pub debounce_ms: u64,
    pub max_batch_wait_ms: u64,
    pub poll_interval_ms: u64,
    pub cache_lru_capacity: usize,
    pub similarity: Similarity,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            embed_concurrency: default_embed_concurrency(),
            max_file_bytes: MAX_FILE_SIZE_BYTES,
            embed_retry_attempts: 3,
            embed_retry_base_ms: 50,
            debounce_ms: 300,
            max_batch_wait_ms: 3000,
            poll_interval_ms: 2000,
            cache_lru_capacity: DEFAULT_LRU_CAPACITY,
            similarity: Similarity::Cosine,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    indexer: Option<IndexerConfig>,
}

impl IndexerConfig {
    /// Load the project's config file (if any) and apply env overrides.
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        let path = state_dir_for_project_root(root).join(CONFIG_FILE_NAME);
        let config = match std::fs::read_to_string(&path) {
            Ok(raw) => Self::from_toml_str(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        Ok(config.with_env_overrides())
    }

    /// Parse a config document; tables other than `[indexer]` are ignored.
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = toml::from_str(raw).context("Invalid config TOML")?;
        Ok(file.indexer.unwrap_or_default().normalized())
    }

    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        let concurrency = std::env::var(ENV_EMBED_CONCURRENCY).ok();
        let max_bytes = std::env::var(ENV_MAX_FILE_BYTES).ok();
        self.apply_overrides(concurrency.as_deref(), max_bytes.as_deref())
    }

    fn apply_overrides(mut self, concurrency: Option<&str>, max_bytes: Option<&str>) -> Self {
        self.embed_concurrency = parse_concurrency(concurrency, self.embed_concurrency);
        if let Some(bytes) = max_bytes.and_then(|raw| raw.trim().parse::<u64>().ok()) {
            self.max_file_bytes = bytes;
        }
        self.normalized()
    }

    fn normalized(mut self) -> Self {
        self.embed_concurrency = parse_concurrency(None, self.embed_concurrency);
        self.embed_retry_attempts = self.embed_retry_attempts.max(1);
        self.max_batch_wait_ms = self.max_batch_wait_ms.max(self.debounce_ms);
        self
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.embed_retry_attempts,
            base_delay: Duration::from_millis(self.embed_retry_base_ms),
        }
    }

    #[must_use]
    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            max_batch_wait: Duration::from_millis(self.max_batch_wait_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_indexer_table_and_ignores_others() {
        let raw = r#"
            [search]
            default_k = 5

            [indexer]
            embed_concurrency = 4
            debounce_ms = 100
            similarity = "inner_product"
        "#;
        let config = IndexerConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.embed_concurrency, 4);
        assert_eq!(config.debounce_ms, 100);
        assert_eq!(config.similarity, Similarity::InnerProduct);
        assert_eq!(config.max_file_bytes, MAX_FILE_SIZE_BYTES);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(IndexerConfig::from_toml_str("[indexer\nembed_concurrency = ").is_err());
        assert!(IndexerConfig::from_toml_str("[indexer]\nembed_concurrency = \"many\"").is_err());
    }

    #[test]
    fn overrides_are_clamped() {
        let config = IndexerConfig::default().apply_overrides(Some("500"), Some("2048"));
        assert_eq!(config.embed_concurrency, crate::limits::MAX_EMBED_CONCURRENCY);
        assert_eq!(config.max_file_bytes, 2048);

        let config = IndexerConfig::default().apply_overrides(Some("0"), Some("nope"));
        assert_eq!(config.embed_concurrency, 1);
        assert_eq!(config.max_file_bytes, MAX_FILE_SIZE_BYTES);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = IndexerConfig::load(dir.path()).unwrap();
        assert_eq!(config.embed_retry_attempts, 3);
        assert_eq!(config.debounce_ms, 300);
    }
}
