use crate::{IndexerError, Result};
use codesearch_vector_store::paths::{state_dir_for_project_root, LOCK_FILE_NAME};
use fs2::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static INDEX_WRITE_LOCK_WAIT_MS_LAST: AtomicU64 = AtomicU64::new(0);
static INDEX_WRITE_LOCK_WAIT_MS_MAX: AtomicU64 = AtomicU64::new(0);

pub fn index_write_lock_wait_ms_last() -> u64 {
    INDEX_WRITE_LOCK_WAIT_MS_LAST.load(Ordering::Relaxed)
}

pub fn index_write_lock_wait_ms_max() -> u64 {
    INDEX_WRITE_LOCK_WAIT_MS_MAX.load(Ordering::Relaxed)
}

fn record_wait(wait_ms: u64) {
    INDEX_WRITE_LOCK_WAIT_MS_LAST.store(wait_ms, Ordering::Relaxed);
    INDEX_WRITE_LOCK_WAIT_MS_MAX.fetch_max(wait_ms, Ordering::Relaxed);
}

/// Cross-process writer lock on `<root>/.codesearch/index.lock`.
///
/// Two processes indexing the same root serialize here; in-process writers
/// are already serialized by the indexer's own mutex.
pub(crate) struct IndexWriteLock {
    file: std::fs::File,
    wait_ms: u64,
}

impl IndexWriteLock {
    pub(crate) const fn wait_ms(&self) -> u64 {
        self.wait_ms
    }
}

impl Drop for IndexWriteLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn lock_path_for_root(root: &Path) -> PathBuf {
    state_dir_for_project_root(root).join(LOCK_FILE_NAME)
}

pub(crate) async fn acquire_index_write_lock(root: &Path) -> Result<IndexWriteLock> {
    let path = lock_path_for_root(root);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    tokio::task::spawn_blocking(move || -> Result<IndexWriteLock> {
        use std::fs::OpenOptions;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| {
                IndexerError::Other(format!("open index lock {}: {err}", path.display()))
            })?;

        let start = Instant::now();
        file.lock_exclusive().map_err(|err| {
            IndexerError::Other(format!("acquire index lock {}: {err}", path.display()))
        })?;
        let wait_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        record_wait(wait_ms);

        Ok(IndexWriteLock { file, wait_ms })
    })
    .await
    .map_err(|err| IndexerError::Other(format!("join index lock task: {err}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lock_is_reacquirable_after_drop() {
        let dir = TempDir::new().unwrap();
        let first = acquire_index_write_lock(dir.path()).await.unwrap();
        assert!(lock_path_for_root(dir.path()).exists());
        drop(first);

        let second = acquire_index_write_lock(dir.path()).await.unwrap();
        assert!(second.wait_ms() <= index_write_lock_wait_ms_max());
    }
}
