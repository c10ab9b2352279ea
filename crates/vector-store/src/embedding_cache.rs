use crate::error::{Result, VectorStoreError};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

const CACHE_MAGIC: &[u8; 4] = b"EC02";
const MANIFEST_FILE_NAME: &str = "cache.json";

pub const CACHE_FORMAT_VERSION: u32 = 2;
pub const DEFAULT_LRU_CAPACITY: usize = 4096;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Cache key derived from chunk text and the embedding model that produced the vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    model_id: String,
    digest: String,
}

impl Fingerprint {
    #[must_use]
    pub fn compute(text: &str, model_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((model_id.len() as u64).to_le_bytes());
        hasher.update(model_id.as_bytes());
        hasher.update(text.as_bytes());
        Self {
            model_id: model_id.to_string(),
            digest: format!("{:x}", hasher.finalize()),
        }
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheManifest {
    format_version: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Durable fingerprint → vector map with an in-memory LRU in front.
///
/// Layout: `<base>/<model>/<aa>/<bb>/<digest>.bin`, one file per vector.
pub struct EmbeddingCache {
    base_dir: PathBuf,
    memory: Mutex<LruCache<Fingerprint, Arc<[f32]>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    recovered: bool,
}

impl EmbeddingCache {
    /// Open (or create) the cache. An unreadable or incompatible cache is wiped
    /// and reopened empty.
    pub async fn open(base_dir: impl AsRef<Path>, lru_capacity: usize) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_dir).await?;

        let manifest_path = base_dir.join(MANIFEST_FILE_NAME);
        let compatible = match tokio::fs::read(&manifest_path).await {
            Ok(bytes) => match serde_json::from_slice::<CacheManifest>(&bytes) {
                Ok(manifest) if manifest.format_version == CACHE_FORMAT_VERSION => Some(true),
                Ok(manifest) => {
                    log::warn!(
                        "Embedding cache format {} is incompatible (expected {CACHE_FORMAT_VERSION}); discarding {}",
                        manifest.format_version,
                        base_dir.display()
                    );
                    Some(false)
                }
                Err(err) => {
                    log::warn!(
                        "Embedding cache manifest is corrupt ({err}); discarding {}",
                        base_dir.display()
                    );
                    Some(false)
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        let recovered = match compatible {
            Some(true) => false,
            Some(false) => {
                wipe_dir(&base_dir).await?;
                true
            }
            None => {
                let has_entries = dir_has_entries(&base_dir).await?;
                if has_entries {
                    log::warn!(
                        "Embedding cache at {} has no manifest; discarding",
                        base_dir.display()
                    );
                    wipe_dir(&base_dir).await?;
                }
                has_entries
            }
        };
        if compatible != Some(true) {
            write_manifest(&manifest_path).await?;
        }

        let capacity = NonZeroUsize::new(lru_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            base_dir,
            memory: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            recovered,
        })
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// True when `open` discarded a corrupt or incompatible cache.
    #[must_use]
    pub const fn recovered_from_corruption(&self) -> bool {
        self.recovered
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn vector_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let (shard_a, shard_b) = shard_dirs(fingerprint.digest());
        self.base_dir
            .join(safe_component(fingerprint.model_id()))
            .join(shard_a)
            .join(shard_b)
            .join(format!("{}.bin", fingerprint.digest()))
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<Vec<f32>> {
        let found = self.lookup(fingerprint).await;
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found.map(|v| v.to_vec())
    }

    /// Store a vector. Re-putting an equal vector is a no-op; a different
    /// vector for the same fingerprint is a [`VectorStoreError::CacheConflict`].
    pub async fn put(&self, fingerprint: &Fingerprint, vector: &[f32]) -> Result<()> {
        if let Some(existing) = self.lookup(fingerprint).await {
            if same_bits(&existing, vector) {
                return Ok(());
            }
            return Err(VectorStoreError::CacheConflict {
                fingerprint: fingerprint.to_string(),
            });
        }

        let path = self.vector_path(fingerprint);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!(
            "bin.tmp.{}.{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&tmp, encode_vector(vector)).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }

        self.lock_memory()
            .put(fingerprint.clone(), Arc::from(vector));
        Ok(())
    }

    /// Returns whether an entry existed.
    pub async fn evict(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let in_memory = self.lock_memory().pop(fingerprint).is_some();
        match tokio::fs::remove_file(self.vector_path(fingerprint)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(in_memory),
            Err(err) => Err(err.into()),
        }
    }

    /// Drop every vector produced by `model_id`.
    pub async fn evict_model(&self, model_id: &str) -> Result<()> {
        {
            let mut memory = self.lock_memory();
            let stale: Vec<Fingerprint> = memory
                .iter()
                .filter(|(fp, _)| fp.model_id() == model_id)
                .map(|(fp, _)| fp.clone())
                .collect();
            for fp in stale {
                memory.pop(&fp);
            }
        }
        let dir = self.base_dir.join(safe_component(model_id));
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                log::info!("Evicted embedding cache for model {model_id}");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<Arc<[f32]>> {
        let cached = self.lock_memory().get(fingerprint).cloned();
        if cached.is_some() {
            return cached;
        }

        let path = self.vector_path(fingerprint);
        let bytes = tokio::fs::read(&path).await.ok()?;
        let Some(vector) = decode_vector(&bytes) else {
            log::warn!("Discarding undecodable cache entry {}", path.display());
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        };
        let vector: Arc<[f32]> = Arc::from(vector);
        self.lock_memory()
            .put(fingerprint.clone(), Arc::clone(&vector));
        Some(vector)
    }

    fn lock_memory(&self) -> std::sync::MutexGuard<'_, LruCache<Fingerprint, Arc<[f32]>>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn write_manifest(path: &Path) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(&CacheManifest {
        format_version: CACHE_FORMAT_VERSION,
    })?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn wipe_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

async fn dir_has_entries(dir: &Path) -> Result<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_some())
}

fn same_bits(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
}

fn safe_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() || out.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        out
    }
}

fn shard_dirs(hex: &str) -> (String, String) {
    let a = hex.get(0..2).unwrap_or("00").to_string();
    let b = hex.get(2..4).unwrap_or("00").to_string();
    (a, b)
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + vector.len() * 4);
    out.extend_from_slice(CACHE_MAGIC);
    #[allow(clippy::cast_possible_truncation)]
    let dim = vector.len() as u32;
    out.extend_from_slice(&dim.to_le_bytes());
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() < 8 || &bytes[0..4] != CACHE_MAGIC {
        return None;
    }
    let dim = u32::from_le_bytes(bytes[4..8].try_into().ok()?) as usize;
    let expected_len = 8usize.saturating_add(dim.saturating_mul(4));
    if bytes.len() != expected_len {
        return None;
    }
    bytes[8..]
        .chunks_exact(4)
        .map(|raw| raw.try_into().ok().map(f32::from_le_bytes))
        .collect()
}
