use crate::limits::{ConcurrencySnapshot, EmbedLimiter};
use crate::{IndexerError, Result};
use codesearch_vector_store::{Embedder, EmbeddingCache, Fingerprint};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), doubling each time.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor)
    }
}

/// Where a vector came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedSource {
    Cache,
    Embedded,
    /// Awaited a concurrent request for the same fingerprint.
    Shared,
}

#[derive(Debug, Clone)]
pub struct EmbeddedVector {
    pub vector: Vec<f32>,
    pub source: EmbedSource,
}

/// Outcome of one leader's computation, handed to every waiter on the cell.
type Shared = std::result::Result<Vec<f32>, Arc<IndexerError>>;
type InFlight = Arc<OnceCell<Shared>>;

/// Cache-first embedding with bounded concurrency and single-flight.
///
/// Concurrent requests for one fingerprint share a single embedder call, and
/// share its failure too: waiters never re-run the retry loop. Transient failures are retried with exponential backoff; a vector of the
/// wrong dimension is rejected without retry.
pub struct EmbeddingPool {
    embedder: Arc<dyn Embedder>,
    cache: Arc<EmbeddingCache>,
    limiter: EmbedLimiter,
    retry: RetryPolicy,
    in_flight: Mutex<HashMap<Fingerprint, InFlight>>,
}

impl EmbeddingPool {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        cache: Arc<EmbeddingCache>,
        concurrency: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            embedder,
            cache,
            limiter: EmbedLimiter::new(concurrency),
            retry,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn model_id(&self) -> &str {
        self.embedder.model_id()
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    pub fn concurrency(&self) -> ConcurrencySnapshot {
        self.limiter.snapshot()
    }

    pub async fn embed(&self, text: &str) -> Result<EmbeddedVector> {
        let fingerprint = Fingerprint::compute(text, self.embedder.model_id());
        if let Some(vector) = self.cache.get(&fingerprint).await {
            return Ok(EmbeddedVector {
                vector,
                source: EmbedSource::Cache,
            });
        }

        let cell = {
            let mut in_flight = self.lock_in_flight();
            Arc::clone(in_flight.entry(fingerprint.clone()).or_default())
        };

        let leader = AtomicBool::new(false);
        let result = cell
            .get_or_init(|| async {
                self.compute(&fingerprint, text, &leader)
                    .await
                    .map_err(Arc::new)
            })
            .await
            .clone();

        {
            let mut in_flight = self.lock_in_flight();
            if in_flight
                .get(&fingerprint)
                .is_some_and(|current| Arc::ptr_eq(current, &cell))
            {
                in_flight.remove(&fingerprint);
            }
        }

        let vector = result.map_err(|err| shared_failure(&err))?;
        let source = if leader.load(Ordering::Relaxed) {
            EmbedSource::Embedded
        } else {
            EmbedSource::Shared
        };
        Ok(EmbeddedVector { vector, source })
    }

    async fn compute(
        &self,
        fingerprint: &Fingerprint,
        text: &str,
        leader: &AtomicBool,
    ) -> Result<Vec<f32>> {
        // A racing leader may have finished between our cache probe and now.
        if let Some(vector) = self.cache.get(fingerprint).await {
            return Ok(vector);
        }
        leader.store(true, Ordering::Relaxed);

        let _permit = self.limiter.acquire().await;
        let model = self.embedder.model_id().to_string();
        let dimension = self.embedder.dimension();
        let mut attempt = 0;
        let vector = loop {
            attempt += 1;
            match self.embedder.embed(text).await {
                Ok(vector) if vector.len() == dimension => break vector,
                Ok(vector) => {
                    return Err(IndexerError::Embedding {
                        model,
                        attempts: attempt,
                        message: format!(
                            "embedder returned {} dimensions, expected {dimension}",
                            vector.len()
                        ),
                    });
                }
                Err(err) if attempt < self.retry.attempts => {
                    let delay = self.retry.delay_for(attempt);
                    log::warn!(
                        "Embedding attempt {attempt}/{} failed ({err}); retrying in {}ms",
                        self.retry.attempts,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(IndexerError::Embedding {
                        model,
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
            }
        };

        self.cache.put(fingerprint, &vector).await?;
        Ok(vector)
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, InFlight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rebuild an owned error from the leader's outcome for one waiter.
fn shared_failure(err: &IndexerError) -> IndexerError {
    match err {
        IndexerError::Embedding {
            model,
            attempts,
            message,
        } => IndexerError::Embedding {
            model: model.clone(),
            attempts: *attempts,
            message: message.clone(),
        },
        IndexerError::Cancelled => IndexerError::Cancelled,
        other => IndexerError::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use codesearch_vector_store::{HashEmbedder, VectorStoreError};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Counts calls; blocks each call briefly so concurrent requests overlap.
    struct SlowCounting {
        inner: HashEmbedder,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for SlowCounting {
        fn model_id(&self) -> &str {
            self.inner.model_id()
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn embed(&self, text: &str) -> codesearch_vector_store::Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.embed(text).await
        }
    }

    /// Fails the first `failures` calls.
    struct Flaky {
        inner: HashEmbedder,
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for Flaky {
        fn model_id(&self) -> &str {
            self.inner.model_id()
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn embed(&self, text: &str) -> codesearch_vector_store::Result<Vec<f32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(VectorStoreError::embedding(self.model_id(), "service unavailable"));
            }
            self.inner.embed(text).await
        }
    }

    /// Always fails, slowly enough that concurrent requests pile up.
    struct SlowFailing {
        inner: HashEmbedder,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for SlowFailing {
        fn model_id(&self) -> &str {
            self.inner.model_id()
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn embed(&self, _text: &str) -> codesearch_vector_store::Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            Err(VectorStoreError::embedding(self.model_id(), "service unavailable"))
        }
    }

    async fn cache(dir: &TempDir) -> Arc<EmbeddingCache> {
        Arc::new(EmbeddingCache::open(dir.path(), 16).await.unwrap())
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(200));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_requests_share_one_call() {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(SlowCounting {
            inner: HashEmbedder::default(),
            calls: AtomicUsize::new(0),
        });
        let pool = Arc::new(EmbeddingPool::new(
            embedder.clone(),
            cache(&dir).await,
            4,
            quick_retry(),
        ));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            tasks.spawn(async move { pool.embed("def paginate(queryset): ...").await });
        }
        let mut sources = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            sources.push(joined.unwrap().unwrap().source);
        }

        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            sources
                .iter()
                .filter(|s| **s == EmbedSource::Embedded)
                .count(),
            1
        );

        let again = pool.embed("def paginate(queryset): ...").await.unwrap();
        assert_eq!(again.source, EmbedSource::Cache);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(Flaky {
            inner: HashEmbedder::default(),
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let pool = EmbeddingPool::new(embedder.clone(), cache(&dir).await, 2, quick_retry());

        let embedded = pool.embed("class Paginator: pass").await.unwrap();
        assert_eq!(embedded.source, EmbedSource::Embedded);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_are_chunk_local_errors() {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(Flaky {
            inner: HashEmbedder::default(),
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let pool = EmbeddingPool::new(embedder.clone(), cache(&dir).await, 2, quick_retry());

        let err = pool.embed("x = 1").await.unwrap_err();
        assert!(err.is_chunk_local());
        assert!(matches!(err, IndexerError::Embedding { attempts: 3, .. }));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);

        // A failed attempt leaves nothing behind in the cache.
        let fingerprint = Fingerprint::compute("x = 1", embedder.model_id());
        assert!(pool.cache().get(&fingerprint).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_waiters_share_one_failure() {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(SlowFailing {
            inner: HashEmbedder::default(),
            calls: AtomicUsize::new(0),
        });
        let pool = Arc::new(EmbeddingPool::new(
            embedder.clone(),
            cache(&dir).await,
            4,
            quick_retry(),
        ));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            tasks.spawn(async move { pool.embed("def broken(): ...").await });
        }
        let mut failures = 0;
        while let Some(joined) = tasks.join_next().await {
            let err = joined.unwrap().unwrap_err();
            assert!(matches!(err, IndexerError::Embedding { attempts: 3, .. }), "{err}");
            failures += 1;
        }

        assert_eq!(failures, 8);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);

        // The failed cell is gone; the next request retries from scratch.
        assert!(pool.embed("def broken(): ...").await.is_err());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 6);
    }
}
