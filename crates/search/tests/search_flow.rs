use async_trait::async_trait;
use codesearch_indexer::{
    state_path_for_project_root, IndexerConfig, ProjectIndex, ProjectIndexer,
};
use codesearch_search::{
    parse_filter, ContextEvent, QueryError, Reranker, SearchConfig, SearchError, Searcher,
    SearchHit,
};
use codesearch_vector_store::{Embedder, HashEmbedder, Similarity};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const PAGINATION: &str = "def paginate_queryset(queryset, page_size):\n    return queryset[:page_size]\n";
const VIEWS: &str = "def render_page(request):\n    return render(request, 'page.html')\n";

fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(&path, content).expect("write");
}

/// Places the view slightly closer to every query than the pagination helper,
/// so retrieval alone ranks the relevant chunk second.
struct ScriptedEmbedder;

#[async_trait]
impl Embedder for ScriptedEmbedder {
    fn model_id(&self) -> &str {
        "scripted-v1"
    }

    fn dimension(&self) -> usize {
        2
    }

    async fn embed(&self, text: &str) -> codesearch_vector_store::Result<Vec<f32>> {
        Ok(if text.contains("def paginate_queryset") {
            vec![0.8, 0.6]
        } else if text.contains("def render_page") {
            vec![0.95, 0.312]
        } else {
            vec![1.0, 0.0]
        })
    }
}

struct FailingReranker;

#[async_trait]
impl Reranker for FailingReranker {
    fn name(&self) -> &str {
        "failing"
    }

    async fn score(&self, _query: &str, _text: &str) -> codesearch_search::Result<f32> {
        Err(SearchError::Rerank {
            reranker: "failing".to_string(),
            message: "model unavailable".to_string(),
        })
    }
}

struct SlowReranker;

#[async_trait]
impl Reranker for SlowReranker {
    fn name(&self) -> &str {
        "slow"
    }

    async fn score(&self, _query: &str, _text: &str) -> codesearch_search::Result<f32> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(1.0)
    }
}

async fn indexed(root: &Path, embedder: Arc<dyn Embedder>) -> ProjectIndexer {
    init_logging();
    let index = ProjectIndex::open(root, Similarity::Cosine)
        .await
        .expect("open index");
    let indexer = ProjectIndexer::new(index, embedder, IndexerConfig::default())
        .await
        .expect("indexer");
    indexer.index_full().await.expect("full index");
    indexer
}

async fn pagination_project() -> (TempDir, ProjectIndexer) {
    let dir = TempDir::new().expect("tempdir");
    write(dir.path(), "app/pagination.py", PAGINATION);
    write(dir.path(), "app/views.py", VIEWS);
    let indexer = indexed(dir.path(), Arc::new(ScriptedEmbedder)).await;
    (dir, indexer)
}

fn first_line(hit: &SearchHit) -> &str {
    hit.text.lines().next().unwrap_or_default()
}

#[tokio::test]
async fn rerank_promotes_lexical_match() {
    let (_dir, indexer) = pagination_project().await;
    let searcher = Searcher::for_indexer(&indexer, SearchConfig::default());

    let hits = searcher
        .search("Paginate   QuerySet", 10, None)
        .await
        .expect("search");

    assert_eq!(hits.len(), 2);
    assert_eq!(first_line(&hits[0]), "def paginate_queryset(queryset, page_size):");
    assert_eq!(hits[0].retrieval_rank, 1);
    assert_eq!(hits[1].retrieval_rank, 0);
    assert!(hits[0].rerank_score > hits[1].rerank_score);
}

#[tokio::test]
async fn reranker_failure_keeps_retrieval_order() {
    let (_dir, indexer) = pagination_project().await;
    let searcher = Searcher::for_indexer(&indexer, SearchConfig::default())
        .with_reranker(Arc::new(FailingReranker));

    let hits = searcher
        .search("paginate queryset", 10, None)
        .await
        .expect("search degrades instead of failing");

    let ranks: Vec<usize> = hits.iter().map(|h| h.retrieval_rank).collect();
    assert_eq!(ranks, vec![0, 1]);
    assert!(hits.iter().all(|h| h.rerank_score.is_none()));
}

#[tokio::test]
async fn reranker_timeout_keeps_retrieval_order() {
    let (_dir, indexer) = pagination_project().await;
    let config = SearchConfig {
        rerank_timeout_ms: 20,
        ..SearchConfig::default()
    };
    let searcher = Searcher::for_indexer(&indexer, config).with_reranker(Arc::new(SlowReranker));

    let hits = searcher
        .search("paginate queryset", 10, None)
        .await
        .expect("search");

    assert_eq!(first_line(&hits[0]), "def render_page(request):");
    assert!(hits[0].rerank_score.is_none());
}

#[tokio::test]
async fn results_are_truncated_to_k_and_filtered() {
    let (_dir, indexer) = pagination_project().await;
    let searcher = Searcher::for_indexer(&indexer, SearchConfig::default());

    let top = searcher
        .search("paginate queryset", 1, None)
        .await
        .expect("search");
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].path, "app/pagination.py");

    let filter = parse_filter(r#"{"path": "app/views.py"}"#)
        .expect("filter")
        .expect("non-empty filter");
    let filtered = searcher
        .search("paginate queryset", 10, Some(&filter))
        .await
        .expect("search");
    let paths: Vec<&str> = filtered.iter().map(|h| h.path.as_str()).collect();
    assert_eq!(paths, vec!["app/views.py"]);
}

#[tokio::test]
async fn lone_hit_is_still_reranked() {
    let (_dir, indexer) = pagination_project().await;
    let searcher = Searcher::for_indexer(&indexer, SearchConfig::default());
    let filter = parse_filter(r#"{"path": "app/pagination.py"}"#)
        .expect("filter")
        .expect("non-empty filter");

    let hits = searcher
        .search("paginate queryset", 10, Some(&filter))
        .await
        .expect("search");

    assert_eq!(hits.len(), 1);
    assert!(hits[0].rerank_score.is_some_and(|score| score > 0.0));
}

#[tokio::test]
async fn oversized_top_chunk_is_truncated_to_budget() {
    let dir = TempDir::new().expect("tempdir");
    let mut source = String::from("def build_report(rows):\n    total = 0\n");
    for i in 0..30 {
        source.push_str(&format!("    total += rows[{i}] * {i}\n"));
    }
    source.push_str("    return total\n");
    write(dir.path(), "report.py", &source);

    let indexer = indexed(dir.path(), Arc::new(HashEmbedder::default())).await;
    let searcher = Searcher::for_indexer(&indexer, SearchConfig::default());

    let context = searcher
        .context("build report", 100)
        .await
        .expect("context");

    assert_eq!(context.results.len(), 1);
    assert_eq!(context.included, 1);
    assert!(context.truncated);
    assert!(context.token_count <= 100);
    assert_eq!(context.budget, 100);
    assert!(context
        .aggregated_text
        .starts_with("File: report.py, Type: function, Name: build_report, Lines: 1-"));
}

#[tokio::test]
async fn context_stream_matches_context() {
    let (_dir, indexer) = pagination_project().await;
    let searcher = Arc::new(Searcher::for_indexer(&indexer, SearchConfig::default()));

    let expected = searcher
        .context("paginate queryset", 8000)
        .await
        .expect("context");

    let mut rx = searcher.context_stream("paginate queryset", 8000);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let (last, chunks) = events.split_last().expect("at least a summary");
    assert_eq!(last, &ContextEvent::Summary(expected.summary()));
    let streamed: Vec<_> = chunks
        .iter()
        .map(|event| match event {
            ContextEvent::Chunk(block) => block.clone(),
            other => panic!("unexpected event before summary: {other:?}"),
        })
        .collect();
    assert_eq!(streamed, expected.blocks);
    assert_eq!(streamed.len(), 2);
}

#[tokio::test]
async fn context_stream_reports_failures() {
    init_logging();
    let dir = TempDir::new().expect("tempdir");
    let index = ProjectIndex::open(dir.path(), Similarity::Cosine)
        .await
        .expect("open index");
    let searcher = Arc::new(Searcher::new(
        index,
        Arc::new(HashEmbedder::default()),
        SearchConfig::default(),
    ));

    let mut rx = searcher.context_stream("anything", 100);
    let event = rx.recv().await.expect("one event");
    assert!(matches!(event, ContextEvent::Failed { .. }), "{event:?}");
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn batch_shares_one_snapshot() {
    let (_dir, indexer) = pagination_project().await;
    let searcher = Searcher::for_indexer(&indexer, SearchConfig::default());

    let results = searcher
        .search_batch(&["paginate queryset", "   ", "render page"], 1, None)
        .await
        .expect("batch");

    assert_eq!(results.len(), 3);
    assert_eq!(
        results[0].as_ref().expect("first query")[0].path,
        "app/pagination.py"
    );
    assert!(matches!(
        results[1].as_ref().map_err(SearchError::as_query),
        Err(Some(QueryError::EmptyQuery))
    ));
    assert_eq!(
        results[2].as_ref().expect("third query")[0].path,
        "app/views.py"
    );
}

fn query_error(result: codesearch_search::Result<Vec<SearchHit>>) -> QueryError {
    match result {
        Err(SearchError::Query(err)) => err,
        other => panic!("expected a query error, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_index_and_empty_query_are_rejected() {
    init_logging();
    let dir = TempDir::new().expect("tempdir");
    let index = ProjectIndex::open(dir.path(), Similarity::Cosine)
        .await
        .expect("open index");
    let searcher = Searcher::new(index, Arc::new(HashEmbedder::default()), SearchConfig::default());

    assert_eq!(
        query_error(searcher.search(" \t ", 10, None).await),
        QueryError::EmptyQuery
    );
    assert_eq!(
        query_error(searcher.search("paginate", 10, None).await),
        QueryError::IndexEmpty
    );
}

#[tokio::test]
async fn model_mismatch_is_rejected() {
    let (_dir, indexer) = pagination_project().await;
    let hash = HashEmbedder::default();
    let hash_model = hash.model_id().to_string();
    let searcher = Searcher::new(
        Arc::clone(indexer.index()),
        Arc::new(hash),
        SearchConfig::default(),
    );

    assert_eq!(
        query_error(searcher.search("paginate queryset", 10, None).await),
        QueryError::ModelMismatch {
            index: "scripted-v1".to_string(),
            query: hash_model,
        }
    );
}

#[tokio::test]
async fn stale_index_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    write(dir.path(), "app/views.py", VIEWS);
    drop(indexed(dir.path(), Arc::new(HashEmbedder::default())).await);
    std::fs::write(state_path_for_project_root(dir.path()), b"{ truncated").expect("corrupt");

    let index = ProjectIndex::open(dir.path(), Similarity::Cosine)
        .await
        .expect("reopen");
    let searcher = Searcher::new(index, Arc::new(HashEmbedder::default()), SearchConfig::default());

    assert!(matches!(
        query_error(searcher.search("render page", 10, None).await),
        QueryError::IndexStale(_)
    ));
}

#[tokio::test]
async fn invalid_filter_is_a_query_error() {
    let (_dir, indexer) = pagination_project().await;
    let searcher = Searcher::for_indexer(&indexer, SearchConfig::default());
    let filter = codesearch_vector_store::MetadataFilter {
        path_glob: Some("app/[".to_string()),
        ..Default::default()
    };

    assert!(matches!(
        query_error(searcher.search("paginate", 10, Some(&filter)).await),
        QueryError::InvalidFilter(_)
    ));
}
