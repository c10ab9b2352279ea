use codesearch_indexer::{
    IndexCoordinator, IndexUpdate, IndexerConfig, ProjectIndex, ProjectIndexer, WatchConfig,
    WatchIndexer,
};
use codesearch_vector_store::{HashEmbedder, Similarity};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;

async fn indexed_project(root: &Path) -> Arc<IndexCoordinator> {
    let index = ProjectIndex::open(root, Similarity::Cosine)
        .await
        .expect("open index");
    let indexer = ProjectIndexer::new(
        index,
        Arc::new(HashEmbedder::default()),
        IndexerConfig::default(),
    )
    .await
    .expect("indexer");
    indexer.index_full().await.expect("initial index");
    Arc::new(IndexCoordinator::new(Arc::new(indexer)))
}

fn fast_watch() -> WatchConfig {
    WatchConfig {
        debounce: Duration::from_millis(200),
        max_batch_wait: Duration::from_secs(1),
        poll_interval: Duration::from_millis(100),
    }
}

fn start_watcher(coordinator: Arc<IndexCoordinator>, config: WatchConfig) -> Option<WatchIndexer> {
    let watcher = match WatchIndexer::start(coordinator, config) {
        Ok(w) => w,
        Err(e) if e.to_string().contains("Too many open files") => {
            warn_skip_watcher(&e.to_string());
            return None;
        }
        Err(e) => panic!("start watcher: {e}"),
    };
    if watcher.watch_count() == 0 {
        warn_skip_watcher("watch backend reported 0 active watches");
        return None;
    }
    Some(watcher)
}

fn skip_watch_flow() -> bool {
    if std::env::var("SKIP_WATCH_FLOW").is_ok() {
        eprintln!("skipping watch_flow due to SKIP_WATCH_FLOW");
        return true;
    }
    if low_fd_limit() {
        warn_skip_fd();
        return true;
    }
    ensure_ulimit();
    false
}

#[cfg_attr(
    not(target_os = "linux"),
    ignore = "watcher latency test is only reliable on Linux"
)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watcher_reindexes_edit_under_two_seconds() {
    if skip_watch_flow() {
        return;
    }

    let temp = TempDir::new().expect("tempdir");
    let src_dir = temp.path().join("src");
    tokio::fs::create_dir_all(&src_dir)
        .await
        .expect("create src");
    let file_path = src_dir.join("views.py");
    tokio::fs::write(&file_path, "def noop():\n    pass\n")
        .await
        .expect("write initial file");

    let coordinator = indexed_project(temp.path()).await;
    let Some(watcher) = start_watcher(coordinator.clone(), fast_watch()) else {
        return;
    };
    let mut updates = watcher.subscribe_updates();

    tokio::time::sleep(Duration::from_millis(250)).await;
    while matches!(updates.try_recv(), Ok(_) | Err(TryRecvError::Lagged(_))) {}

    let start = Instant::now();
    tokio::fs::write(
        &file_path,
        format!("def updated_{}():\n    return 1\n", start.elapsed().as_nanos()),
    )
    .await
    .expect("update file");

    let update = wait_for_success(&mut updates, Duration::from_secs(4))
        .await
        .unwrap_or_else(|| {
            panic!(
                "timeout waiting for update (health={:?})",
                watcher.health_snapshot()
            )
        });

    let elapsed = start.elapsed();
    assert!(
        elapsed < Duration::from_secs(2),
        "watch index latency too high: {elapsed:?} (update: {update:?})"
    );
    let stats = update.stats.expect("stats for completed run");
    assert!(stats.changed(), "edit should reach the store: {stats:?}");
}

#[cfg_attr(
    not(target_os = "linux"),
    ignore = "watcher latency test is only reliable on Linux"
)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ignored_paths_do_not_trigger_runs() {
    if skip_watch_flow() {
        return;
    }

    let temp = TempDir::new().expect("tempdir");
    tokio::fs::write(temp.path().join("app.py"), "def main():\n    pass\n")
        .await
        .expect("write file");
    tokio::fs::create_dir_all(temp.path().join("__pycache__"))
        .await
        .expect("create cache dir");

    let coordinator = indexed_project(temp.path()).await;
    let Some(watcher) = start_watcher(coordinator.clone(), fast_watch()) else {
        return;
    };
    let mut updates = watcher.subscribe_updates();
    tokio::time::sleep(Duration::from_millis(250)).await;
    while matches!(updates.try_recv(), Ok(_) | Err(TryRecvError::Lagged(_))) {}

    let runs_before = coordinator.runs_started();
    tokio::fs::write(temp.path().join("__pycache__/app.cpython-311.pyc"), b"\0\0")
        .await
        .expect("write bytecode");
    tokio::fs::write(temp.path().join("notes.pyc"), b"\0")
        .await
        .expect("write bytecode");

    let update = wait_for_success(&mut updates, Duration::from_millis(1500)).await;
    assert!(update.is_none(), "unexpected run: {update:?}");
    assert_eq!(coordinator.runs_started(), runs_before);
}

#[cfg_attr(
    not(target_os = "linux"),
    ignore = "watcher latency test is only reliable on Linux"
)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watcher_health_records_last_success() {
    if skip_watch_flow() {
        return;
    }

    let temp = TempDir::new().expect("tempdir");
    let src_dir = temp.path().join("src");
    tokio::fs::create_dir_all(&src_dir)
        .await
        .expect("create src");
    let file_path = src_dir.join("lib.rs");
    tokio::fs::write(&file_path, "fn noop() {}\n")
        .await
        .expect("write initial file");

    let coordinator = indexed_project(temp.path()).await;
    let Some(watcher) = start_watcher(coordinator, fast_watch()) else {
        return;
    };
    let mut updates = watcher.subscribe_updates();

    watcher.trigger("manual").await.expect("trigger");
    let update = wait_for_success(&mut updates, Duration::from_secs(4))
        .await
        .unwrap_or_else(|| panic!("health update (health={:?})", watcher.health_snapshot()));
    assert_eq!(update.reason, "manual");

    let snapshot = watcher.health_snapshot();
    let last_success = snapshot
        .last_success
        .expect("last_success should be recorded");
    let unix_ms = last_success
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("unix epoch conversion")
        .as_millis();
    assert!(unix_ms > 0, "unix timestamp must be positive");
    assert!(snapshot.last_error.is_none());
    assert_eq!(snapshot.consecutive_failures, 0);
    assert!(!snapshot.indexing);
}

async fn wait_for_success(
    updates: &mut Receiver<IndexUpdate>,
    timeout: Duration,
) -> Option<IndexUpdate> {
    tokio::time::timeout(timeout, async {
        loop {
            match updates.recv().await {
                Ok(update) if update.success => break Some(update),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

fn low_fd_limit() -> bool {
    rlimit::Resource::NOFILE
        .get()
        .map(|(soft, _)| soft < 1024)
        .unwrap_or(false)
}

fn ensure_ulimit() {
    if let Ok((_soft, hard)) = rlimit::Resource::NOFILE.get() {
        let target = 2048.min(hard);
        let _ = rlimit::Resource::NOFILE.set(target, hard);
    }
}

fn warn_skip_fd() {
    eprintln!("skipping watcher tests: NOFILE soft limit < 1024");
}

fn warn_skip_watcher(reason: &str) {
    eprintln!("skipping watcher tests: {reason}");
}
