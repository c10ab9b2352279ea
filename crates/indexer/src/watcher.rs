use crate::coordinator::{IndexCoordinator, RunOutcome};
use crate::ignore_filter::IgnoreFilter;
use crate::project::IndexMode;
use crate::{IndexStats, IndexerError, Result};
use ignore::WalkBuilder;
use log::{error, info, warn};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time;

const DEFAULT_REASON: &str = "fs_event";

#[derive(Debug, Clone)]
pub struct IndexUpdate {
    pub completed_at: SystemTime,
    pub duration_ms: u64,
    pub stats: Option<IndexStats>,
    pub success: bool,
    /// The request was folded into a run already in progress.
    pub coalesced: bool,
    pub reason: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchHealth {
    pub last_success: Option<SystemTime>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub last_duration_ms: Option<u64>,
    pub pending_events: usize,
    pub indexing: bool,
    pub watched_dirs: usize,
}

impl WatchHealth {
    const fn initial() -> Self {
        Self {
            last_success: None,
            last_error: None,
            consecutive_failures: 0,
            last_duration_ms: None,
            pending_events: 0,
            indexing: false,
            watched_dirs: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatchConfig {
    pub debounce: Duration,
    pub max_batch_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            max_batch_wait: Duration::from_secs(3),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Watches a project root and keeps its index current.
///
/// Relevant filesystem events are debounced into incremental runs through the
/// coordinator, so bursts of saves cost one run. Edits to the root ignore
/// files reload the filter before the next run.
#[derive(Clone)]
pub struct WatchIndexer {
    inner: Arc<WatchIndexerInner>,
}

struct WatchIndexerInner {
    command_tx: mpsc::Sender<WatcherCommand>,
    update_tx: broadcast::Sender<IndexUpdate>,
    health_tx: watch::Sender<WatchHealth>,
    watched: WatchSet,
    _watcher: Arc<Mutex<Option<RecommendedWatcher>>>,
}

enum WatcherCommand {
    Trigger { reason: String, mode: IndexMode },
    Shutdown,
}

/// Directories currently registered with the OS watcher.
type WatchSet = Arc<Mutex<HashSet<PathBuf>>>;

impl WatchIndexer {
    pub fn start(coordinator: Arc<IndexCoordinator>, config: WatchConfig) -> Result<Self> {
        let root = coordinator.indexer().index().root().to_path_buf();
        let filter = IgnoreFilter::for_root(&root);

        let (event_tx, event_rx) = mpsc::channel(1024);
        let (command_tx, command_rx) = mpsc::channel(16);
        let (health_tx, _) = watch::channel(WatchHealth::initial());
        let (update_tx, _) = broadcast::channel(32);

        let watched: WatchSet = Arc::new(Mutex::new(HashSet::new()));
        let watcher = create_fs_watcher(&root, &filter, event_tx, config.poll_interval, &watched)?;
        let watcher = Arc::new(Mutex::new(Some(watcher)));

        let watch_loop = WatchLoop {
            coordinator,
            root,
            filter,
            config,
            update_tx: update_tx.clone(),
            health_tx: health_tx.clone(),
            watcher: Arc::clone(&watcher),
            watched: Arc::clone(&watched),
        };
        tokio::spawn(watch_loop.run(event_rx, command_rx));

        Ok(Self {
            inner: Arc::new(WatchIndexerInner {
                command_tx,
                update_tx,
                health_tx,
                watched,
                _watcher: watcher,
            }),
        })
    }

    /// Request an immediate incremental run.
    pub async fn trigger(&self, reason: impl Into<String>) -> Result<()> {
        self.send(WatcherCommand::Trigger {
            reason: reason.into(),
            mode: IndexMode::Incremental,
        })
        .await
    }

    /// Request an immediate full rebuild.
    pub async fn trigger_full(&self, reason: impl Into<String>) -> Result<()> {
        self.send(WatcherCommand::Trigger {
            reason: reason.into(),
            mode: IndexMode::Full,
        })
        .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(WatcherCommand::Shutdown).await
    }

    #[must_use]
    pub fn subscribe_updates(&self) -> broadcast::Receiver<IndexUpdate> {
        self.inner.update_tx.subscribe()
    }

    /// Directories registered with the OS watcher.
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.inner
            .watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn health_snapshot(&self) -> WatchHealth {
        self.inner.health_tx.borrow().clone()
    }

    #[must_use]
    pub fn health_stream(&self) -> watch::Receiver<WatchHealth> {
        self.inner.health_tx.subscribe()
    }

    async fn send(&self, command: WatcherCommand) -> Result<()> {
        self.inner
            .command_tx
            .send(command)
            .await
            .map_err(|e| IndexerError::Other(format!("watcher stopped: {e}")))
    }
}

impl Drop for WatchIndexer {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            let _ = self.inner.command_tx.try_send(WatcherCommand::Shutdown);
        }
    }
}

fn create_fs_watcher(
    root: &Path,
    filter: &IgnoreFilter,
    sender: mpsc::Sender<notify::Result<Event>>,
    poll_interval: Duration,
    watched: &WatchSet,
) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = sender.blocking_send(res);
        },
        NotifyConfig::default().with_poll_interval(poll_interval),
    )
    .map_err(|e| IndexerError::Other(format!("watcher init failed: {e}")))?;

    let mut guard = watched.lock().unwrap_or_else(PoisonError::into_inner);
    for dir in watchable_dirs(root, filter) {
        if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            warn!("failed to watch {}: {err}", dir.display());
            continue;
        }
        guard.insert(dir);
    }
    Ok(watcher)
}

/// `start` and every directory under it the filter lets us descend into.
fn watchable_dirs(start: &Path, filter: &IgnoreFilter) -> Vec<PathBuf> {
    let mut builder = WalkBuilder::new(start);
    builder
        .hidden(false)
        .parents(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .follow_links(false);
    let walk_filter = filter.clone();
    builder.filter_entry(move |entry| {
        entry.file_type().is_some_and(|t| t.is_dir()) && walk_filter.should_descend(entry.path())
    });

    builder
        .build()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_dir()))
        .map(ignore::DirEntry::into_path)
        .collect()
}

#[derive(Debug)]
struct DebounceState {
    debounce: Duration,
    max_batch: Duration,
    dirty: bool,
    pending: usize,
    last_event: Option<Instant>,
    first_event: Option<Instant>,
    reason: Option<String>,
    mode: IndexMode,
    force_immediate: bool,
}

impl DebounceState {
    const fn new(debounce: Duration, max_batch: Duration) -> Self {
        Self {
            debounce,
            max_batch,
            dirty: false,
            pending: 0,
            last_event: None,
            first_event: None,
            reason: None,
            mode: IndexMode::Incremental,
            force_immediate: false,
        }
    }

    fn record_event(&mut self, count: usize, reason: &str) {
        self.pending += count.max(1);
        self.reason = Some(reason.to_string());
        let now = Instant::now();
        self.last_event = Some(now);
        self.first_event.get_or_insert(now);
        self.dirty = true;
    }

    fn force_run(&mut self, reason: String, mode: IndexMode) {
        self.pending += 1;
        self.reason = Some(reason);
        self.mode = self.mode.merge(mode);
        self.force_immediate = true;
        self.dirty = true;
    }

    const fn pending(&self) -> usize {
        self.pending
    }

    const fn should_run(&self) -> bool {
        self.dirty
    }

    /// Quiet period after the last event, capped at `max_batch` after the
    /// first one so a steady stream of events cannot starve the index.
    fn next_deadline(&self) -> Option<time::Instant> {
        if !self.dirty {
            return None;
        }
        if self.force_immediate {
            return Some(time::Instant::now());
        }

        let quiet = self.last_event.map(|last| last + self.debounce);
        let forced = self.first_event.map(|first| first + self.max_batch);
        let deadline = match (quiet, forced) {
            (Some(quiet), Some(forced)) => Some(quiet.min(forced)),
            (quiet, forced) => quiet.or(forced),
        };
        deadline.map(time::Instant::from_std)
    }

    fn take_reason(&mut self) -> Option<String> {
        self.reason.take()
    }

    const fn mode(&self) -> IndexMode {
        self.mode
    }

    fn reset(&mut self) {
        self.dirty = false;
        self.pending = 0;
        self.last_event = None;
        self.first_event = None;
        self.reason = None;
        self.mode = IndexMode::Incremental;
        self.force_immediate = false;
    }
}

struct WatchLoop {
    coordinator: Arc<IndexCoordinator>,
    root: PathBuf,
    filter: IgnoreFilter,
    config: WatchConfig,
    update_tx: broadcast::Sender<IndexUpdate>,
    health_tx: watch::Sender<WatchHealth>,
    watcher: Arc<Mutex<Option<RecommendedWatcher>>>,
    watched: WatchSet,
}

impl WatchLoop {
    async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<notify::Result<Event>>,
        mut command_rx: mpsc::Receiver<WatcherCommand>,
    ) {
        let mut state = DebounceState::new(self.config.debounce, self.config.max_batch_wait);
        let mut health = WatchHealth::initial();
        health.watched_dirs = self.watched_count();
        self.health_tx.send_replace(health.clone());

        loop {
            let next_deadline = state.next_deadline();

            tokio::select! {
                Some(event) = event_rx.recv() => {
                    if self.handle_event(event, &mut state) {
                        health.pending_events = state.pending();
                        health.watched_dirs = self.watched_count();
                        self.health_tx.send_replace(health.clone());
                    }
                }
                Some(cmd) = command_rx.recv() => {
                    match cmd {
                        WatcherCommand::Trigger { reason, mode } => {
                            state.force_run(reason, mode);
                            health.pending_events = state.pending();
                            self.health_tx.send_replace(health.clone());
                        }
                        WatcherCommand::Shutdown => break,
                    }
                }
                () = async {
                    if let Some(deadline) = next_deadline {
                        time::sleep_until(deadline).await;
                    }
                }, if state.should_run() && next_deadline.is_some() => {
                    health.indexing = true;
                    self.health_tx.send_replace(health.clone());

                    let reason = state.take_reason().unwrap_or_else(|| DEFAULT_REASON.to_string());
                    let update = self.run_cycle(state.mode(), reason).await;
                    health.indexing = false;
                    health.pending_events = 0;
                    health.last_duration_ms = Some(update.duration_ms);
                    if update.success {
                        health.last_success = Some(update.completed_at);
                        health.last_error = None;
                        health.consecutive_failures = 0;
                    } else {
                        health.last_error.clone_from(&update.error);
                        health.consecutive_failures += 1;
                    }
                    self.health_tx.send_replace(health.clone());
                    let _ = self.update_tx.send(update);

                    state.reset();
                }
                else => break,
            }
        }

        self.coordinator.cancel_current();
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(watcher);
        info!("Watcher for {} stopped", self.root.display());
    }

    /// Returns true when the event should schedule a run.
    fn handle_event(&mut self, event: notify::Result<Event>, state: &mut DebounceState) -> bool {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                warn!("Watcher error: {err}");
                // Events may have been lost; a run reconciles.
                state.record_event(1, "watcher_error");
                return true;
            }
        };
        if matches!(event.kind, EventKind::Access(_)) {
            return false;
        }

        if event.paths.iter().any(|p| self.filter.is_rules_file(p)) {
            info!("Ignore rules changed; reloading filter");
            self.filter = IgnoreFilter::for_root(&self.root);
            state.record_event(1, "ignore_rules_changed");
            return true;
        }

        self.add_new_dirs(&event);

        let relevant = event
            .paths
            .iter()
            .filter(|p| self.filter.should_index(p) || is_existing_dir(p))
            .count();
        if relevant == 0 {
            return false;
        }
        state.record_event(relevant, DEFAULT_REASON);
        true
    }

    fn add_new_dirs(&self, event: &Event) {
        let created: Vec<&PathBuf> = event
            .paths
            .iter()
            .filter(|p| is_existing_dir(p) && self.filter.should_descend(p))
            .collect();
        if created.is_empty() {
            return;
        }

        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(watcher) = watcher.as_mut() else {
            return;
        };
        let mut watched = self.watched.lock().unwrap_or_else(PoisonError::into_inner);
        for start in created {
            for dir in watchable_dirs(start, &self.filter) {
                if watched.contains(&dir) {
                    continue;
                }
                match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                    Ok(()) => {
                        watched.insert(dir);
                    }
                    Err(err) => warn!("failed to watch {}: {err}", dir.display()),
                }
            }
        }
    }

    async fn run_cycle(&self, mode: IndexMode, reason: String) -> IndexUpdate {
        let start = Instant::now();
        let result = self.coordinator.request(mode).await;
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mut update = IndexUpdate {
            completed_at: SystemTime::now(),
            duration_ms,
            stats: None,
            success: true,
            coalesced: false,
            reason,
            error: None,
        };
        match result {
            Ok(RunOutcome::Completed(stats)) => update.stats = Some(stats),
            Ok(RunOutcome::Coalesced) => update.coalesced = true,
            Err(err) => {
                error!("Watch index failure ({}): {err}", update.reason);
                update.success = false;
                update.error = Some(err.to_string());
            }
        }
        update
    }

    fn watched_count(&self) -> usize {
        self.watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn is_existing_dir(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|meta| meta.is_dir())
}
