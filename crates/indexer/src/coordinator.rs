use crate::indexer::ProjectIndexer;
use crate::project::IndexMode;
use crate::stats::IndexStats;
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(IndexStats),
    /// Folded into the run already in progress; it will execute once that
    /// run finishes.
    Coalesced,
}

#[derive(Debug, Default)]
struct RunQueue {
    active: bool,
    pending: Option<IndexMode>,
    current: Option<CancellationToken>,
}

/// Serializes index requests for one project.
///
/// At most one run executes; requests arriving meanwhile collapse into a
/// single follow-up run (Full wins over Incremental), which the leader
/// executes before returning.
pub struct IndexCoordinator {
    indexer: Arc<ProjectIndexer>,
    queue: Mutex<RunQueue>,
    shutdown: CancellationToken,
    runs: AtomicU64,
}

impl IndexCoordinator {
    pub fn new(indexer: Arc<ProjectIndexer>) -> Self {
        Self {
            indexer,
            queue: Mutex::new(RunQueue::default()),
            shutdown: CancellationToken::new(),
            runs: AtomicU64::new(0),
        }
    }

    pub fn indexer(&self) -> &Arc<ProjectIndexer> {
        &self.indexer
    }

    /// Number of runs actually executed.
    pub fn runs_started(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.lock_queue().active
    }

    pub async fn request(&self, mode: IndexMode) -> Result<RunOutcome> {
        {
            let mut queue = self.lock_queue();
            if queue.active {
                queue.pending = Some(queue.pending.map_or(mode, |p| p.merge(mode)));
                log::debug!("Coalesced {} index request", mode.as_str());
                return Ok(RunOutcome::Coalesced);
            }
            queue.active = true;
        }
        let mut active = ActiveRun {
            queue: &self.queue,
            armed: true,
        };

        let first = self.execute(mode).await;

        loop {
            let next = {
                let mut queue = self.lock_queue();
                match queue.pending.take() {
                    Some(next) if !self.shutdown.is_cancelled() => next,
                    _ => {
                        queue.active = false;
                        active.armed = false;
                        break;
                    }
                }
            };
            match self.execute(next).await {
                Ok(stats) => log::debug!(
                    "Follow-up {} run finished: +{} -{}",
                    next.as_str(),
                    stats.upserts,
                    stats.deletes
                ),
                Err(err) => log::warn!("Follow-up {} run failed: {err}", next.as_str()),
            }
        }

        first.map(RunOutcome::Completed)
    }

    /// Cancel the run in progress, if any; queued follow-ups still run.
    pub fn cancel_current(&self) {
        if let Some(token) = &self.lock_queue().current {
            token.cancel();
        }
    }

    /// Cancel the run in progress and refuse follow-ups.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn execute(&self, mode: IndexMode) -> Result<IndexStats> {
        let token = self.shutdown.child_token();
        self.lock_queue().current = Some(token.clone());
        self.runs.fetch_add(1, Ordering::Relaxed);

        let result = self.indexer.run(mode, &token).await;
        self.lock_queue().current = None;
        result
    }

    fn lock_queue(&self) -> MutexGuard<'_, RunQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the active flag if the leader future is dropped mid-run.
struct ActiveRun<'a> {
    queue: &'a Mutex<RunQueue>,
    armed: bool,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.active = false;
            queue.current = None;
        }
    }
}
