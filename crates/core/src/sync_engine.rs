//! Pull/push coordination.
//!
//! The [`SyncCoordinator`] owns one poll thread that pulls remote advances and
//! reacts to batches from the [`ChangeSource`] by committing and pushing local
//! edits. Both automatic paths share a single lock taken without blocking: a
//! path that finds it held skips its turn instead of queueing. Manual
//! operations take the same lock and wait for it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::checkpoint::CheckpointLedger;
use crate::config::{ConflictStrategy, SyncConfig};
use crate::conflict::{ConflictResolver, Side};
use crate::errors::{GitError, LedgerError, SyncError};
use crate::git::RepoBackend;
use crate::models::{
    Checkpoint, CommitOutcome, ConfigSummary, HistoryEntry, PositionInfo, SyncStats, SyncStatus,
};
use crate::retry::RetryState;
use crate::watcher::{ChangeCallback, ChangeSource};

/// Upper bound on one idle wait of the poll loop.
const POLL_TICK: Duration = Duration::from_secs(1);

/// Pause after an iteration failed unexpectedly.
const ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// How long `stop` waits for the poll thread.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// File names listed in an automatic commit message before eliding.
const MESSAGE_FILE_LIMIT: usize = 5;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Components that exist only after `initialize` succeeded.
struct Components<R: RepoBackend> {
    ledger: Arc<Mutex<CheckpointLedger<R>>>,
    watcher: Arc<ChangeSource>,
}

impl<R: RepoBackend> Clone for Components<R> {
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
            watcher: self.watcher.clone(),
        }
    }
}

enum EngineState<R: RepoBackend> {
    Uninitialized,
    Initialized(Components<R>),
}

/// Shutdown flag the poll loop can sleep on.
#[derive(Default)]
struct Shutdown {
    requested: Mutex<bool>,
    signal: Condvar,
}

impl Shutdown {
    fn request(&self) {
        *lock(&self.requested) = true;
        self.signal.notify_all();
    }

    /// Sleep for at most `timeout`. Returns `true` once shutdown is requested.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = lock(&self.requested);
        let (guard, _) = self
            .signal
            .wait_timeout_while(guard, timeout, |requested| !*requested)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

struct PollThread {
    handle: JoinHandle<()>,
    /// Disconnects when the loop returns.
    done: mpsc::Receiver<()>,
}

struct Inner<R: RepoBackend> {
    config: SyncConfig,
    backend: Arc<R>,
    state: RwLock<EngineState<R>>,
    /// Serializes every pull, push and reset against the working copy.
    sync_lock: Mutex<()>,
    stats: Mutex<SyncStats>,
    retry: Mutex<RetryState>,
    last_pull: Mutex<Option<Instant>>,
    /// Flag of the current run. Every `start` installs a fresh one.
    shutdown: Mutex<Arc<Shutdown>>,
    running: AtomicBool,
    poll_thread: Mutex<Option<PollThread>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Keeps one working copy in step with its remote branch.
pub struct SyncCoordinator<R: RepoBackend + 'static> {
    inner: Arc<Inner<R>>,
}

impl<R: RepoBackend + 'static> SyncCoordinator<R> {
    pub fn new(config: SyncConfig, backend: Arc<R>) -> Self {
        let retry = RetryState::from_options(&config.sync);
        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                state: RwLock::new(EngineState::Uninitialized),
                sync_lock: Mutex::new(()),
                stats: Mutex::new(SyncStats::default()),
                retry: Mutex::new(retry),
                last_pull: Mutex::new(None),
                shutdown: Mutex::new(Arc::new(Shutdown::default())),
                running: AtomicBool::new(false),
                poll_thread: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Arc<R> {
        &self.inner.backend
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.components().is_ok()
    }

    /// Copy of the activity counters.
    pub fn stats(&self) -> SyncStats {
        lock(&self.inner.stats).clone()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Validate the configuration, open or clone the working copy, load the
    /// checkpoint ledger and prepare the change source.
    #[instrument(skip(self))]
    pub fn initialize(&self) -> Result<String, SyncError> {
        if self.is_initialized() {
            return Ok("Sync engine already initialized".into());
        }
        let inner = &self.inner;
        inner.config.validate()?;

        info!(url = %inner.config.repository.url, "initializing sync engine");
        inner.backend.initialize()?;

        let mut ledger =
            CheckpointLedger::open(inner.backend.clone(), inner.config.history_store_path());
        if ledger.is_empty() {
            if let Err(e) = ledger.create_checkpoint(Some("Initial checkpoint")) {
                debug!(error = %e, "no initial checkpoint");
            }
        }

        let weak = Arc::downgrade(inner);
        let callback: ChangeCallback = Box::new(move |files| {
            if let Some(inner) = weak.upgrade() {
                inner.on_files_changed(files);
            }
            Ok(())
        });
        let watcher = ChangeSource::new(
            inner.backend.workdir(),
            inner.config.watch.include_patterns.clone(),
            inner.config.sync.debounce(),
            callback,
        );

        *inner.state.write().unwrap_or_else(|e| e.into_inner()) =
            EngineState::Initialized(Components {
                ledger: Arc::new(Mutex::new(ledger)),
                watcher: Arc::new(watcher),
            });
        info!("sync engine initialized");
        Ok("Initialization successful".into())
    }

    /// Start watching the working copy and spawn the poll thread.
    pub fn start(&self) -> Result<String, SyncError> {
        let components = self.inner.components()?;
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyRunning);
        }
        let shutdown = Arc::new(Shutdown::default());
        *lock(&self.inner.shutdown) = shutdown.clone();

        if let Err(e) = components.watcher.start() {
            error!(error = %e, "file watcher failed to start, local edits will not be pushed");
        }

        let (done_tx, done_rx) = mpsc::channel::<()>();
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name("tidesync-poll".into())
            .spawn(move || {
                let _done = done_tx;
                inner.poll_loop(&shutdown);
            });
        match spawned {
            Ok(handle) => {
                *lock(&self.inner.poll_thread) = Some(PollThread {
                    handle,
                    done: done_rx,
                });
                info!("sync engine started");
                Ok("Sync engine started".into())
            }
            Err(e) => {
                components.watcher.force_stop();
                self.inner.running.store(false, Ordering::SeqCst);
                Err(SyncError::Spawn(e))
            }
        }
    }

    /// Stop the change source, then the poll thread. Returns once the thread
    /// has exited or the join timeout elapsed, whichever comes first.
    pub fn stop(&self) -> Result<String, SyncError> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Err(SyncError::NotRunning);
        }
        info!("stopping sync engine");
        self.inner.request_shutdown();

        if let Ok(components) = self.inner.components() {
            if !components.watcher.stop() {
                warn!("file watcher did not stop in time");
            }
        }

        let poll = lock(&self.inner.poll_thread).take();
        if let Some(PollThread { handle, done }) = poll {
            match done.recv_timeout(STOP_JOIN_TIMEOUT) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if handle.join().is_err() {
                        warn!("poll thread ended with a panic");
                    }
                    debug!("poll thread finished");
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        timeout_secs = STOP_JOIN_TIMEOUT.as_secs(),
                        "poll thread did not finish in time, detaching it"
                    );
                }
            }
        }

        info!("sync engine stopped");
        Ok("Sync engine stopped".into())
    }

    /// Tear everything down without waiting on anything.
    pub fn emergency_stop(&self) -> Result<String, SyncError> {
        warn!("emergency stop initiated");
        self.inner.request_shutdown();
        self.inner.running.store(false, Ordering::SeqCst);
        if let Ok(components) = self.inner.components() {
            components.watcher.force_stop();
        }
        drop(lock(&self.inner.poll_thread).take());
        warn!("emergency stop completed");
        Ok("Emergency stop completed".into())
    }

    // -----------------------------------------------------------------------
    // Manual operations
    // -----------------------------------------------------------------------

    /// Push pending local edits, then pull.
    #[instrument(skip(self))]
    pub fn manual_sync(&self) -> Result<String, SyncError> {
        let inner = &self.inner;
        let components = inner.components()?;
        let _guard = lock(&inner.sync_lock);
        let _pause = PauseGuard::new(&components.watcher);

        let local = inner.count_failure(inner.backend.has_local_changes())?;
        if !local.is_empty() {
            let message = format!("[tidesync manual] {}", timestamp(Local::now()));
            let outcome = inner.count_failure(inner.backend.commit_and_push(None, &message))?;
            if outcome.is_committed() {
                inner.note_push();
            }
        }

        let result = inner.count_failure(inner.backend.pull())?;
        inner.note_pull();
        lock(&inner.retry).reset();
        info!(event = "manual_sync", result = %result, "manual sync completed");
        inner.record_checkpoint(&components, "Manual sync");
        Ok("Manual sync successful".into())
    }

    /// Pull now, whether or not the remote looks ahead.
    #[instrument(skip(self))]
    pub fn force_pull(&self) -> Result<String, SyncError> {
        let inner = &self.inner;
        let components = inner.components()?;
        let _guard = lock(&inner.sync_lock);
        let _pause = PauseGuard::new(&components.watcher);

        let result = inner.count_failure(inner.backend.pull())?;
        inner.note_pull();
        lock(&inner.retry).reset();
        info!(event = "pull_success", result = %result, "forced pull completed");
        inner.record_checkpoint(&components, "Force pull");
        Ok("Force pull successful".into())
    }

    /// Commit everything in the working copy and push, including commits
    /// that an earlier failed push left behind.
    #[instrument(skip(self))]
    pub fn force_push(&self) -> Result<String, SyncError> {
        let inner = &self.inner;
        let components = inner.components()?;
        let _guard = lock(&inner.sync_lock);

        let message = format!("[tidesync force] {}", timestamp(Local::now()));
        let outcome = inner.count_failure(inner.backend.commit(None, &message))?;
        let result = inner.count_failure(inner.backend.push())?;
        inner.note_push();
        info!(event = "push_success", %outcome, result = %result, "forced push completed");
        if outcome.is_committed() {
            inner.record_checkpoint(&components, "Force push");
        }
        Ok("Force push successful".into())
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    pub fn create_checkpoint(&self, description: Option<&str>) -> Result<usize, SyncError> {
        let components = self.inner.components()?;
        let _guard = lock(&self.inner.sync_lock);
        let id = lock(&components.ledger).create_checkpoint(description)?;
        Ok(id)
    }

    /// Step `steps` checkpoints back, resetting the working copy.
    pub fn revert_checkpoint(&self, steps: usize) -> Result<String, SyncError> {
        self.navigate(|ledger| ledger.revert(steps))
    }

    /// Step `steps` checkpoints forward, resetting the working copy.
    pub fn forward_checkpoint(&self, steps: usize) -> Result<String, SyncError> {
        self.navigate(|ledger| ledger.forward(steps))
    }

    /// Jump to checkpoint `id`, resetting the working copy.
    pub fn goto_checkpoint(&self, id: usize) -> Result<String, SyncError> {
        self.navigate(|ledger| ledger.goto(id))
    }

    fn navigate(
        &self,
        op: impl FnOnce(&mut CheckpointLedger<R>) -> Result<String, LedgerError>,
    ) -> Result<String, SyncError> {
        let components = self.inner.components()?;
        let _guard = lock(&self.inner.sync_lock);
        let _pause = PauseGuard::new(&components.watcher);
        let message = op(&mut lock(&components.ledger))?;
        info!(%message, "checkpoint navigation");
        Ok(message)
    }

    pub fn get_history_summary(&self, max_items: usize) -> Result<Vec<HistoryEntry>, SyncError> {
        let components = self.inner.components()?;
        let history = lock(&components.ledger).get_history_summary(max_items);
        Ok(history)
    }

    pub fn search_checkpoints(&self, query: &str) -> Result<Vec<Checkpoint>, SyncError> {
        let components = self.inner.components()?;
        let found = lock(&components.ledger).search(query);
        Ok(found)
    }

    pub fn current_checkpoint(&self) -> Result<Option<PositionInfo>, SyncError> {
        let components = self.inner.components()?;
        let info = lock(&components.ledger).get_current_position_info();
        Ok(info)
    }

    pub fn export_history(&self, path: &Path) -> Result<String, SyncError> {
        let components = self.inner.components()?;
        let message = lock(&components.ledger).export_history(path)?;
        Ok(message)
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Snapshot of the engine. Never fails; unavailable parts are `None`.
    pub fn get_status(&self) -> SyncStatus {
        let inner = &self.inner;
        let components = inner.components().ok();
        let repo = match components {
            Some(_) => match inner.backend.status() {
                Ok(status) => Some(status),
                Err(e) => {
                    debug!(error = %e, "repository status unavailable");
                    None
                }
            },
            None => None,
        };
        let config = &inner.config;
        SyncStatus {
            running: self.is_running(),
            initialized: components.is_some(),
            stats: self.stats(),
            repo,
            watcher: components.as_ref().map(|c| c.watcher.status()),
            checkpoint: components
                .as_ref()
                .and_then(|c| lock(&c.ledger).get_current_position_info()),
            config: ConfigSummary {
                repo_url: config.repository.url.clone(),
                local_dir: config.repository.local_path.clone(),
                branch: config.repository.branch.clone(),
                auto_pull: config.sync.auto_pull,
                auto_push: config.sync.auto_push,
                interval_secs: config.sync.interval_secs,
            },
        }
    }
}

impl<R: RepoBackend + 'static> Drop for SyncCoordinator<R> {
    fn drop(&mut self) {
        // The poll thread holds its own reference; tell it to exit.
        self.inner.request_shutdown();
        self.inner.running.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Automatic paths
// ---------------------------------------------------------------------------

impl<R: RepoBackend + 'static> Inner<R> {
    fn components(&self) -> Result<Components<R>, SyncError> {
        match &*self.state.read().unwrap_or_else(|e| e.into_inner()) {
            EngineState::Initialized(components) => Ok(components.clone()),
            EngineState::Uninitialized => Err(SyncError::NotInitialized),
        }
    }

    /// `None` when another operation holds the lock.
    fn try_sync_lock(&self) -> Option<MutexGuard<'_, ()>> {
        match self.sync_lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn request_shutdown(&self) {
        lock(&self.shutdown).request();
    }

    fn poll_loop(&self, shutdown: &Shutdown) {
        info!(
            interval_secs = self.config.sync.interval_secs,
            auto_pull = self.config.sync.auto_pull,
            "sync loop started"
        );
        loop {
            if shutdown.wait(POLL_TICK) {
                break;
            }
            let failed = match catch_unwind(AssertUnwindSafe(|| self.tick(Instant::now()))) {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    error!(error = %e, "error in sync loop");
                    true
                }
                Err(_) => {
                    error!("sync loop iteration panicked");
                    true
                }
            };
            if failed {
                lock(&self.stats).errors += 1;
                if shutdown.wait(ERROR_BACKOFF) {
                    break;
                }
            }
        }
        info!("sync loop exited");
    }

    fn tick(&self, now: Instant) -> Result<(), SyncError> {
        if self.config.sync.auto_pull && self.pull_due(now) {
            self.check_and_pull()?;
        }
        self.components()?.watcher.check_at(now);
        Ok(())
    }

    fn pull_due(&self, now: Instant) -> bool {
        let wait = lock(&self.retry).pull_wait(self.config.sync.interval());
        match *lock(&self.last_pull) {
            Some(last) => now.saturating_duration_since(last) >= wait,
            None => true,
        }
    }

    /// Poll path: pull when the remote is ahead.
    fn check_and_pull(&self) -> Result<(), SyncError> {
        let Some(_guard) = self.try_sync_lock() else {
            debug!("sync in progress, skipping pull check");
            return Ok(());
        };
        let components = self.components()?;

        let behind = self.backend.has_remote_changes();
        *lock(&self.last_pull) = Some(Instant::now());
        let behind = match behind {
            Ok(behind) => behind,
            Err(e) => {
                warn!(error = %e, "could not check remote for changes");
                self.note_pull_failure();
                return Ok(());
            }
        };
        if behind == 0 {
            return Ok(());
        }

        info!(event = "remote_changes", behind, "{behind} new commit(s) on remote");
        let _pause = PauseGuard::new(&components.watcher);
        match self.backend.pull() {
            Ok(result) => {
                lock(&self.retry).reset();
                self.note_pull();
                info!(event = "pull_success", result = %result, "pulled remote changes");
                self.record_checkpoint(&components, &format!("Auto-pull: {behind} commit(s)"));
            }
            Err(e) => {
                error!(error = %e, "pull failed");
                self.note_pull_failure();
                self.handle_conflicts(&components, &e);
            }
        }
        Ok(())
    }

    fn note_pull_failure(&self) {
        lock(&self.stats).errors += 1;
        let mut retry = lock(&self.retry);
        if retry.record_failure() {
            warn!(
                delay_secs = retry.delay().as_secs(),
                "repeated pull failures, backing off"
            );
        }
    }

    /// Look for conflicts a failed pull left behind and apply the configured
    /// strategy to them.
    ///
    /// A conflicting stash re-apply puts the local edit in the second section
    /// of each block, so the kept section is flipped for that case.
    fn handle_conflicts(&self, components: &Components<R>, cause: &GitError) {
        let files = match self.backend.has_conflicts() {
            Ok(files) if !files.is_empty() => files,
            Ok(_) => return,
            Err(e) => {
                warn!(error = %e, "could not inspect conflicts");
                return;
            }
        };
        lock(&self.stats).conflicts += 1;
        warn!(count = files.len(), files = ?files, "merge conflicts detected");

        let stash_reapply = matches!(cause, GitError::StashConflict);
        let workdir = self.backend.workdir();
        let paths: Vec<PathBuf> = files.iter().map(|f| workdir.join(f)).collect();
        let strategy = self.config.sync.conflict_strategy;
        let side = match strategy {
            ConflictStrategy::Manual => {
                if stash_reapply {
                    warn!("local edits are still in the stash");
                }
                warn!(
                    "conflict strategy is manual, resolve and commit by hand\n{}",
                    ConflictResolver::create_report(&paths)
                );
                return;
            }
            ConflictStrategy::Ours => Side::Ours,
            ConflictStrategy::Theirs => Side::Theirs,
        };
        let side = if stash_reapply { side.opposite() } else { side };

        for path in &paths {
            match ConflictResolver::resolve(path, side) {
                Ok(blocks) => info!(path = %path.display(), blocks, %strategy, "conflict resolved"),
                Err(e) => warn!(path = %path.display(), error = %e, "could not resolve conflict"),
            }
        }

        let message = format!("Resolve merge conflicts using '{strategy}'");
        match self.backend.commit_and_push(None, &message) {
            Ok(CommitOutcome::Committed { short_hash }) => {
                self.note_push();
                info!(event = "push_success", commit = %short_hash, "conflict resolution pushed");
                self.record_checkpoint(components, &format!("Conflict resolution: {strategy}"));
            }
            Ok(CommitOutcome::NoChanges) => debug!("conflict resolution produced no changes"),
            Err(e) => {
                lock(&self.stats).errors += 1;
                error!(error = %e, "could not commit conflict resolution");
            }
        }
    }

    /// Push path: one debounced batch of local edits.
    fn on_files_changed(&self, files: Vec<PathBuf>) {
        if !self.config.sync.auto_push || files.is_empty() {
            return;
        }
        let Some(_guard) = self.try_sync_lock() else {
            debug!(count = files.len(), "sync in progress, skipping change batch");
            return;
        };
        let Ok(components) = self.components() else {
            return;
        };

        info!(event = "local_changes", count = files.len(), "local changes detected");
        let message = commit_message(&self.config.sync.commit_prefix, Local::now(), &files);
        match self.backend.commit_and_push(Some(files.as_slice()), &message) {
            Ok(CommitOutcome::Committed { short_hash }) => {
                self.note_push();
                info!(event = "push_success", commit = %short_hash, "pushed local changes");
                self.record_checkpoint(
                    &components,
                    &format!("Auto-push: {} file(s)", files.len()),
                );
            }
            Ok(CommitOutcome::NoChanges) => debug!("change batch produced no commit"),
            Err(e) => {
                lock(&self.stats).errors += 1;
                error!(error = %e, "failed to push local changes");
            }
        }
    }

    /// Append a checkpoint for a completed operation and trim the history.
    fn record_checkpoint(&self, components: &Components<R>, description: &str) {
        let mut ledger = lock(&components.ledger);
        if let Err(e) = ledger.create_checkpoint(Some(description)) {
            warn!(error = %e, description, "checkpoint not recorded");
            return;
        }
        let removed = ledger.cleanup_old_checkpoints(self.config.history.max_history);
        if removed > 0 {
            debug!(removed, "trimmed checkpoint history");
        }
    }

    fn note_pull(&self) {
        let mut stats = lock(&self.stats);
        stats.pulls += 1;
        stats.last_activity = Some(Utc::now());
    }

    fn note_push(&self) {
        let mut stats = lock(&self.stats);
        stats.pushes += 1;
        stats.last_activity = Some(Utc::now());
    }

    fn count_failure<T>(&self, result: Result<T, GitError>) -> Result<T, SyncError> {
        result.map_err(|e| {
            lock(&self.stats).errors += 1;
            SyncError::from(e)
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Pauses the change source for its lifetime.
struct PauseGuard<'a>(&'a ChangeSource);

impl<'a> PauseGuard<'a> {
    fn new(source: &'a ChangeSource) -> Self {
        source.pause();
        Self(source)
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.0.resume();
    }
}

fn timestamp(now: DateTime<Local>) -> String {
    now.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// `"{prefix} {timestamp}: a.rs, b.rs and 3 more"`.
fn commit_message(prefix: &str, now: DateTime<Local>, files: &[PathBuf]) -> String {
    let names: Vec<String> = files
        .iter()
        .take(MESSAGE_FILE_LIMIT)
        .map(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.display().to_string())
        })
        .collect();
    let mut message = format!("{prefix} {}: {}", timestamp(now), names.join(", "));
    if files.len() > MESSAGE_FILE_LIMIT {
        message.push_str(&format!(" and {} more", files.len() - MESSAGE_FILE_LIMIT));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;
    use chrono::TimeZone;

    fn config(dir: &Path) -> SyncConfig {
        let toml = format!(
            r#"
            [repository]
            url = "https://example.com/team/project.git"
            local_path = "{}"

            [sync]
            interval_secs = 30
            retry_delay_secs = 30
            max_retries = 3
            "#,
            dir.display()
        );
        toml::from_str(&toml).unwrap()
    }

    fn coordinator(
        dir: &Path,
        edit: impl FnOnce(&mut SyncConfig),
    ) -> (SyncCoordinator<FakeBackend>, Arc<FakeBackend>) {
        let mut cfg = config(dir);
        edit(&mut cfg);
        let backend = Arc::new(FakeBackend::new(dir));
        let coordinator = SyncCoordinator::new(cfg, backend.clone());
        coordinator.initialize().unwrap();
        (coordinator, backend)
    }

    fn descriptions(c: &SyncCoordinator<FakeBackend>) -> Vec<String> {
        c.get_history_summary(100)
            .unwrap()
            .into_iter()
            .map(|e| e.checkpoint.description)
            .collect()
    }

    #[test]
    fn test_commit_message_elides_after_five() {
        let now = Local.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap();
        let files: Vec<PathBuf> = ["a.rs", "b.rs", "c.rs", "d.rs", "e.rs", "f.rs", "g.rs"]
            .iter()
            .map(|n| PathBuf::from("/work/src").join(n))
            .collect();
        assert_eq!(
            commit_message("[auto]", now, &files),
            "[auto] 2024-03-01 10:15:00: a.rs, b.rs, c.rs, d.rs, e.rs and 2 more"
        );
        assert_eq!(
            commit_message("[auto]", now, &files[..2]),
            "[auto] 2024-03-01 10:15:00: a.rs, b.rs"
        );
    }

    #[test]
    fn test_operations_require_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(dir.path()));
        let coordinator = SyncCoordinator::new(config(dir.path()), backend);
        assert!(matches!(coordinator.start(), Err(SyncError::NotInitialized)));
        assert!(matches!(
            coordinator.manual_sync(),
            Err(SyncError::NotInitialized)
        ));
        assert!(matches!(coordinator.stop(), Err(SyncError::NotRunning)));
        let status = coordinator.get_status();
        assert!(!status.initialized);
        assert!(status.repo.is_none());
    }

    #[test]
    fn test_initialize_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.sync.interval_secs = 5;
        let coordinator = SyncCoordinator::new(cfg, Arc::new(FakeBackend::new(dir.path())));
        assert!(matches!(
            coordinator.initialize(),
            Err(SyncError::ConfigError(_))
        ));
        assert!(!coordinator.is_initialized());
    }

    #[test]
    fn test_initialize_rejects_tracked_ledger_location() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.history.store_path = PathBuf::from("history.json");
        let backend = Arc::new(FakeBackend::new(dir.path()));
        let coordinator = SyncCoordinator::new(cfg, backend);
        assert!(matches!(
            coordinator.initialize(),
            Err(SyncError::ConfigError(_))
        ));
        assert!(!dir.path().join("history.json").exists());
    }

    #[test]
    fn test_initialize_records_initial_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path(), |_| {});
        assert_eq!(descriptions(&coordinator), vec!["Initial checkpoint"]);
        assert!(coordinator.initialize().is_ok());
        assert_eq!(descriptions(&coordinator).len(), 1);
    }

    #[test]
    fn test_pull_failures_double_retry_delay() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |_| {});
        backend.remote_ahead.store(3, Ordering::SeqCst);
        for _ in 0..3 {
            backend
                .pull_results
                .lock()
                .unwrap()
                .push_back(Err(GitError::RefNotFound("origin/main".into())));
        }

        for _ in 0..3 {
            coordinator.inner.check_and_pull().unwrap();
        }

        let retry = coordinator.inner.retry.lock().unwrap().clone();
        assert_eq!(retry.delay(), Duration::from_secs(60));
        assert_eq!(retry.failures(), 0);
        let stats = coordinator.stats();
        assert_eq!(stats.pulls, 0);
        assert_eq!(stats.errors, 3);
        assert_eq!(descriptions(&coordinator), vec!["Initial checkpoint"]);
    }

    #[test]
    fn test_successful_pull_records_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |_| {});
        backend.remote_ahead.store(2, Ordering::SeqCst);
        backend
            .pull_results
            .lock()
            .unwrap()
            .push_back(Err(GitError::RefNotFound("origin/main".into())));

        coordinator.inner.check_and_pull().unwrap();
        assert_eq!(coordinator.inner.retry.lock().unwrap().failures(), 1);

        backend.set_head("e4f5g6h");
        coordinator.inner.check_and_pull().unwrap();
        let stats = coordinator.stats();
        assert_eq!(stats.pulls, 1);
        assert!(stats.last_activity.is_some());
        assert_eq!(coordinator.inner.retry.lock().unwrap().failures(), 0);
        assert_eq!(
            descriptions(&coordinator),
            vec!["Initial checkpoint", "Auto-pull: 2 commit(s)"]
        );
        let status = coordinator.get_status();
        assert!(!status.watcher.unwrap().paused);
        assert_eq!(status.checkpoint.unwrap().commit_hash, "e4f5g6h");
    }

    #[test]
    fn test_up_to_date_remote_does_not_pull() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |_| {});
        coordinator.inner.check_and_pull().unwrap();
        assert_eq!(backend.pull_calls.load(Ordering::SeqCst), 0);
        assert!(coordinator.inner.last_pull.lock().unwrap().is_some());
    }

    #[test]
    fn test_pull_due_respects_interval_and_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path(), |_| {});
        let inner = &coordinator.inner;
        let start = Instant::now();
        assert!(inner.pull_due(start));

        *inner.last_pull.lock().unwrap() = Some(start);
        assert!(!inner.pull_due(start + Duration::from_secs(29)));
        assert!(inner.pull_due(start + Duration::from_secs(30)));

        for _ in 0..3 {
            inner.retry.lock().unwrap().record_failure();
        }
        assert!(!inner.pull_due(start + Duration::from_secs(45)));
        assert!(inner.pull_due(start + Duration::from_secs(60)));
    }

    #[test]
    fn test_contended_paths_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |_| {});
        backend.remote_ahead.store(1, Ordering::SeqCst);

        let held = coordinator.inner.sync_lock.lock().unwrap();
        coordinator.inner.check_and_pull().unwrap();
        coordinator
            .inner
            .on_files_changed(vec![dir.path().join("a.txt")]);
        drop(held);

        assert_eq!(backend.pull_calls.load(Ordering::SeqCst), 0);
        assert!(backend.commits.lock().unwrap().is_empty());
        assert!(coordinator.inner.last_pull.lock().unwrap().is_none());
    }

    #[test]
    fn test_pull_and_push_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |_| {});
        *backend.pull_delay.lock().unwrap() = Duration::from_millis(20);

        let puller = {
            let inner = coordinator.inner.clone();
            let backend = backend.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    backend.remote_ahead.store(1, Ordering::SeqCst);
                    inner.check_and_pull().unwrap();
                }
            })
        };
        let pusher = {
            let inner = coordinator.inner.clone();
            let file = dir.path().join("notes.txt");
            thread::spawn(move || {
                for _ in 0..200 {
                    inner.on_files_changed(vec![file.clone()]);
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };
        puller.join().unwrap();
        pusher.join().unwrap();

        assert!(!backend.overlapped.load(Ordering::SeqCst));
        assert!(backend.pull_calls.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_change_batch_commits_and_pushes() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |c| {
            c.sync.commit_prefix = "[auto]".into();
        });
        let files: Vec<PathBuf> = (0..7).map(|i| dir.path().join(format!("f{i}.txt"))).collect();

        coordinator.inner.on_files_changed(files);

        let commits = backend.commits.lock().unwrap().clone();
        assert_eq!(commits.len(), 1);
        assert!(commits[0].starts_with("[auto] "));
        assert!(commits[0].ends_with("f0.txt, f1.txt, f2.txt, f3.txt, f4.txt and 2 more"));
        assert_eq!(backend.pushes.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.stats().pushes, 1);
        assert_eq!(
            descriptions(&coordinator),
            vec!["Initial checkpoint", "Auto-push: 7 file(s)"]
        );
    }

    #[test]
    fn test_change_batch_without_changes_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |_| {});
        *backend.commit_outcome.lock().unwrap() = CommitOutcome::NoChanges;

        coordinator
            .inner
            .on_files_changed(vec![dir.path().join("a.txt")]);

        assert_eq!(backend.pushes.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.stats(), SyncStats::default());
        assert_eq!(descriptions(&coordinator).len(), 1);
    }

    #[test]
    fn test_push_failure_counts_error_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |_| {});
        backend.push_fails.store(true, Ordering::SeqCst);

        coordinator
            .inner
            .on_files_changed(vec![dir.path().join("a.txt")]);

        let stats = coordinator.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.pushes, 0);
        assert_eq!(coordinator.inner.retry.lock().unwrap().failures(), 0);
        assert_eq!(descriptions(&coordinator).len(), 1);
    }

    #[test]
    fn test_auto_push_disabled_ignores_batches() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |c| c.sync.auto_push = false);
        coordinator
            .inner
            .on_files_changed(vec![dir.path().join("a.txt")]);
        assert!(backend.commits.lock().unwrap().is_empty());
    }

    #[test]
    fn test_conflicts_resolved_with_theirs() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |c| {
            c.sync.conflict_strategy = ConflictStrategy::Theirs;
        });
        let file = dir.path().join("notes.txt");
        std::fs::write(
            &file,
            "top\n<<<<<<< ours\nmine\n=======\nremote\n>>>>>>> theirs\nbottom\n",
        )
        .unwrap();
        backend.remote_ahead.store(1, Ordering::SeqCst);
        backend
            .pull_results
            .lock()
            .unwrap()
            .push_back(Err(GitError::MergeConflict(vec!["notes.txt".into()])));
        *backend.conflicts.lock().unwrap() = vec!["notes.txt".into()];

        coordinator.inner.check_and_pull().unwrap();

        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "top\nremote\nbottom\n"
        );
        let stats = coordinator.stats();
        assert_eq!(stats.conflicts, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(
            backend.commits.lock().unwrap().as_slice(),
            ["Resolve merge conflicts using 'theirs'"]
        );
        assert_eq!(
            descriptions(&coordinator).last().unwrap(),
            "Conflict resolution: theirs"
        );
    }

    #[test]
    fn test_stash_conflict_with_ours_keeps_local_edit() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |c| {
            c.sync.conflict_strategy = ConflictStrategy::Ours;
        });
        let file = dir.path().join("notes.txt");
        std::fs::write(
            &file,
            "<<<<<<< Updated upstream\nremote\n=======\nmine\n>>>>>>> Stashed changes\n",
        )
        .unwrap();
        backend.remote_ahead.store(1, Ordering::SeqCst);
        backend
            .pull_results
            .lock()
            .unwrap()
            .push_back(Err(GitError::StashConflict));
        *backend.conflicts.lock().unwrap() = vec!["notes.txt".into()];

        coordinator.inner.check_and_pull().unwrap();

        assert_eq!(std::fs::read_to_string(&file).unwrap(), "mine\n");
        assert_eq!(
            backend.commits.lock().unwrap().as_slice(),
            ["Resolve merge conflicts using 'ours'"]
        );
        assert_eq!(
            descriptions(&coordinator).last().unwrap(),
            "Conflict resolution: ours"
        );
    }

    #[test]
    fn test_manual_strategy_leaves_markers() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |_| {});
        let file = dir.path().join("notes.txt");
        let conflicted = "<<<<<<< ours\nmine\n=======\nremote\n>>>>>>> theirs\n";
        std::fs::write(&file, conflicted).unwrap();
        backend.remote_ahead.store(1, Ordering::SeqCst);
        backend
            .pull_results
            .lock()
            .unwrap()
            .push_back(Err(GitError::StashConflict));
        *backend.conflicts.lock().unwrap() = vec!["notes.txt".into()];

        coordinator.inner.check_and_pull().unwrap();

        assert_eq!(std::fs::read_to_string(&file).unwrap(), conflicted);
        assert_eq!(coordinator.stats().conflicts, 1);
        assert!(backend.commits.lock().unwrap().is_empty());
    }

    #[test]
    fn test_manual_sync_pulls() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |_| {});
        assert_eq!(coordinator.manual_sync().unwrap(), "Manual sync successful");
        assert_eq!(backend.pull_calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.stats().pulls, 1);
        assert_eq!(descriptions(&coordinator).last().unwrap(), "Manual sync");
    }

    #[test]
    fn test_manual_sync_reports_pull_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |_| {});
        backend
            .pull_results
            .lock()
            .unwrap()
            .push_back(Err(GitError::RefNotFound("origin/main".into())));
        let err = coordinator.manual_sync().unwrap_err();
        assert!(matches!(err, SyncError::GitError(GitError::RefNotFound(_))));
        assert_eq!(coordinator.stats().errors, 1);
    }

    #[test]
    fn test_force_push_pushes_without_new_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |_| {});
        *backend.commit_outcome.lock().unwrap() = CommitOutcome::NoChanges;
        assert_eq!(coordinator.force_push().unwrap(), "Force push successful");
        assert_eq!(backend.pushes.load(Ordering::SeqCst), 1);
        assert_eq!(descriptions(&coordinator).len(), 1);
    }

    #[test]
    fn test_force_pull() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |_| {});
        assert_eq!(coordinator.force_pull().unwrap(), "Force pull successful");
        assert_eq!(backend.pull_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_checkpoint_navigation_resets_working_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |_| {});
        backend.set_head("e4f5g6h");
        coordinator.create_checkpoint(Some("second")).unwrap();

        let message = coordinator.revert_checkpoint(1).unwrap();
        assert_eq!(message, "Reverted to: Initial checkpoint");
        let resets = backend.resets.lock().unwrap().clone();
        assert_eq!(resets, vec![(format!("{:0<40}", "a1b2c3d"), true)]);
        assert!(!coordinator.get_status().watcher.unwrap().paused);

        assert!(matches!(
            coordinator.revert_checkpoint(5),
            Err(SyncError::LedgerError(_))
        ));
        assert_eq!(coordinator.search_checkpoints("SECOND").unwrap().len(), 1);
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path(), |_| {});
        assert_eq!(coordinator.start().unwrap(), "Sync engine started");
        assert!(coordinator.is_running());
        assert!(matches!(coordinator.start(), Err(SyncError::AlreadyRunning)));
        assert!(coordinator.get_status().watcher.unwrap().running);

        let begun = Instant::now();
        assert_eq!(coordinator.stop().unwrap(), "Sync engine stopped");
        assert!(begun.elapsed() < STOP_JOIN_TIMEOUT);
        assert!(!coordinator.is_running());
        assert!(!coordinator.get_status().watcher.unwrap().running);
        assert!(matches!(coordinator.stop(), Err(SyncError::NotRunning)));

        coordinator.start().unwrap();
        coordinator.stop().unwrap();
    }

    #[test]
    fn test_poll_loop_pulls_when_remote_ahead() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, backend) = coordinator(dir.path(), |_| {});
        backend.remote_ahead.store(1, Ordering::SeqCst);
        coordinator.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while coordinator.stats().pulls == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        coordinator.stop().unwrap();
        assert_eq!(coordinator.stats().pulls, 1);
    }

    #[test]
    fn test_restart_keeps_previous_run_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path(), |_| {});
        coordinator.start().unwrap();
        let first = lock(&coordinator.inner.shutdown).clone();
        coordinator.emergency_stop().unwrap();

        coordinator.start().unwrap();
        let second = lock(&coordinator.inner.shutdown).clone();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.wait(Duration::ZERO));
        assert!(!second.wait(Duration::ZERO));

        coordinator.stop().unwrap();
        assert!(second.wait(Duration::ZERO));
    }

    #[test]
    fn test_emergency_stop_does_not_wait() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path(), |_| {});
        coordinator.start().unwrap();
        assert_eq!(
            coordinator.emergency_stop().unwrap(),
            "Emergency stop completed"
        );
        assert!(!coordinator.is_running());
        assert!(!coordinator.get_status().watcher.unwrap().running);
    }
}
