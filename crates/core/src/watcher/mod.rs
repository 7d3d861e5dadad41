//! Filesystem change source: OS notifications → noise filter → debounced
//! batches handed to a callback.
//!
//! The OS backend (inotify, FSEvents, ...) delivers events on its own thread
//! and only records paths. Batches are released by [`ChangeSource::check`],
//! which the owner calls periodically, so the callback always runs on the
//! owner's thread.

pub mod debounce;
pub mod filter;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info, trace, warn};

pub use debounce::ChangeSet;
pub use filter::PathFilter;

use crate::errors::WatchError;
use crate::models::WatcherStatus;

/// Upper bound on how long `stop` waits for the OS backend to shut down.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Receives each debounced batch of changed paths.
pub type ChangeCallback = Box<dyn Fn(Vec<PathBuf>) -> anyhow::Result<()> + Send + Sync>;

/// State shared with the OS delivery thread.
struct Shared {
    filter: PathFilter,
    pending: Mutex<ChangeSet>,
    paused: AtomicBool,
}

impl Shared {
    fn record(&self, event: &Event, now: Instant) {
        if self.paused.load(Ordering::SeqCst) {
            return;
        }
        let paths = relevant_paths(event, &self.filter);
        if paths.is_empty() {
            return;
        }
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for path in paths {
            trace!(path = %path.display(), "change recorded");
            pending.push_at(path, now);
        }
    }
}

/// Watches a directory tree and emits debounced batches of changed files.
pub struct ChangeSource {
    root: PathBuf,
    shared: Arc<Shared>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    callback: ChangeCallback,
}

impl ChangeSource {
    pub fn new(
        root: &Path,
        include_patterns: Vec<String>,
        debounce: Duration,
        callback: ChangeCallback,
    ) -> Self {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        Self {
            shared: Arc::new(Shared {
                filter: PathFilter::new(root.clone(), include_patterns),
                pending: Mutex::new(ChangeSet::new(debounce)),
                paused: AtomicBool::new(false),
            }),
            root,
            watcher: Mutex::new(None),
            callback,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Subscribe to OS notifications for the whole tree.
    pub fn start(&self) -> Result<(), WatchError> {
        if !self.root.exists() {
            return Err(WatchError::PathMissing(self.root.clone()));
        }
        let mut slot = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(WatchError::AlreadyRunning);
        }

        let shared = self.shared.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => shared.record(&event, Instant::now()),
                Err(e) => error!(error = %e, "file watcher error"),
            }
        })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        *slot = Some(watcher);

        info!(
            path = %self.root.display(),
            patterns = ?self.shared.filter.include_patterns(),
            "file watcher started"
        );
        Ok(())
    }

    /// Tear down the subscription, waiting at most three seconds.
    ///
    /// Returns `false` when the backend did not finish in time; the caller is
    /// never blocked longer than that.
    pub fn stop(&self) -> bool {
        let Some(watcher) = self.take_watcher() else {
            return true;
        };
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("tidesync-watch-stop".into())
            .spawn(move || {
                drop(watcher);
                let _ = tx.send(());
            });
        if let Err(e) = spawned {
            warn!(error = %e, "could not spawn watcher shutdown thread");
            return false;
        }
        match rx.recv_timeout(STOP_TIMEOUT) {
            Ok(()) => {
                info!("file watcher stopped");
                true
            }
            Err(_) => {
                warn!(timeout = ?STOP_TIMEOUT, "file watcher did not stop in time");
                false
            }
        }
    }

    /// Drop the subscription on a detached thread without waiting.
    pub fn force_stop(&self) {
        let Some(watcher) = self.take_watcher() else {
            return;
        };
        let spawned = thread::Builder::new()
            .name("tidesync-watch-kill".into())
            .spawn(move || drop(watcher));
        if let Err(e) = spawned {
            warn!(error = %e, "could not spawn watcher teardown thread");
        }
        self.clear_pending_changes();
        warn!("file watcher force-stopped");
    }

    fn take_watcher(&self) -> Option<RecommendedWatcher> {
        self.watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn is_running(&self) -> bool {
        self.watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Stop recording events. Events arriving while paused are dropped.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        debug!("file watcher paused");
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        debug!("file watcher resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Feed an event as if the OS backend had delivered it.
    pub fn record_event_at(&self, event: &Event, now: Instant) {
        self.shared.record(event, now);
    }

    /// Release the pending batch to the callback if the quiet period elapsed.
    pub fn check(&self) {
        self.check_at(Instant::now());
    }

    /// Like `check` but with a specific timestamp.
    pub fn check_at(&self, now: Instant) {
        if self.is_paused() {
            return;
        }
        let batch = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain_ready_at(now);
        let Some(batch) = batch else {
            return;
        };

        debug!(count = batch.len(), "debounce window elapsed, dispatching changes");
        match catch_unwind(AssertUnwindSafe(|| (self.callback)(batch))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "error in file change callback"),
            Err(_) => error!("file change callback panicked"),
        }
    }

    pub fn pending_changes(&self) -> Vec<PathBuf> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .paths()
    }

    pub fn clear_pending_changes(&self) {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn status(&self) -> WatcherStatus {
        let pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
        WatcherStatus {
            running: self.is_running(),
            paused: self.is_paused(),
            root: self.root.clone(),
            include_patterns: self.shared.filter.include_patterns().to_vec(),
            debounce_secs: pending.window().as_secs_f64(),
            pending_changes: pending.len(),
        }
    }
}

impl Drop for ChangeSource {
    fn drop(&mut self) {
        if self.is_running() {
            self.force_stop();
        }
    }
}

/// Paths of an event that should join the pending batch.
fn relevant_paths(event: &Event, filter: &PathFilter) -> Vec<PathBuf> {
    match &event.kind {
        EventKind::Create(_) | EventKind::Remove(_) => {}
        EventKind::Modify(ModifyKind::Metadata(_)) => {
            trace!("skipping metadata-only modify event");
            return Vec::new();
        }
        EventKind::Modify(_) => {}
        _ => {
            trace!(kind = ?event.kind, "skipping non-content event");
            return Vec::new();
        }
    }
    event
        .paths
        .iter()
        .filter(|p| !p.is_dir())
        .filter(|p| filter.accepts(p))
        .cloned()
        .collect()
}
