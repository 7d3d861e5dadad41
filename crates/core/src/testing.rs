//! In-memory [`RepoBackend`] used by unit tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use crate::errors::GitError;
use crate::git::RepoBackend;
use crate::models::{CommitInfo, CommitOutcome, RepoStatus};

/// Commit metadata whose full hash is the short hash padded with zeros.
pub(crate) fn commit(short: &str) -> CommitInfo {
    CommitInfo {
        short_hash: short.to_string(),
        full_hash: format!("{short:0<40}"),
        message: format!("commit {short}"),
        author: "dev".into(),
        date: Utc::now(),
    }
}

/// Scriptable backend that also detects overlapping pull/push calls.
pub(crate) struct FakeBackend {
    workdir: PathBuf,
    pub head: Mutex<Option<CommitInfo>>,
    pub resets: Mutex<Vec<(String, bool)>>,
    pub remote_ahead: AtomicUsize,
    pub pull_results: Mutex<VecDeque<Result<String, GitError>>>,
    pub pull_calls: AtomicUsize,
    pub pull_delay: Mutex<Duration>,
    pub commit_outcome: Mutex<CommitOutcome>,
    pub commits: Mutex<Vec<String>>,
    pub push_fails: AtomicBool,
    pub pushes: AtomicUsize,
    pub conflicts: Mutex<Vec<String>>,
    busy: AtomicBool,
    pub overlapped: AtomicBool,
}

impl FakeBackend {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            head: Mutex::new(Some(commit("a1b2c3d"))),
            resets: Mutex::new(Vec::new()),
            remote_ahead: AtomicUsize::new(0),
            pull_results: Mutex::new(VecDeque::new()),
            pull_calls: AtomicUsize::new(0),
            pull_delay: Mutex::new(Duration::ZERO),
            commit_outcome: Mutex::new(CommitOutcome::Committed {
                short_hash: "f00d123".into(),
            }),
            commits: Mutex::new(Vec::new()),
            push_fails: AtomicBool::new(false),
            pushes: AtomicUsize::new(0),
            conflicts: Mutex::new(Vec::new()),
            busy: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
        }
    }

    pub fn set_head(&self, short: &str) {
        *self.head.lock().unwrap() = Some(commit(short));
    }

    fn enter(&self) {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
    }

    fn leave(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl RepoBackend for FakeBackend {
    fn initialize(&self) -> Result<(), GitError> {
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn status(&self) -> Result<RepoStatus, GitError> {
        Ok(RepoStatus {
            current_branch: Some("main".into()),
            latest_commit: self.head.lock().unwrap().clone(),
            ..Default::default()
        })
    }

    fn head_commit(&self) -> Result<Option<CommitInfo>, GitError> {
        Ok(self.head.lock().unwrap().clone())
    }

    fn pull(&self) -> Result<String, GitError> {
        self.enter();
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.pull_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let result = self
            .pull_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("Fast-forwarded".into()));
        if result.is_ok() {
            self.remote_ahead.store(0, Ordering::SeqCst);
        }
        self.leave();
        result
    }

    fn commit(
        &self,
        _files: Option<&[PathBuf]>,
        message: &str,
    ) -> Result<CommitOutcome, GitError> {
        self.enter();
        self.commits.lock().unwrap().push(message.to_string());
        let outcome = self.commit_outcome.lock().unwrap().clone();
        self.leave();
        Ok(outcome)
    }

    fn push(&self) -> Result<String, GitError> {
        self.enter();
        let result = if self.push_fails.load(Ordering::SeqCst) {
            Err(GitError::PushRejected {
                branch: "main".into(),
                detail: "non-fast-forward".into(),
            })
        } else {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            Ok("Pushed".into())
        };
        self.leave();
        result
    }

    fn has_remote_changes(&self) -> Result<usize, GitError> {
        Ok(self.remote_ahead.load(Ordering::SeqCst))
    }

    fn has_local_changes(&self) -> Result<Vec<String>, GitError> {
        Ok(Vec::new())
    }

    fn has_conflicts(&self) -> Result<Vec<String>, GitError> {
        Ok(self.conflicts.lock().unwrap().clone())
    }

    fn reset_to_commit(&self, hash: &str, hard: bool) -> Result<String, GitError> {
        self.resets.lock().unwrap().push((hash.to_string(), hard));
        self.set_head(&hash.chars().take(7).collect::<String>());
        Ok(format!("Reset to {hash}"))
    }

    fn workdir(&self) -> &Path {
        &self.workdir
    }
}
