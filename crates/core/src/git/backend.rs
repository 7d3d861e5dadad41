//! The repository operations the sync engine and checkpoint ledger depend on.
//!
//! [`RemoteSync`](super::RemoteSync) is the production implementation backed
//! by `git2`. Tests substitute in-memory fakes.

use std::path::{Path, PathBuf};

use crate::errors::GitError;
use crate::models::{CommitInfo, CommitOutcome, RepoStatus};

/// Every remote-repository operation used by the coordinator.
///
/// Implementations are shared between the poll thread, the watcher callback
/// and API callers, so they must be `Send + Sync`. All failures are reported
/// as [`GitError`]; implementations never panic on backend failures.
pub trait RepoBackend: Send + Sync {
    /// Open the working copy (fetching all remote branches) or clone it.
    fn initialize(&self) -> Result<(), GitError>;

    /// Whether `initialize` has completed successfully.
    fn is_initialized(&self) -> bool;

    /// Working-copy snapshot.
    fn status(&self) -> Result<RepoStatus, GitError>;

    /// The commit HEAD points at, or `None` on an unborn branch.
    fn head_commit(&self) -> Result<Option<CommitInfo>, GitError>;

    /// Stash local edits if dirty, pull the configured branch, re-apply the
    /// stash.
    fn pull(&self) -> Result<String, GitError>;

    /// Stage `files` (or everything, when `None`) and commit.
    fn commit(&self, files: Option<&[PathBuf]>, message: &str)
        -> Result<CommitOutcome, GitError>;

    /// Push the configured branch. Nothing to push is a success.
    fn push(&self) -> Result<String, GitError>;

    /// Commit, then push only when a commit was actually written.
    fn commit_and_push(
        &self,
        files: Option<&[PathBuf]>,
        message: &str,
    ) -> Result<CommitOutcome, GitError> {
        let outcome = self.commit(files, message)?;
        if outcome.is_committed() {
            self.push()?;
        }
        Ok(outcome)
    }

    /// Fetch, then count commits on the remote branch missing locally.
    fn has_remote_changes(&self) -> Result<usize, GitError>;

    /// Paths with uncommitted modifications, including untracked files.
    fn has_local_changes(&self) -> Result<Vec<String>, GitError>;

    /// Paths with unmerged index entries.
    fn has_conflicts(&self) -> Result<Vec<String>, GitError>;

    /// Move HEAD to `hash`. A hard reset also discards index and working-tree
    /// changes.
    fn reset_to_commit(&self, hash: &str, hard: bool) -> Result<String, GitError>;

    /// Root of the working tree.
    fn workdir(&self) -> &Path;
}
