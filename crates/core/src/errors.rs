//! Error types for the tidesync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from the remote-sync layer (git2 operations).
#[derive(Debug, Error)]
pub enum GitError {
    /// The local path does not hold a usable repository.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// An operation was attempted before `initialize` succeeded.
    #[error("repository not initialized")]
    NotInitialized,

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, remote branch, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// Push was rejected (e.g. non-fast-forward).
    #[error("git push rejected for branch '{branch}': {detail}")]
    PushRejected { branch: String, detail: String },

    /// The pull merge left unmerged paths in the index.
    #[error("merge conflict in {} file(s): {}", .0.len(), .0.join(", "))]
    MergeConflict(Vec<String>),

    /// Re-applying the auto-stash after a pull conflicted with the pulled
    /// content. The stash entry is kept until the conflict is settled.
    ///
    /// Conflict blocks left by the re-apply hold the pulled text in the first
    /// section and the stashed local edit in the second.
    #[error("conflict detected after pull; local changes remain stashed, resolve manually")]
    StashConflict,

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from the conflict-marker utilities.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// The file is not valid UTF-8 and cannot be rewritten line by line.
    #[error("'{0}' is not a text file")]
    NotText(PathBuf),

    /// Reading or writing the file failed.
    #[error("conflict I/O error on '{path}': {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Ledger errors
// ---------------------------------------------------------------------------

/// Errors from checkpoint creation and navigation.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The ledger holds no checkpoints.
    #[error("no version history available")]
    Empty,

    /// HEAD does not point at a commit yet.
    #[error("no commits found")]
    NoCommits,

    /// Not enough history behind the cursor.
    #[error("cannot revert {steps} step(s) (only {available} available)")]
    CannotRevert { steps: usize, available: usize },

    /// Not enough history ahead of the cursor.
    #[error("cannot go forward {steps} step(s) (only {available} available)")]
    CannotForward { steps: usize, available: usize },

    /// The requested checkpoint id does not exist.
    #[error("invalid checkpoint id: {0}")]
    InvalidId(usize),

    /// The persisted store could not be written.
    #[error("checkpoint store error at '{path}': {detail}")]
    Store { path: PathBuf, detail: String },

    /// The underlying repository operation failed.
    #[error(transparent)]
    Git(#[from] GitError),
}

// ---------------------------------------------------------------------------
// Watch errors
// ---------------------------------------------------------------------------

/// Errors from the filesystem change source.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The watch root does not exist.
    #[error("watch path does not exist: {0}")]
    PathMissing(PathBuf),

    /// The change source is already subscribed.
    #[error("file watcher is already running")]
    AlreadyRunning,

    /// The OS notification backend failed.
    #[error("file watcher error: {0}")]
    Notify(#[from] notify::Error),
}

// ---------------------------------------------------------------------------
// Sync coordinator errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the sync coordinator's public operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// `initialize` has not completed successfully.
    #[error("sync engine not initialized, call initialize() first")]
    NotInitialized,

    /// `start` was called twice.
    #[error("sync engine is already running")]
    AlreadyRunning,

    /// `stop` was called while stopped.
    #[error("sync engine is not running")]
    NotRunning,

    /// The poll thread could not be spawned.
    #[error("failed to spawn poll thread: {0}")]
    Spawn(std::io::Error),

    /// Configuration rejected before any sync activity.
    #[error("configuration errors: {0}")]
    ConfigError(#[from] ConfigError),

    /// Underlying repository error.
    #[error("{0}")]
    GitError(#[from] GitError),

    /// Underlying checkpoint error.
    #[error("{0}")]
    LedgerError(#[from] LedgerError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = GitError::RepositoryNotFound("/tmp/repo".into());
        assert_eq!(err.to_string(), "git repository not found at '/tmp/repo'");

        let err = GitError::MergeConflict(vec!["a.txt".into(), "b.txt".into()]);
        assert_eq!(err.to_string(), "merge conflict in 2 file(s): a.txt, b.txt");

        let err = LedgerError::CannotRevert {
            steps: 4,
            available: 2,
        };
        assert_eq!(
            err.to_string(),
            "cannot revert 4 step(s) (only 2 available)"
        );

        let err = ConfigError::InvalidValue {
            field: "sync.interval_secs".into(),
            detail: "must be at least 10".into(),
        };
        assert!(err.to_string().contains("sync.interval_secs"));
    }

    #[test]
    fn test_sync_error_renders_inner_message() {
        let err: SyncError = GitError::StashConflict.into();
        assert!(err.to_string().starts_with("conflict detected after pull"));

        let err: SyncError = LedgerError::InvalidId(9).into();
        assert_eq!(err.to_string(), "invalid checkpoint id: 9");
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let core_err: CoreError = GitError::NotInitialized.into();
        assert!(matches!(core_err, CoreError::Git(_)));

        let core_err: CoreError = LedgerError::Empty.into();
        assert!(matches!(core_err, CoreError::Ledger(_)));
    }
}
