//! Domain model types shared by the sync engine, the checkpoint ledger, and
//! the status snapshots handed to front-ends.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Metadata for a single commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitInfo {
    /// Abbreviated hash (7 hex characters).
    pub short_hash: String,
    pub full_hash: String,
    /// First line of the commit message.
    pub message: String,
    pub author: String,
    pub date: DateTime<Utc>,
}

/// Snapshot of the working copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoStatus {
    pub is_dirty: bool,
    /// Tracked files with staged or unstaged modifications.
    pub changed_files: Vec<String>,
    pub untracked_files: Vec<String>,
    pub current_branch: Option<String>,
    pub latest_commit: Option<CommitInfo>,
    pub total_commits: usize,
}

/// Local and remote-tracking branch names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchInfo {
    pub local: Vec<String>,
    pub remote: Vec<String>,
    pub current: Option<String>,
}

/// Result of a commit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing differed from HEAD; no commit was written.
    NoChanges,
    /// A commit was written.
    Committed { short_hash: String },
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

impl std::fmt::Display for CommitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoChanges => write!(f, "No changes to commit"),
            Self::Committed { short_hash } => write!(f, "Committed: {short_hash}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// A recorded pointer to a commit, usable as a navigation target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    /// Index in the ledger; renumbered when old entries are trimmed.
    pub id: usize,
    pub commit_hash: String,
    pub full_hash: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub commit_message: String,
    pub author: String,
}

/// Accepts RFC 3339 timestamps and, from older stores, naive ISO-8601
/// timestamps which are taken as UTC.
fn deserialize_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(d)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(serde::de::Error::custom)
}

/// Where the ledger cursor currently sits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub id: usize,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub commit_hash: String,
    pub can_revert: bool,
    pub can_forward: bool,
    pub steps_back_available: usize,
    pub steps_forward_available: usize,
}

/// One line of a history listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub checkpoint: Checkpoint,
    pub is_current: bool,
    /// Offset from the cursor: negative is older, positive is newer.
    pub relative_position: i64,
}

// ---------------------------------------------------------------------------
// Sync statistics & status
// ---------------------------------------------------------------------------

/// Monotonic activity counters. Never reset while the process runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncStats {
    pub pulls: u64,
    pub pushes: u64,
    pub conflicts: u64,
    pub errors: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Change-source projection for status displays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherStatus {
    pub running: bool,
    pub paused: bool,
    pub root: PathBuf,
    pub include_patterns: Vec<String>,
    pub debounce_secs: f64,
    pub pending_changes: usize,
}

/// Configuration projection for status displays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub repo_url: String,
    pub local_dir: PathBuf,
    pub branch: String,
    pub auto_pull: bool,
    pub auto_push: bool,
    pub interval_secs: u64,
}

/// Structured snapshot returned by `SyncCoordinator::get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub running: bool,
    pub initialized: bool,
    pub stats: SyncStats,
    pub repo: Option<RepoStatus>,
    pub watcher: Option<WatcherStatus>,
    pub checkpoint: Option<PositionInfo>,
    pub config: ConfigSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_outcome_display() {
        assert_eq!(CommitOutcome::NoChanges.to_string(), "No changes to commit");
        let done = CommitOutcome::Committed {
            short_hash: "a1b2c3d".into(),
        };
        assert!(done.is_committed());
        assert_eq!(done.to_string(), "Committed: a1b2c3d");
    }

    #[test]
    fn test_checkpoint_accepts_naive_timestamp() {
        let json = r#"{"id": 0, "commit_hash": "a1b2c3d", "full_hash": "a1b2c3d4",
            "timestamp": "2024-03-01T10:15:00.5", "description": "d",
            "commit_message": "m", "author": "dev"}"#;
        let cp: Checkpoint = serde_json::from_str(json).unwrap();
        assert_eq!(cp.timestamp.to_rfc3339(), "2024-03-01T10:15:00.500+00:00");
    }

    #[test]
    fn test_history_entry_flattens_checkpoint() {
        let entry = HistoryEntry {
            checkpoint: Checkpoint {
                id: 4,
                commit_hash: "a1b2c3d".into(),
                full_hash: "a1b2c3d4".into(),
                timestamp: Utc::now(),
                description: "Pulled 2 commits".into(),
                commit_message: "merge".into(),
                author: "dev".into(),
            },
            is_current: true,
            relative_position: 0,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["id"], 4);
        assert_eq!(json["is_current"], true);
        assert_eq!(json["commit_hash"], "a1b2c3d");
    }
}
