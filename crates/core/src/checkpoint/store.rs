//! JSON persistence for the checkpoint ledger.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::LedgerError;
use crate::models::Checkpoint;

/// On-disk layout: the checkpoints plus the cursor.
#[derive(Debug, Serialize, Deserialize)]
struct LedgerDocument {
    current_position: Option<usize>,
    checkpoints: Vec<Checkpoint>,
}

/// Older stores hold a bare array and no cursor.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredLedger {
    Document(LedgerDocument),
    Legacy(Vec<Checkpoint>),
}

#[derive(Serialize)]
struct ExportDocument<'a> {
    history: &'a [Checkpoint],
    current_position: Option<usize>,
    exported_at: String,
}

/// Loads and saves one ledger file.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the ledger. A missing, unreadable or corrupt file yields an empty
    /// ledger. The returned cursor is always valid for the returned entries.
    pub fn load(&self) -> (Vec<Checkpoint>, Option<usize>) {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint store yet");
                return (Vec::new(), None);
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "checkpoint store unreadable, starting empty");
                return (Vec::new(), None);
            }
        };

        let (checkpoints, cursor) = match serde_json::from_str::<StoredLedger>(&contents) {
            Ok(StoredLedger::Document(doc)) => (doc.checkpoints, doc.current_position),
            Ok(StoredLedger::Legacy(checkpoints)) => {
                let tail = checkpoints.len().checked_sub(1);
                (checkpoints, tail)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "checkpoint store corrupt, starting empty");
                return (Vec::new(), None);
            }
        };

        let cursor = match (checkpoints.len(), cursor) {
            (0, _) => None,
            (len, None) => Some(len - 1),
            (len, Some(pos)) => Some(pos.min(len - 1)),
        };
        debug!(count = checkpoints.len(), ?cursor, "checkpoint store loaded");
        (checkpoints, cursor)
    }

    /// Write the ledger atomically (temp file + rename).
    pub fn save(&self, checkpoints: &[Checkpoint], cursor: Option<usize>) -> Result<(), LedgerError> {
        let doc = LedgerDocument {
            current_position: cursor,
            checkpoints: checkpoints.to_vec(),
        };
        write_json(&self.path, &doc)
    }

    /// Write a standalone export of the ledger to `path`.
    pub fn export(
        path: &Path,
        checkpoints: &[Checkpoint],
        cursor: Option<usize>,
    ) -> Result<(), LedgerError> {
        let doc = ExportDocument {
            history: checkpoints,
            current_position: cursor,
            exported_at: Utc::now().to_rfc3339(),
        };
        write_json(path, &doc)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), LedgerError> {
    let store_err = |detail: String| LedgerError::Store {
        path: path.to_path_buf(),
        detail,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| store_err(e.to_string()))?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|e| store_err(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| store_err(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| store_err(e.to_string()))?;
    Ok(())
}
