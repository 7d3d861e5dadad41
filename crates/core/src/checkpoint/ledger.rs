//! Position-addressable checkpoint history with undo/redo navigation.
//!
//! The ledger is an ordered list of [`Checkpoint`]s plus a cursor. Recording a
//! checkpoint while the cursor is behind the tail discards everything after
//! the cursor first, like a redo stack. Navigation hard-resets the working
//! tree to the target checkpoint's commit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, Utc};
use tracing::{error, info, instrument};

use super::store::LedgerStore;
use crate::errors::LedgerError;
use crate::git::RepoBackend;
use crate::models::{Checkpoint, HistoryEntry, PositionInfo};

const SAFETY_DESCRIPTION: &str = "Safety checkpoint before revert";

/// Checkpoint history for one working copy.
pub struct CheckpointLedger<R: RepoBackend> {
    backend: Arc<R>,
    checkpoints: Vec<Checkpoint>,
    current: Option<usize>,
    store: LedgerStore,
}

impl<R: RepoBackend> CheckpointLedger<R> {
    /// Load the ledger stored at `store_path`, or start empty.
    pub fn open(backend: Arc<R>, store_path: impl Into<PathBuf>) -> Self {
        let store = LedgerStore::new(store_path);
        let (checkpoints, current) = store.load();
        info!(
            path = %store.path().display(),
            count = checkpoints.len(),
            "checkpoint ledger opened"
        );
        Self {
            backend,
            checkpoints,
            current,
            store,
        }
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Index of the active checkpoint, `None` when the ledger is empty.
    pub fn current_position(&self) -> Option<usize> {
        self.current
    }

    pub fn store_path(&self) -> &Path {
        self.store.path()
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.checkpoints, self.current) {
            error!(error = %e, "failed to save checkpoint history");
        }
    }

    fn steps_forward_available(&self) -> usize {
        match self.current {
            Some(pos) => self.checkpoints.len() - pos - 1,
            None => 0,
        }
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    /// Record the current HEAD. Returns the new checkpoint's id.
    #[instrument(skip(self))]
    pub fn create_checkpoint(&mut self, description: Option<&str>) -> Result<usize, LedgerError> {
        let head = self.backend.head_commit()?.ok_or(LedgerError::NoCommits)?;

        let keep = self.current.map_or(0, |pos| pos + 1);
        self.checkpoints.truncate(keep);

        let id = self.checkpoints.len();
        let description = match description {
            Some(d) if !d.is_empty() => d.to_string(),
            _ => format!("Checkpoint at {}", Local::now().format("%H:%M:%S")),
        };
        self.checkpoints.push(Checkpoint {
            id,
            commit_hash: head.short_hash,
            full_hash: head.full_hash,
            timestamp: Utc::now(),
            description,
            commit_message: head.message,
            author: head.author,
        });
        self.current = Some(id);
        self.persist();

        info!(id, description = %self.checkpoints[id].description, "created checkpoint");
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Navigation
    // -----------------------------------------------------------------------

    /// Move `steps` checkpoints back.
    ///
    /// The pre-revert state is recorded first as a safety checkpoint, which
    /// discards any forward history beyond the cursor. The target is counted
    /// from the cursor as it was before that safety entry was appended.
    #[instrument(skip(self))]
    pub fn revert(&mut self, steps: usize) -> Result<String, LedgerError> {
        let pos = self.current.ok_or(LedgerError::Empty)?;
        if steps > pos {
            return Err(LedgerError::CannotRevert {
                steps,
                available: pos,
            });
        }
        let target = pos - steps;

        self.create_checkpoint(Some(SAFETY_DESCRIPTION))?;
        let checkpoint = self.checkpoints[target].clone();
        self.backend.reset_to_commit(&checkpoint.full_hash, true)?;
        self.current = Some(target);
        self.persist();

        info!(target, description = %checkpoint.description, "reverted");
        Ok(format!("Reverted to: {}", checkpoint.description))
    }

    /// Move `steps` checkpoints forward. No safety checkpoint is recorded,
    /// since one would truncate the entries being navigated to.
    #[instrument(skip(self))]
    pub fn forward(&mut self, steps: usize) -> Result<String, LedgerError> {
        let pos = self.current.ok_or(LedgerError::Empty)?;
        let available = self.steps_forward_available();
        if steps > available {
            return Err(LedgerError::CannotForward { steps, available });
        }
        let target = pos + steps;

        let checkpoint = self.checkpoints[target].clone();
        self.backend.reset_to_commit(&checkpoint.full_hash, true)?;
        self.current = Some(target);
        self.persist();

        info!(target, description = %checkpoint.description, "moved forward");
        Ok(format!("Moved forward to: {}", checkpoint.description))
    }

    /// Jump to checkpoint `id` without truncating anything.
    #[instrument(skip(self))]
    pub fn goto(&mut self, id: usize) -> Result<String, LedgerError> {
        let checkpoint = self
            .checkpoints
            .get(id)
            .cloned()
            .ok_or(LedgerError::InvalidId(id))?;
        self.backend.reset_to_commit(&checkpoint.full_hash, true)?;
        self.current = Some(id);
        self.persist();

        info!(id, description = %checkpoint.description, "moved to checkpoint");
        Ok(format!("Moved to: {}", checkpoint.description))
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Keep only the newest `max` checkpoints, renumbering ids from 0.
    /// Returns the number removed.
    pub fn cleanup_old_checkpoints(&mut self, max: usize) -> usize {
        let len = self.checkpoints.len();
        if len <= max {
            return 0;
        }
        let removed = len - max;
        self.checkpoints.drain(..removed);
        for (i, checkpoint) in self.checkpoints.iter_mut().enumerate() {
            checkpoint.id = i;
        }
        self.current = match (self.checkpoints.is_empty(), self.current) {
            (true, _) => None,
            (false, Some(pos)) => Some(pos.saturating_sub(removed)),
            (false, None) => Some(self.checkpoints.len() - 1),
        };
        self.persist();

        info!(removed, kept = self.checkpoints.len(), "cleaned up old checkpoints");
        removed
    }

    /// Write `{history, current_position, exported_at}` to `path`.
    pub fn export_history(&self, path: &Path) -> Result<String, LedgerError> {
        LedgerStore::export(path, &self.checkpoints, self.current)?;
        Ok(format!("History exported to {}", path.display()))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The newest `max_items` checkpoints, each marked relative to the cursor.
    pub fn get_history_summary(&self, max_items: usize) -> Vec<HistoryEntry> {
        let start = self.checkpoints.len().saturating_sub(max_items);
        let cursor = self.current.map_or(-1, |pos| pos as i64);
        self.checkpoints[start..]
            .iter()
            .enumerate()
            .map(|(offset, checkpoint)| {
                let index = start + offset;
                HistoryEntry {
                    checkpoint: checkpoint.clone(),
                    is_current: self.current == Some(index),
                    relative_position: index as i64 - cursor,
                }
            })
            .collect()
    }

    pub fn get_current_position_info(&self) -> Option<PositionInfo> {
        let pos = self.current?;
        let current = self.checkpoints.get(pos)?;
        let forward = self.steps_forward_available();
        Some(PositionInfo {
            id: current.id,
            description: current.description.clone(),
            timestamp: current.timestamp,
            commit_hash: current.commit_hash.clone(),
            can_revert: pos > 0,
            can_forward: forward > 0,
            steps_back_available: pos,
            steps_forward_available: forward,
        })
    }

    /// Case-insensitive substring search over descriptions and commit messages.
    pub fn search(&self, query: &str) -> Vec<Checkpoint> {
        let needle = query.to_lowercase();
        self.checkpoints
            .iter()
            .filter(|c| {
                c.description.to_lowercase().contains(&needle)
                    || c.commit_message.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect()
    }
}
