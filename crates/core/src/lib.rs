//! tidesync core library.
//!
//! This crate keeps a local working copy continuously in step with one branch
//! of a remote git repository: remote sync, filesystem change detection,
//! conflict-marker resolution, the checkpoint ledger, and the coordinator
//! that ties them together.

pub mod checkpoint;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod git;
pub mod models;
pub mod retry;
pub mod sync_engine;
pub mod watcher;

#[cfg(test)]
mod testing;

// Re-exports for convenience.
pub use checkpoint::CheckpointLedger;
pub use config::SyncConfig;
pub use conflict::ConflictResolver;
pub use errors::CoreError;
pub use git::{RemoteSync, RepoBackend};
pub use sync_engine::SyncCoordinator;
pub use watcher::ChangeSource;
