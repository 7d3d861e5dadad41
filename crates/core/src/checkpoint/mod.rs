//! Checkpoint history: an undo/redo-style ledger of synchronized states.

pub mod ledger;
pub mod store;

pub use ledger::CheckpointLedger;
pub use store::LedgerStore;
