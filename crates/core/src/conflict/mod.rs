//! Detection and mechanical resolution of textual merge-conflict markers.

pub mod markers;
pub mod resolver;

pub use markers::{ConflictBlock, Side};
pub use resolver::{BlockSummary, ConflictResolver, ConflictSummary};
