//! File-level conflict detection, resolution and reporting.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::markers::{self, ConflictBlock, Side};
use crate::errors::ConflictError;

/// Line range and size of one block in a [`ConflictSummary`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockSummary {
    pub start_line: usize,
    pub end_line: usize,
    pub ours_lines: usize,
    pub theirs_lines: usize,
}

/// Per-file overview of its conflict blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictSummary {
    pub file: PathBuf,
    pub has_conflicts: bool,
    pub conflict_count: usize,
    pub blocks: Vec<BlockSummary>,
}

/// Stateless conflict-marker operations on files.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Whether the file holds at least one complete conflict block.
    pub fn has_conflicts(path: &Path) -> Result<bool, ConflictError> {
        Ok(markers::has_markers(&read_text(path)?))
    }

    /// All complete conflict blocks in the file.
    pub fn parse(path: &Path) -> Result<Vec<ConflictBlock>, ConflictError> {
        Ok(markers::parse(&read_text(path)?))
    }

    /// Rewrite the file keeping only `side` of every block.
    ///
    /// Returns the number of blocks resolved. A file without blocks is not
    /// touched.
    pub fn resolve(path: &Path, side: Side) -> Result<usize, ConflictError> {
        let text = read_text(path)?;
        let (resolved, count) = markers::resolve(&text, side);
        if count == 0 {
            debug!(path = %path.display(), "no conflicts to resolve");
            return Ok(0);
        }
        std::fs::write(path, resolved).map_err(|source| ConflictError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), %side, count, "resolved conflicts");
        Ok(count)
    }

    pub fn summary(path: &Path) -> Result<ConflictSummary, ConflictError> {
        let blocks: Vec<BlockSummary> = Self::parse(path)?
            .iter()
            .map(|b| BlockSummary {
                start_line: b.start_line,
                end_line: b.end_line,
                ours_lines: b.ours.len(),
                theirs_lines: b.theirs.len(),
            })
            .collect();
        Ok(ConflictSummary {
            file: path.to_path_buf(),
            has_conflicts: !blocks.is_empty(),
            conflict_count: blocks.len(),
            blocks,
        })
    }

    /// Recursively find conflicted text files under `dir`, skipping `.git`.
    pub fn scan_directory(dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let walker = WalkDir::new(dir)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git");
        for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            // Binary or unreadable files cannot hold text markers.
            if let Ok(true) = Self::has_conflicts(entry.path()) {
                warn!(path = %entry.path().display(), "conflict detected");
                found.push(entry.into_path());
            }
        }
        found
    }

    /// Human-readable report of the blocks in each file.
    pub fn create_report(files: &[PathBuf]) -> String {
        if files.is_empty() {
            return "No conflicts detected.".to_string();
        }

        let mut report = format!("Merge Conflicts Detected ({} file(s))\n", files.len());
        report.push_str(&"=".repeat(60));
        report.push_str("\n\n");

        for file in files {
            let _ = writeln!(report, "File: {}", file.display());
            match Self::summary(file) {
                Ok(summary) => {
                    let _ = writeln!(report, "  Conflicts: {}", summary.conflict_count);
                    for (i, block) in summary.blocks.iter().enumerate() {
                        let _ = writeln!(
                            report,
                            "    {}. Lines {}-{} (Ours: {} lines, Theirs: {} lines)",
                            i + 1,
                            block.start_line,
                            block.end_line,
                            block.ours_lines,
                            block.theirs_lines
                        );
                    }
                }
                Err(e) => {
                    let _ = writeln!(report, "  Unreadable: {e}");
                }
            }
            report.push('\n');
        }

        report.push_str("Resolution Options:\n");
        report.push_str("1. Manually edit files to resolve conflicts\n");
        report.push_str("2. Use 'ours' strategy (keep local changes)\n");
        report.push_str("3. Use 'theirs' strategy (keep remote changes)\n");
        report.push_str("4. Revert to a previous checkpoint\n");
        report
    }
}

fn read_text(path: &Path) -> Result<String, ConflictError> {
    let bytes = std::fs::read(path).map_err(|source| ConflictError::IoError {
        path: path.to_path_buf(),
        source,
    })?;
    String::from_utf8(bytes).map_err(|_| ConflictError::NotText(path.to_path_buf()))
}
