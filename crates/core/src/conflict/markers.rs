//! Line-level parsing of textual merge-conflict blocks.
//!
//! A block is a `<<<<<<<` line, the "ours" lines, an optional diff3 base
//! section introduced by `|||||||`, a `=======` line, the "theirs" lines and a
//! closing `>>>>>>>` line. Lines are kept with their terminators so a
//! rewrite reproduces untouched content byte for byte.

use serde::{Deserialize, Serialize};

pub const START_MARKER: &str = "<<<<<<<";
pub const BASE_MARKER: &str = "|||||||";
pub const MIDDLE_MARKER: &str = "=======";
pub const END_MARKER: &str = ">>>>>>>";

/// Which section of a conflict block to keep.
///
/// Sections are positional. After a merge the first section is HEAD and the
/// second is the incoming commit. After a conflicting stash re-apply the
/// first section is the pulled text and the second is the stashed local edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// The first section, between `<<<<<<<` and `=======`.
    Ours,
    /// The second section, between `=======` and `>>>>>>>`.
    Theirs,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Ours => Self::Theirs,
            Self::Theirs => Self::Ours,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ours => write!(f, "ours"),
            Self::Theirs => write!(f, "theirs"),
        }
    }
}

/// One complete conflict block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictBlock {
    /// 1-based line number of the start marker.
    pub start_line: usize,
    /// 1-based line number of the end marker.
    pub end_line: usize,
    pub ours: Vec<String>,
    pub theirs: Vec<String>,
}

impl ConflictBlock {
    fn side(&self, side: Side) -> &[String] {
        match side {
            Side::Ours => &self.ours,
            Side::Theirs => &self.theirs,
        }
    }
}

fn is_start(line: &str) -> bool {
    line.starts_with(START_MARKER)
}

fn is_base(line: &str) -> bool {
    line.starts_with(BASE_MARKER)
}

fn is_middle(line: &str) -> bool {
    line.trim_end_matches(['\r', '\n']) == MIDDLE_MARKER
}

fn is_end(line: &str) -> bool {
    line.starts_with(END_MARKER)
}

enum State {
    Outside,
    Ours { start: usize, ours: Vec<String> },
    Base { start: usize, ours: Vec<String> },
    Theirs { start: usize, ours: Vec<String>, theirs: Vec<String> },
}

/// Parse every complete block in `text`. Unterminated blocks are skipped.
pub fn parse(text: &str) -> Vec<ConflictBlock> {
    let mut blocks = Vec::new();
    let mut state = State::Outside;

    for (idx, line) in text.split_inclusive('\n').enumerate() {
        let line_no = idx + 1;
        state = match state {
            State::Outside if is_start(line) => State::Ours {
                start: line_no,
                ours: Vec::new(),
            },
            State::Outside => State::Outside,
            // A second start marker before the middle one: restart there.
            State::Ours { .. } if is_start(line) => State::Ours {
                start: line_no,
                ours: Vec::new(),
            },
            State::Ours { start, ours } if is_base(line) => State::Base { start, ours },
            State::Ours { start, ours } if is_middle(line) => State::Theirs {
                start,
                ours,
                theirs: Vec::new(),
            },
            State::Ours { start, mut ours } => {
                ours.push(line.to_string());
                State::Ours { start, ours }
            }
            State::Base { start, ours } if is_middle(line) => State::Theirs {
                start,
                ours,
                theirs: Vec::new(),
            },
            base @ State::Base { .. } => base,
            State::Theirs { start, ours, theirs } if is_end(line) => {
                blocks.push(ConflictBlock {
                    start_line: start,
                    end_line: line_no,
                    ours,
                    theirs,
                });
                State::Outside
            }
            State::Theirs {
                start,
                ours,
                mut theirs,
            } => {
                theirs.push(line.to_string());
                State::Theirs { start, ours, theirs }
            }
        };
    }
    blocks
}

/// Whether `text` contains at least one complete block.
pub fn has_markers(text: &str) -> bool {
    !parse(text).is_empty()
}

/// Replace every complete block with the chosen side. Returns the rewritten
/// text and the number of blocks resolved.
pub fn resolve(text: &str, side: Side) -> (String, usize) {
    let blocks = parse(text);
    if blocks.is_empty() {
        return (text.to_string(), 0);
    }

    let mut out = String::with_capacity(text.len());
    let mut next = 0;
    for (idx, line) in text.split_inclusive('\n').enumerate() {
        let line_no = idx + 1;
        let Some(block) = blocks.get(next) else {
            out.push_str(line);
            continue;
        };
        if line_no == block.start_line {
            for kept in block.side(side) {
                out.push_str(kept);
            }
        } else if line_no > block.start_line && line_no <= block.end_line {
            if line_no == block.end_line {
                next += 1;
            }
        } else {
            out.push_str(line);
        }
    }
    (out, blocks.len())
}
