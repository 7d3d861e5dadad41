//! Noise filtering for filesystem events.

use std::path::{Component, Path, PathBuf};

/// Directory names whose contents never produce change events.
const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".tidesync",
    ".tidesync-backup",
    "__pycache__",
];

/// File-name suffixes of editor, backup and compiled artifacts.
const EXCLUDED_SUFFIXES: &[&str] = &[".tmp", ".swp", "~", ".bak", ".log", ".pyc"];

/// OS artifacts.
const EXCLUDED_NAMES: &[&str] = &["Thumbs.db", ".DS_Store"];

/// Decides whether a changed path is worth syncing.
///
/// Built-in exclusions always win. When include patterns are configured a
/// path must also match one of them.
#[derive(Debug, Clone)]
pub struct PathFilter {
    root: PathBuf,
    include_patterns: Vec<String>,
}

impl PathFilter {
    pub fn new(root: impl Into<PathBuf>, include_patterns: Vec<String>) -> Self {
        Self {
            root: root.into(),
            include_patterns,
        }
    }

    pub fn include_patterns(&self) -> &[String] {
        &self.include_patterns
    }

    pub fn accepts(&self, path: &Path) -> bool {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);

        let in_excluded_dir = rel.components().any(|c| match c {
            Component::Normal(name) => name
                .to_str()
                .is_some_and(|name| EXCLUDED_DIRS.contains(&name)),
            _ => false,
        });
        if in_excluded_dir {
            return false;
        }

        let Some(name) = rel.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with('.')
            || EXCLUDED_NAMES.contains(&name)
            || EXCLUDED_SUFFIXES.iter().any(|s| name.ends_with(s))
        {
            return false;
        }

        if self.include_patterns.is_empty() {
            return true;
        }
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        self.include_patterns
            .iter()
            .any(|pattern| matches_pattern(pattern, &rel_str, name))
    }
}

/// Patterns without a slash match the file name at any depth; patterns with
/// one match the relative path, anchored at any directory.
fn matches_pattern(pattern: &str, rel_path: &str, name: &str) -> bool {
    let pat = pattern.replace('\\', "/");
    if !pat.contains('/') {
        return glob_match::glob_match(&pat, name);
    }
    glob_match::glob_match(&pat, rel_path)
        || glob_match::glob_match(&format!("**/{pat}"), rel_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(patterns: &[&str]) -> PathFilter {
        PathFilter::new(
            "/work",
            patterns.iter().map(|p| p.to_string()).collect(),
        )
    }

    #[test]
    fn test_no_patterns_accepts_regular_files() {
        let f = filter(&[]);
        assert!(f.accepts(Path::new("/work/src/main.rs")));
        assert!(f.accepts(Path::new("/work/README")));
    }

    #[test]
    fn test_metadata_dirs_excluded() {
        let f = filter(&["**"]);
        assert!(!f.accepts(Path::new("/work/.git/index")));
        assert!(!f.accepts(Path::new("/work/sub/.git/HEAD")));
        assert!(!f.accepts(Path::new("/work/.tidesync/checkpoints.json")));
        assert!(!f.accepts(Path::new("/work/.tidesync-backup/a.py")));
        assert!(!f.accepts(Path::new("/work/pkg/__pycache__/m.cpython.py")));
    }

    #[test]
    fn test_noise_files_excluded() {
        let f = filter(&[]);
        for p in [
            "/work/.env",
            "/work/a.tmp",
            "/work/a.swp",
            "/work/notes.txt~",
            "/work/a.bak",
            "/work/debug.log",
            "/work/m.pyc",
            "/work/Thumbs.db",
            "/work/dir/.DS_Store",
        ] {
            assert!(!f.accepts(Path::new(p)), "{p} should be excluded");
        }
    }

    #[test]
    fn test_include_patterns() {
        let f = filter(&["*.py", "docs/*.md"]);
        assert!(f.accepts(Path::new("/work/app.py")));
        assert!(f.accepts(Path::new("/work/deep/nested/app.py")));
        assert!(f.accepts(Path::new("/work/docs/guide.md")));
        assert!(f.accepts(Path::new("/work/site/docs/guide.md")));
        assert!(!f.accepts(Path::new("/work/README.md")));
        assert!(!f.accepts(Path::new("/work/app.js")));
    }

    #[test]
    fn test_exclusions_beat_include_patterns() {
        let f = filter(&["*.log", "*.py"]);
        assert!(!f.accepts(Path::new("/work/server.log")));
        assert!(!f.accepts(Path::new("/work/.git/hooks/pre-commit.py")));
    }
}
