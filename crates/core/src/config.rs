//! TOML-based configuration for tidesync.
//!
//! Secrets (the push/fetch token) are stored as `_env` fields that reference
//! environment variable names. The actual values are resolved at runtime via
//! [`SyncConfig::resolve_env_vars`].

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::git::STATE_DIR;

/// Lowest accepted remote poll interval.
pub const MIN_SYNC_INTERVAL_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Remote repository and local working copy.
    pub repository: RepositoryConfig,

    /// Commit identity used for automatic commits.
    #[serde(default)]
    pub author: AuthorConfig,

    /// Pull/push behaviour.
    #[serde(default)]
    pub sync: SyncOptions,

    /// Filesystem watch settings.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Checkpoint history settings.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Daemon process settings.
    #[serde(default)]
    pub daemon: DaemonConfig,
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Remote repository and local working copy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Clone/fetch/push URL of the remote repository.
    pub url: String,

    /// Branch kept in sync (default `main`).
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Local working directory.
    pub local_path: PathBuf,

    /// Remote name (default `origin`).
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Environment variable holding an access token for HTTPS remotes.
    #[serde(default)]
    pub token_env: Option<String>,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_branch() -> String {
    "main".into()
}

fn default_remote() -> String {
    "origin".into()
}

// ---------------------------------------------------------------------------
// Author
// ---------------------------------------------------------------------------

/// Identity for automatic commits. When unset, the repository's own
/// `user.name` / `user.email` are used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

// ---------------------------------------------------------------------------
// Sync options
// ---------------------------------------------------------------------------

/// How merge conflicts left by a pull are handled.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Leave the markers in place and report them.
    #[default]
    Manual,
    /// Keep the local side of every block.
    Ours,
    /// Keep the remote side of every block.
    Theirs,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Ours => write!(f, "ours"),
            Self::Theirs => write!(f, "theirs"),
        }
    }
}

/// Pull/push behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Pull remote advances automatically.
    #[serde(default = "default_true")]
    pub auto_pull: bool,

    /// Commit and push local edits automatically.
    #[serde(default = "default_true")]
    pub auto_push: bool,

    /// Seconds between remote checks (minimum 10).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Prefix of automatic commit messages.
    #[serde(default = "default_commit_prefix")]
    pub commit_prefix: String,

    /// Conflict handling after a pull.
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,

    /// Quiet period after the last local edit before a push batch fires.
    #[serde(default = "default_debounce")]
    pub debounce_secs: f64,

    /// Consecutive pull failures before the backoff delay doubles.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay after failed pulls.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Upper bound for the backoff delay.
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_interval() -> u64 {
    30
}
fn default_commit_prefix() -> String {
    "[tidesync auto]".into()
}
fn default_debounce() -> f64 {
    2.0
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    30
}
fn default_max_retry_delay() -> u64 {
    300
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            auto_pull: true,
            auto_push: true,
            interval_secs: default_interval(),
            commit_prefix: default_commit_prefix(),
            conflict_strategy: ConflictStrategy::default(),
            debounce_secs: default_debounce(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            max_retry_delay_secs: default_max_retry_delay(),
        }
    }
}

impl SyncOptions {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs_f64(self.debounce_secs)
    }
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

/// Filesystem watch settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Glob patterns a changed file must match. Empty means every file that
    /// is not excluded by the built-in noise filter.
    #[serde(default)]
    pub include_patterns: Vec<String>,
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Checkpoint ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Maximum number of checkpoints kept.
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Accepted for compatibility with older config files; not enforced.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,

    /// Ledger file. Relative paths are resolved against the working copy.
    /// Inside the working copy it must live under `.tidesync/` or `.git/`,
    /// otherwise every checkpoint write would be synced as a local edit.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

/// `path` relative to `root` after resolving `.` and `..` lexically, or
/// `None` when it lies outside `root`.
fn path_within(root: &Path, path: &Path) -> Option<PathBuf> {
    let rel = path.strip_prefix(root).ok()?;
    let mut normalized = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(normalized)
}

fn default_max_history() -> usize {
    100
}
fn default_checkpoint_interval() -> u64 {
    300
}
fn default_store_path() -> PathBuf {
    PathBuf::from(".tidesync/checkpoints.json")
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            checkpoint_interval_secs: default_checkpoint_interval(),
            store_path: default_store_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for daily-rolling log files. Console only when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl SyncConfig {
    /// Load a [`SyncConfig`] from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: SyncConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(env_name) = self.repository.token_env.as_deref() {
            self.repository.token = resolve_optional_env(env_name, "repository.token_env");
        }
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repository.url.trim().is_empty() {
            return Err(invalid("repository.url", "repository URL is not set"));
        }
        if self.repository.local_path.as_os_str().is_empty() {
            return Err(invalid(
                "repository.local_path",
                "local code directory is not set",
            ));
        }
        if self.repository.branch.trim().is_empty() {
            return Err(invalid("repository.branch", "branch must not be empty"));
        }
        if self.sync.interval_secs < MIN_SYNC_INTERVAL_SECS {
            return Err(invalid(
                "sync.interval_secs",
                &format!("sync interval must be at least {MIN_SYNC_INTERVAL_SECS} seconds"),
            ));
        }
        if self.sync.debounce_secs <= 0.0 || !self.sync.debounce_secs.is_finite() {
            return Err(invalid(
                "sync.debounce_secs",
                "debounce must be a positive number of seconds",
            ));
        }
        if self.sync.max_retries == 0 {
            return Err(invalid("sync.max_retries", "must be > 0"));
        }
        if self.sync.retry_delay_secs == 0 {
            return Err(invalid("sync.retry_delay_secs", "must be > 0"));
        }
        if self.sync.max_retry_delay_secs < self.sync.retry_delay_secs {
            return Err(invalid(
                "sync.max_retry_delay_secs",
                "must not be smaller than sync.retry_delay_secs",
            ));
        }
        if self.history.max_history == 0 {
            return Err(invalid("history.max_history", "must be > 0"));
        }
        if let Some(rel) = path_within(&self.repository.local_path, &self.history_store_path()) {
            let private = rel.components().next().is_some_and(|first| {
                let first = first.as_os_str();
                first == STATE_DIR || first == ".git"
            });
            if !private {
                return Err(invalid(
                    "history.store_path",
                    &format!("a ledger inside the working copy must be under {STATE_DIR}/"),
                ));
            }
        }
        for pattern in &self.watch.include_patterns {
            if pattern.trim().is_empty() {
                return Err(invalid(
                    "watch.include_patterns",
                    "patterns must not be empty strings",
                ));
            }
        }
        if self.history.checkpoint_interval_secs != default_checkpoint_interval() {
            warn!(
                value = self.history.checkpoint_interval_secs,
                "history.checkpoint_interval_secs is not enforced"
            );
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Absolute location of the checkpoint ledger file.
    pub fn history_store_path(&self) -> PathBuf {
        if self.history.store_path.is_absolute() {
            self.history.store_path.clone()
        } else {
            self.repository.local_path.join(&self.history.store_path)
        }
    }

    /// Generate a default TOML config template string.
    pub fn default_template() -> &'static str {
        r#"# tidesync configuration

[repository]
url = "https://github.com/owner/project.git"
branch = "main"
local_path = "/home/you/code/project"
# remote = "origin"
# token_env = "TIDESYNC_TOKEN"

[author]
# name = "Your Name"
# email = "you@example.com"

[sync]
auto_pull = true
auto_push = true
interval_secs = 30
commit_prefix = "[tidesync auto]"
conflict_strategy = "manual"   # manual | ours | theirs
debounce_secs = 2.0
max_retries = 3
retry_delay_secs = 30
max_retry_delay_secs = 300

[watch]
include_patterns = ["*.py", "*.js", "*.ts", "*.rs", "*.md", "*.json"]

[history]
max_history = 100
# store_path = ".tidesync/checkpoints.json"

[daemon]
log_level = "info"
# log_dir = "/var/log/tidesync"
"#
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}

/// Try to read an environment variable by name.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
