//! git2-backed implementation of [`RepoBackend`].

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::DateTime;
use git2::{
    build::CheckoutBuilder, BranchType, Commit, Cred, FetchOptions, IndexAddOption, PushOptions,
    RemoteCallbacks, Repository, RepositoryState, ResetType, Signature, Sort, StashFlags,
    StatusOptions,
};
use tracing::{debug, info, instrument, warn};

use super::backend::RepoBackend;
use crate::config::SyncConfig;
use crate::errors::GitError;
use crate::models::{BranchInfo, CommitInfo, CommitOutcome, RepoStatus};

/// Directory inside the working copy that holds tidesync's own state. It is
/// added to `.git/info/exclude` so it is never committed or stashed.
pub const STATE_DIR: &str = ".tidesync";

const FALLBACK_NAME: &str = "tidesync";
const FALLBACK_EMAIL: &str = "tidesync@localhost";

/// Connection and identity settings for a [`RemoteSync`].
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub url: String,
    pub local_path: PathBuf,
    pub branch: String,
    pub remote: String,
    pub token: Option<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
}

impl RemoteSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            url: config.repository.url.clone(),
            local_path: config.repository.local_path.clone(),
            branch: config.repository.branch.clone(),
            remote: config.repository.remote.clone(),
            token: config.repository.token.clone(),
            author_name: config.author.name.clone(),
            author_email: config.author.email.clone(),
        }
    }
}

/// An opened working copy. Exists only after a successful `initialize`.
pub struct RepositoryHandle {
    pub url: String,
    pub path: PathBuf,
    pub branch: String,
    repo: Repository,
}

enum RepoState {
    Uninitialized,
    Initialized(RepositoryHandle),
}

/// Wraps every remote-repository operation on one working copy.
pub struct RemoteSync {
    settings: RemoteSettings,
    state: Mutex<RepoState>,
}

impl RemoteSync {
    pub fn new(settings: RemoteSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(RepoState::Uninitialized),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(RemoteSettings::from_config(config))
    }

    pub fn settings(&self) -> &RemoteSettings {
        &self.settings
    }

    fn with_repo<T>(
        &self,
        f: impl FnOnce(&mut RepositoryHandle) -> Result<T, GitError>,
    ) -> Result<T, GitError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            RepoState::Uninitialized => Err(GitError::NotInitialized),
            RepoState::Initialized(handle) => f(handle),
        }
    }

    // -----------------------------------------------------------------------
    // Remote plumbing
    // -----------------------------------------------------------------------

    fn callbacks(&self) -> RemoteCallbacks<'static> {
        let mut callbacks = RemoteCallbacks::new();
        if let Some(tok) = self.settings.token.clone() {
            callbacks.credentials(move |_url, _username, _allowed| {
                Cred::userpass_plaintext("x-access-token", &tok)
            });
        }
        callbacks
    }

    fn fetch_options(&self) -> FetchOptions<'static> {
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(self.callbacks());
        fetch_opts
    }

    fn fetch(&self, repo: &Repository) -> Result<(), GitError> {
        let mut remote = repo.find_remote(&self.settings.remote)?;
        remote.fetch(&[] as &[&str], Some(&mut self.fetch_options()), None)?;
        debug!(remote = %self.settings.remote, "fetch completed");
        Ok(())
    }

    fn local_ref(&self) -> String {
        format!("refs/heads/{}", self.settings.branch)
    }

    fn tracking_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.settings.remote, self.settings.branch)
    }

    fn signature(&self, repo: &Repository) -> Result<Signature<'static>, GitError> {
        if let (Some(name), Some(email)) = (&self.settings.author_name, &self.settings.author_email)
        {
            return Ok(Signature::now(name, email)?);
        }
        match repo.signature() {
            Ok(sig) => Ok(sig),
            Err(_) => Ok(Signature::now(FALLBACK_NAME, FALLBACK_EMAIL)?),
        }
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    fn open_or_clone(&self) -> Result<Repository, GitError> {
        let path = &self.settings.local_path;
        if path.join(".git").exists() {
            info!(path = %path.display(), "opening existing repository");
            let repo = Repository::open(path)
                .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
            self.fetch(&repo)?;
            return Ok(repo);
        }

        info!(url = %self.settings.url, path = %path.display(), "cloning repository");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut builder = git2::build::RepoBuilder::new();
        builder.fetch_options(self.fetch_options());
        let repo = builder.clone(&self.settings.url, path)?;

        self.fetch(&repo)?;
        create_tracking_branches(&repo, &self.settings.remote)?;
        checkout_branch(&repo, &self.settings.branch)?;
        info!("clone completed");
        Ok(repo)
    }

    // -----------------------------------------------------------------------
    // Extras beyond the backend trait
    // -----------------------------------------------------------------------

    /// Up to `max` commits reachable from HEAD, newest first.
    pub fn commit_history(&self, max: usize) -> Result<Vec<CommitInfo>, GitError> {
        self.with_repo(|h| {
            let repo = &h.repo;
            if repo.head().is_err() {
                return Ok(Vec::new());
            }
            let mut revwalk = repo.revwalk()?;
            revwalk.push_head()?;
            revwalk.set_sorting(Sort::TIME)?;
            let mut commits = Vec::new();
            for oid in revwalk.take(max) {
                let commit = repo.find_commit(oid?)?;
                commits.push(commit_info(&commit));
            }
            Ok(commits)
        })
    }

    /// Local and remote-tracking branch names.
    pub fn branches(&self) -> Result<BranchInfo, GitError> {
        self.with_repo(|h| {
            let repo = &h.repo;
            let mut info = BranchInfo {
                current: repo
                    .head()
                    .ok()
                    .and_then(|head| head.shorthand().map(str::to_string)),
                ..Default::default()
            };
            for branch_result in repo.branches(None)? {
                let (branch, kind) = branch_result?;
                let Some(name) = branch.name()? else { continue };
                match kind {
                    BranchType::Local => info.local.push(name.to_string()),
                    BranchType::Remote => info.remote.push(name.to_string()),
                }
            }
            Ok(info)
        })
    }

    fn pull_inner(&self, h: &mut RepositoryHandle) -> Result<String, GitError> {
        let dirty = !changed_paths(&h.repo)?.is_empty();
        let stashed = if dirty && h.repo.head().is_ok() {
            let sig = self.signature(&h.repo)?;
            h.repo
                .stash_save(&sig, "tidesync auto-stash", Some(StashFlags::INCLUDE_UNTRACKED))?;
            info!("stashed local changes before pull");
            true
        } else {
            false
        };

        let message = match self.merge_remote(&h.repo) {
            Ok(message) => message,
            Err(e) => {
                if stashed {
                    warn!("pull failed, local changes remain in the stash");
                }
                return Err(e);
            }
        };

        if stashed {
            // Apply and drop separately: `stash_pop` drops the entry even when
            // the apply leaves conflicts behind.
            let applied = h.repo.stash_apply(0, None);
            let conflicted = h.repo.index()?.has_conflicts();
            if let Err(e) = applied {
                warn!(error = %e, "could not re-apply stashed changes, stash kept");
                return Err(GitError::StashConflict);
            }
            if conflicted {
                warn!("re-applying stashed changes conflicted with pulled content, stash kept");
                return Err(GitError::StashConflict);
            }
            h.repo.stash_drop(0)?;
            debug!("restored stashed changes");
        }
        Ok(message)
    }

    fn merge_remote(&self, repo: &Repository) -> Result<String, GitError> {
        self.fetch(repo)?;

        let Ok(fetch_ref) = repo.find_reference(&self.tracking_ref()) else {
            debug!("remote branch does not exist yet");
            return Ok("Already up to date".into());
        };
        let their_commit = fetch_ref.peel_to_commit()?;
        let annotated = repo.reference_to_annotated_commit(&fetch_ref)?;
        let (analysis, _) = repo.merge_analysis(&[&annotated])?;
        let short = short_hash(&their_commit.id().to_string());

        if analysis.is_up_to_date() {
            return Ok("Already up to date".into());
        }

        if analysis.is_unborn() || analysis.is_fast_forward() {
            let local_ref = self.local_ref();
            match repo.find_reference(&local_ref) {
                Ok(mut reference) => {
                    reference.set_target(their_commit.id(), "tidesync: fast-forward pull")?;
                }
                Err(_) => {
                    repo.reference(&local_ref, their_commit.id(), true, "tidesync: initial pull")?;
                }
            }
            repo.set_head(&local_ref)?;
            repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
            info!(head = %short, "fast-forward pull completed");
            return Ok(format!("Fast-forwarded to {short}"));
        }

        repo.merge(&[&annotated], None, None)?;
        let mut index = repo.index()?;
        if index.has_conflicts() {
            let files = conflicted_paths(&index)?;
            warn!(count = files.len(), "pull produced merge conflicts");
            return Err(GitError::MergeConflict(files));
        }

        let tree = repo.find_tree(index.write_tree()?)?;
        let head_commit = repo.head()?.peel_to_commit()?;
        let sig = self.signature(repo)?;
        let message = format!(
            "Merge {}/{} into {}",
            self.settings.remote, self.settings.branch, self.settings.branch
        );
        let oid = repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &message,
            &tree,
            &[&head_commit, &their_commit],
        )?;
        repo.cleanup_state()?;
        info!(sha = %oid, "merge pull completed");
        Ok(format!("Merged {short}"))
    }

    fn commit_inner(
        &self,
        h: &mut RepositoryHandle,
        files: Option<&[PathBuf]>,
        message: &str,
    ) -> Result<CommitOutcome, GitError> {
        let merging = h.repo.state() == RepositoryState::Merge;
        let mut merge_heads = Vec::new();
        if merging {
            h.repo.mergehead_foreach(|oid| {
                merge_heads.push(*oid);
                true
            })?;
        }

        let repo = &h.repo;
        let mut index = repo.index()?;
        match files {
            Some(files) => {
                for file in files {
                    let Some(rel) = relative_to(&h.path, file) else {
                        warn!(path = %file.display(), "ignoring path outside working copy");
                        continue;
                    };
                    if repo.status_should_ignore(&rel)? {
                        continue;
                    }
                    if h.path.join(&rel).exists() {
                        index.add_path(&rel)?;
                    } else {
                        index.remove_path(&rel)?;
                    }
                }
            }
            None => {
                index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
                index.update_all(["*"].iter(), None)?;
            }
        }
        index.write()?;

        if index.has_conflicts() {
            return Err(GitError::MergeConflict(conflicted_paths(&index)?));
        }

        let tree_oid = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        let unchanged = match &parent {
            Some(p) => p.tree_id() == tree_oid,
            None => index.is_empty(),
        };
        if unchanged && !merging {
            debug!("nothing to commit");
            return Ok(CommitOutcome::NoChanges);
        }

        let tree = repo.find_tree(tree_oid)?;
        let sig = self.signature(repo)?;
        let mut parents: Vec<Commit<'_>> = parent.into_iter().collect();
        for oid in &merge_heads {
            parents.push(repo.find_commit(*oid)?);
        }
        let parent_refs: Vec<&Commit<'_>> = parents.iter().collect();
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)?;
        if merging {
            repo.cleanup_state()?;
        }

        let short = short_hash(&oid.to_string());
        info!(sha = %short, "created commit");
        Ok(CommitOutcome::Committed { short_hash: short })
    }

    fn push_inner(&self, repo: &Repository) -> Result<String, GitError> {
        let branch = &self.settings.branch;
        let Ok(local) = repo.refname_to_id(&self.local_ref()) else {
            return Ok("No commits to push".into());
        };
        if let Ok(remote_oid) = repo.refname_to_id(&self.tracking_ref()) {
            let (ahead, _) = repo.graph_ahead_behind(local, remote_oid)?;
            if ahead == 0 {
                debug!("no commits to push");
                return Ok("No commits to push".into());
            }
        }

        info!(remote = %self.settings.remote, branch = %branch, "pushing");
        let mut remote = repo.find_remote(&self.settings.remote)?;
        let mut callbacks = self.callbacks();
        let push_error = Arc::new(Mutex::new(None::<String>));
        let push_error_clone = push_error.clone();
        callbacks.push_update_reference(move |refname, status| {
            if let Some(msg) = status {
                warn!(refname, msg, "push rejected");
                *push_error_clone.lock().unwrap_or_else(|e| e.into_inner()) = Some(msg.to_string());
            }
            Ok(())
        });
        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote.push(&[&refspec], Some(&mut push_opts))?;

        if let Some(detail) = push_error.lock().unwrap_or_else(|e| e.into_inner()).take() {
            return Err(GitError::PushRejected {
                branch: branch.clone(),
                detail,
            });
        }
        info!("push completed");
        Ok(format!("Pushed {}", short_hash(&local.to_string())))
    }

    fn remote_ahead(&self, repo: &Repository) -> Result<usize, GitError> {
        self.fetch(repo)?;
        let Ok(remote_oid) = repo.refname_to_id(&self.tracking_ref()) else {
            return Ok(0);
        };
        match repo.refname_to_id(&self.local_ref()) {
            Ok(local) => Ok(repo.graph_ahead_behind(local, remote_oid)?.1),
            Err(_) => {
                let mut revwalk = repo.revwalk()?;
                revwalk.push(remote_oid)?;
                Ok(revwalk.count())
            }
        }
    }
}

impl RepoBackend for RemoteSync {
    #[instrument(skip(self), fields(path = %self.settings.local_path.display()))]
    fn initialize(&self) -> Result<(), GitError> {
        let repo = self.open_or_clone()?;
        exclude_state_dir(&repo)?;
        let handle = RepositoryHandle {
            url: self.settings.url.clone(),
            path: self.settings.local_path.clone(),
            branch: self.settings.branch.clone(),
            repo,
        };
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = RepoState::Initialized(handle);
        info!(branch = %self.settings.branch, "repository initialized");
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(|e| e.into_inner()),
            RepoState::Initialized(_)
        )
    }

    fn status(&self) -> Result<RepoStatus, GitError> {
        self.with_repo(|h| {
            let repo = &h.repo;
            let mut status = RepoStatus::default();
            let mut opts = StatusOptions::new();
            opts.include_untracked(true).recurse_untracked_dirs(true);
            for entry in repo.statuses(Some(&mut opts))?.iter() {
                let flags = entry.status();
                let Some(path) = entry.path() else { continue };
                if flags.is_ignored() {
                    continue;
                }
                if flags == git2::Status::WT_NEW {
                    status.untracked_files.push(path.to_string());
                } else {
                    status.changed_files.push(path.to_string());
                }
            }
            status.is_dirty = !status.changed_files.is_empty() || !status.untracked_files.is_empty();

            if let Ok(head) = repo.head() {
                status.current_branch = head.shorthand().map(str::to_string);
                let commit = head.peel_to_commit()?;
                status.latest_commit = Some(commit_info(&commit));
                let mut revwalk = repo.revwalk()?;
                revwalk.push(commit.id())?;
                status.total_commits = revwalk.count();
            }
            Ok(status)
        })
    }

    fn head_commit(&self) -> Result<Option<CommitInfo>, GitError> {
        self.with_repo(|h| match h.repo.head() {
            Ok(head) => Ok(Some(commit_info(&head.peel_to_commit()?))),
            Err(_) => Ok(None),
        })
    }

    #[instrument(skip(self))]
    fn pull(&self) -> Result<String, GitError> {
        self.with_repo(|h| self.pull_inner(h))
    }

    #[instrument(skip(self, files, message))]
    fn commit(
        &self,
        files: Option<&[PathBuf]>,
        message: &str,
    ) -> Result<CommitOutcome, GitError> {
        self.with_repo(|h| self.commit_inner(h, files, message))
    }

    #[instrument(skip(self))]
    fn push(&self) -> Result<String, GitError> {
        self.with_repo(|h| self.push_inner(&h.repo))
    }

    fn has_remote_changes(&self) -> Result<usize, GitError> {
        self.with_repo(|h| self.remote_ahead(&h.repo))
    }

    fn has_local_changes(&self) -> Result<Vec<String>, GitError> {
        self.with_repo(|h| changed_paths(&h.repo))
    }

    fn has_conflicts(&self) -> Result<Vec<String>, GitError> {
        self.with_repo(|h| conflicted_paths(&h.repo.index()?))
    }

    #[instrument(skip(self))]
    fn reset_to_commit(&self, hash: &str, hard: bool) -> Result<String, GitError> {
        self.with_repo(|h| {
            let target = h
                .repo
                .revparse_single(hash)
                .map_err(|_| GitError::RefNotFound(hash.to_string()))?;
            let kind = if hard { ResetType::Hard } else { ResetType::Soft };
            h.repo.reset(&target, kind, None)?;
            info!(hash, hard, "reset completed");
            Ok(format!("Reset to {hash}"))
        })
    }

    fn workdir(&self) -> &Path {
        &self.settings.local_path
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn short_hash(full: &str) -> String {
    full.chars().take(7).collect()
}

fn commit_info(commit: &Commit<'_>) -> CommitInfo {
    let full_hash = commit.id().to_string();
    CommitInfo {
        short_hash: short_hash(&full_hash),
        message: commit.summary().unwrap_or_default().to_string(),
        author: commit.author().name().unwrap_or_default().to_string(),
        date: DateTime::from_timestamp(commit.time().seconds(), 0).unwrap_or_default(),
        full_hash,
    }
}

fn changed_paths(repo: &Repository) -> Result<Vec<String>, GitError> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(statuses
        .iter()
        .filter(|e| !e.status().is_ignored())
        .filter_map(|e| e.path().map(str::to_string))
        .collect())
}

fn conflicted_paths(index: &git2::Index) -> Result<Vec<String>, GitError> {
    let mut files = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
        if let Some(entry) = entry {
            let path = String::from_utf8_lossy(&entry.path).into_owned();
            if !files.contains(&path) {
                files.push(path);
            }
        }
    }
    Ok(files)
}

fn relative_to(root: &Path, file: &Path) -> Option<PathBuf> {
    if file.is_relative() {
        return Some(file.to_path_buf());
    }
    if let Ok(rel) = file.strip_prefix(root) {
        return Some(rel.to_path_buf());
    }
    let canonical = root.canonicalize().ok()?;
    file.strip_prefix(&canonical).ok().map(Path::to_path_buf)
}

fn create_tracking_branches(repo: &Repository, remote: &str) -> Result<(), GitError> {
    let prefix = format!("{remote}/");
    for branch_result in repo.branches(Some(BranchType::Remote))? {
        let (branch, _) = branch_result?;
        let Some(full_name) = branch.name()?.map(str::to_string) else {
            continue;
        };
        let Some(local_name) = full_name.strip_prefix(&prefix) else {
            continue;
        };
        if local_name == "HEAD" || repo.find_branch(local_name, BranchType::Local).is_ok() {
            continue;
        }
        let commit = branch.get().peel_to_commit()?;
        let mut local = repo.branch(local_name, &commit, false)?;
        local.set_upstream(Some(&full_name))?;
        debug!(branch = local_name, "created tracking branch");
    }
    Ok(())
}

fn checkout_branch(repo: &Repository, branch: &str) -> Result<(), GitError> {
    let refname = format!("refs/heads/{branch}");
    if let Ok(reference) = repo.find_reference(&refname) {
        let target = reference.peel(git2::ObjectType::Commit)?;
        repo.checkout_tree(&target, Some(CheckoutBuilder::new().safe()))?;
    } else {
        warn!(branch, "branch does not exist yet, HEAD will be unborn");
    }
    repo.set_head(&refname)?;
    Ok(())
}

fn exclude_state_dir(repo: &Repository) -> Result<(), GitError> {
    let info_dir = repo.path().join("info");
    let exclude_path = info_dir.join("exclude");
    let line = format!("/{STATE_DIR}/");
    let existing = std::fs::read_to_string(&exclude_path).unwrap_or_default();
    if existing.lines().any(|l| l.trim() == line) {
        return Ok(());
    }
    std::fs::create_dir_all(&info_dir)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&exclude_path)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "{line}")?;
    Ok(())
}
