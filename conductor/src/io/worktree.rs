//! Per-task git worktrees.
//!
//! Each task gets `<repo>/<worktree_dir>/<task_id>` on branch `task/<task_id>`.
//! A worktree is owned by exactly one task; the manager only tracks whether it
//! is currently leased so it cannot be removed under a running worker.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::errors::OrchestratorError;
use crate::core::types::is_safe_id;
use crate::io::git::Git;

pub const BRANCH_PREFIX: &str = "task/";

pub fn branch_name(task_id: &str) -> String {
    format!("{BRANCH_PREFIX}{task_id}")
}

/// One worktree known to the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeInfo {
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub busy: bool,
}

pub struct WorktreeManager {
    repo: PathBuf,
    root: PathBuf,
    busy: Arc<Mutex<HashSet<String>>>,
    /// Serializes `git worktree` administration against the shared repository.
    admin: Mutex<()>,
}

impl WorktreeManager {
    /// `worktree_dir` is relative to `repo`.
    pub fn new(repo: impl Into<PathBuf>, worktree_dir: &Path) -> Self {
        let repo = repo.into();
        let root = repo.join(worktree_dir);
        Self {
            repo,
            root,
            busy: Arc::new(Mutex::new(HashSet::new())),
            admin: Mutex::new(()),
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a task's worktree lives at (whether or not it exists).
    pub fn path(&self, task_id: &str) -> Result<PathBuf> {
        check_id(task_id)?;
        Ok(self.root.join(task_id))
    }

    pub fn exists(&self, task_id: &str) -> Result<bool> {
        Ok(self.path(task_id)?.is_dir())
    }

    /// Create the worktree on a new `task/<id>` branch from `base_ref`.
    #[instrument(skip_all, fields(task_id, base_ref))]
    pub fn create(&self, task_id: &str, base_ref: &str) -> Result<PathBuf> {
        let path = self.path(task_id)?;
        let branch = branch_name(task_id);
        let _admin = self.lock_admin()?;
        let git = Git::new(&self.repo);
        if path.exists() || git.branch_exists(&branch)? {
            return Err(OrchestratorError::WorktreeExists(task_id.to_string()).into());
        }
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create worktree root {}", self.root.display()))?;
        self.exclude_root(&git)?;
        git.worktree_add_from(&path, &branch, base_ref)
            .with_context(|| format!("create worktree for {task_id}"))?;
        info!(path = %path.display(), "worktree created");
        Ok(path)
    }

    /// Mark the worktree busy until the lease is dropped.
    pub fn acquire(&self, task_id: &str) -> Result<WorktreeLease> {
        let lease = self.mark_busy(task_id)?;
        if !lease.path.is_dir() {
            return Err(OrchestratorError::UnknownWorktree(task_id.to_string()).into());
        }
        debug!(task_id, "worktree leased");
        Ok(lease)
    }

    /// Insert `task_id` into the busy set; the returned lease takes it out again.
    fn mark_busy(&self, task_id: &str) -> Result<WorktreeLease> {
        let path = self.path(task_id)?;
        if !self.lock_busy()?.insert(task_id.to_string()) {
            return Err(OrchestratorError::WorktreeBusy(task_id.to_string()).into());
        }
        Ok(WorktreeLease {
            task_id: task_id.to_string(),
            path,
            busy: Arc::clone(&self.busy),
        })
    }

    /// Stage and commit everything in the task's worktree.
    ///
    /// Returns false when there was nothing to commit.
    #[instrument(skip_all, fields(task_id))]
    pub fn commit(&self, task_id: &str, message: &str) -> Result<bool> {
        if !self.exists(task_id)? {
            return Err(OrchestratorError::UnknownWorktree(task_id.to_string()).into());
        }
        let git = Git::new(self.path(task_id)?);
        git.add_all()?;
        let committed = git.commit_staged(message)?;
        debug!(committed, "worktree commit");
        Ok(committed)
    }

    /// Remove the worktree. Refused while it is leased.
    ///
    /// The worktree stays marked busy for the whole removal, so no lease can
    /// be taken on it halfway through.
    #[instrument(skip_all, fields(task_id, delete_branch))]
    pub fn remove(&self, task_id: &str, delete_branch: bool) -> Result<()> {
        let removing = self.mark_busy(task_id)?;
        let path = removing.path();
        let _admin = self.lock_admin()?;
        let git = Git::new(&self.repo);
        let branch = branch_name(task_id);
        let had_branch = git.branch_exists(&branch)?;
        if !path.exists() && !had_branch {
            return Err(OrchestratorError::UnknownWorktree(task_id.to_string()).into());
        }
        if path.exists() {
            git.worktree_remove(path)?;
        }
        git.worktree_prune()?;
        if delete_branch && had_branch {
            git.delete_branch(&branch)?;
        }
        info!("worktree removed");
        Ok(())
    }

    /// Worktrees present under the root, sorted by task id.
    pub fn list(&self) -> Result<Vec<WorktreeInfo>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let busy = self.lock_busy()?.clone();
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("read {}", self.root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(task_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_safe_id(&task_id) {
                continue;
            }
            out.push(WorktreeInfo {
                path: entry.path(),
                branch: branch_name(&task_id),
                busy: busy.contains(&task_id),
                task_id,
            });
        }
        out.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(out)
    }

    /// Keep the worktree root out of `git status` in the main checkout.
    fn exclude_root(&self, git: &Git) -> Result<()> {
        let Ok(rel) = self.root.strip_prefix(&self.repo) else {
            return Ok(());
        };
        let pattern = format!("/{}/", rel.to_string_lossy().trim_end_matches('/'));
        let exclude = git.git_dir()?.join("info").join("exclude");
        let existing = fs::read_to_string(&exclude).unwrap_or_default();
        if existing.lines().any(|line| line.trim() == pattern) {
            return Ok(());
        }
        if let Some(parent) = exclude.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&exclude)
            .with_context(|| format!("open {}", exclude.display()))?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "{pattern}")?;
        debug!(pattern, "excluded worktree root");
        Ok(())
    }

    fn lock_busy(&self) -> Result<std::sync::MutexGuard<'_, HashSet<String>>> {
        self.busy
            .lock()
            .map_err(|_| anyhow!("worktree busy set poisoned"))
    }

    fn lock_admin(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.admin
            .lock()
            .map_err(|_| anyhow!("worktree admin lock poisoned"))
    }
}

fn check_id(task_id: &str) -> Result<()> {
    if is_safe_id(task_id) {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidTaskId(task_id.to_string()).into())
    }
}

/// Exclusive use of one task's worktree. Dropping it releases the worktree.
#[derive(Debug)]
pub struct WorktreeLease {
    task_id: String,
    path: PathBuf,
    busy: Arc<Mutex<HashSet<String>>>,
}

impl WorktreeLease {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorktreeLease {
    fn drop(&mut self) {
        match self.busy.lock() {
            Ok(mut busy) => {
                busy.remove(&self.task_id);
                debug!(task_id = %self.task_id, "worktree released");
            }
            Err(_) => warn!(task_id = %self.task_id, "worktree busy set poisoned on release"),
        }
    }
}
