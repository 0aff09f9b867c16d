//! Merging finished task branches into the target branch.
//!
//! Tier 1 is a plain `git merge --no-ff`. Conflicted files escalate to tier 2
//! (resolve the marked-up file) and then tier 3 (regenerate from both sides).
//! A file that survives all three aborts the merge and leaves the target
//! branch untouched.

use std::fs;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::conflict::has_conflict_markers;
use crate::core::errors::OrchestratorError;
use crate::io::config::CONFIG_DIR;
use crate::io::git::{Git, MergeOutcome};
use crate::io::resolver::ConflictResolver;
use crate::io::worktree::{WorktreeManager, branch_name};

/// How a merge was completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub task_id: String,
    /// Highest tier that was needed (1 = clean merge).
    pub tier: u8,
    pub resolved_files: Vec<String>,
    pub regenerated_files: Vec<String>,
}

pub struct MergeEngine {
    worktrees: Arc<WorktreeManager>,
    resolver: Arc<dyn ConflictResolver>,
    target_branch: String,
    /// Paths in the main checkout that may be dirty during a merge.
    ignored_prefixes: Vec<String>,
    lock: Mutex<()>,
}

impl MergeEngine {
    pub fn new(
        worktrees: Arc<WorktreeManager>,
        resolver: Arc<dyn ConflictResolver>,
        target_branch: impl Into<String>,
    ) -> Self {
        let mut ignored_prefixes = vec![format!("{CONFIG_DIR}/")];
        if let Ok(rel) = worktrees.root().strip_prefix(worktrees.repo()) {
            ignored_prefixes.push(format!("{}/", rel.to_string_lossy().trim_end_matches('/')));
        }
        Self {
            worktrees,
            resolver,
            target_branch: target_branch.into(),
            ignored_prefixes,
            lock: Mutex::new(()),
        }
    }

    /// Commit the task's worktree, merge `task/<id>` into the target branch
    /// and remove the worktree and branch.
    ///
    /// Fails with `MergeFailed` when tier 3 cannot settle every file; the
    /// merge is aborted and the worktree kept for manual work.
    #[instrument(skip_all, fields(task_id))]
    pub fn merge_task(&self, task_id: &str) -> Result<MergeReport> {
        let branch = branch_name(task_id);
        if self.worktrees.exists(task_id)? {
            let committed = self
                .worktrees
                .commit(task_id, &format!("{task_id}: pipeline complete"))?;
            debug!(committed, "worktree changes committed");
        }

        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("merge lock poisoned"))?;
        let git = Git::new(self.worktrees.repo());
        if !git.branch_exists(&branch)? {
            return Err(OrchestratorError::UnknownWorktree(task_id.to_string()).into());
        }
        let ignored: Vec<&str> = self.ignored_prefixes.iter().map(String::as_str).collect();
        git.ensure_clean_except_prefixes(&ignored)
            .context("main checkout must be clean before merging")?;
        git.checkout_branch(&self.target_branch)?;

        let message = format!("Merge {branch}");
        let mut report = MergeReport {
            task_id: task_id.to_string(),
            tier: 1,
            resolved_files: Vec::new(),
            regenerated_files: Vec::new(),
        };
        match git.merge_no_ff(&branch, &message)? {
            MergeOutcome::Clean => info!(tier = 1, "merged cleanly"),
            MergeOutcome::Conflicted(files) => {
                if let Err(err) = self.settle_conflicts(&git, task_id, files, &mut report) {
                    if let Err(abort_err) = git.merge_abort() {
                        warn!(err = %format!("{abort_err:#}"), "merge abort failed");
                    }
                    return Err(err);
                }
                git.commit_merge(&format!("{message} (tier {})", report.tier))?;
                info!(
                    tier = report.tier,
                    resolved = report.resolved_files.len(),
                    regenerated = report.regenerated_files.len(),
                    "merged after conflict resolution"
                );
            }
        }

        if let Err(err) = self.worktrees.remove(task_id, true) {
            warn!(err = %format!("{err:#}"), "worktree cleanup after merge failed");
        }
        Ok(report)
    }

    fn settle_conflicts(
        &self,
        git: &Git,
        task_id: &str,
        files: Vec<String>,
        report: &mut MergeReport,
    ) -> Result<()> {
        report.tier = 2;
        let mut escalated = Vec::new();
        for file in files {
            if self.try_resolve(git, &file)? {
                report.resolved_files.push(file);
            } else {
                escalated.push(file);
            }
        }
        if escalated.is_empty() {
            return Ok(());
        }

        report.tier = 3;
        let mut failed = Vec::new();
        for file in escalated {
            if self.try_regenerate(git, &file)? {
                report.regenerated_files.push(file);
            } else {
                failed.push(file);
            }
        }
        if failed.is_empty() {
            return Ok(());
        }
        warn!(tier = 3, files = ?failed, "conflicts could not be settled");
        Err(OrchestratorError::MergeFailed {
            task_id: task_id.to_string(),
            tier: 3,
            message: format!("unresolved conflicts in {}", failed.join(", ")),
            files: failed,
        }
        .into())
    }

    /// Tier 2: ask the resolver to clean up the marked-up file.
    fn try_resolve(&self, git: &Git, file: &str) -> Result<bool> {
        let path = git.workdir().join(file);
        let Ok(conflicted) = fs::read_to_string(&path) else {
            debug!(file, "no readable working copy, escalating");
            return Ok(false);
        };
        if !has_conflict_markers(&conflicted) {
            debug!(file, "no conflict markers, escalating");
            return Ok(false);
        }
        match self.resolver.resolve(file, &conflicted) {
            Ok(resolved) if !has_conflict_markers(&resolved) => {
                write_and_stage(git, file, &resolved)?;
                debug!(tier = 2, file, "conflict resolved");
                Ok(true)
            }
            Ok(_) => {
                warn!(tier = 2, file, "resolution still has conflict markers");
                Ok(false)
            }
            Err(err) => {
                warn!(tier = 2, file, err = %format!("{err:#}"), "resolver failed");
                Ok(false)
            }
        }
    }

    /// Tier 3: rebuild the file from the target (`:2:`) and task (`:3:`) sides.
    fn try_regenerate(&self, git: &Git, file: &str) -> Result<bool> {
        let ours = git.show_stage(2, file)?;
        let theirs = git.show_stage(3, file)?;
        let content = match (ours, theirs) {
            (Some(only), None) | (None, Some(only)) => only,
            (None, None) => {
                git.remove_path(file)?;
                return Ok(true);
            }
            (Some(ours), Some(theirs)) => match self.resolver.regenerate(file, &ours, &theirs) {
                Ok(content) if !has_conflict_markers(&content) => content,
                Ok(_) => {
                    warn!(tier = 3, file, "regenerated file still has conflict markers");
                    return Ok(false);
                }
                Err(err) => {
                    warn!(tier = 3, file, err = %format!("{err:#}"), "regeneration failed");
                    return Ok(false);
                }
            },
        };
        write_and_stage(git, file, &content)?;
        debug!(tier = 3, file, "file regenerated");
        Ok(true)
    }
}

fn write_and_stage(git: &Git, file: &str, content: &str) -> Result<()> {
    let path = git.workdir().join(file);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
    git.add_path(file)
}
