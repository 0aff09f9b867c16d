//! Typed errors that callers need to branch on.
//!
//! Everything else travels as `anyhow::Error` with context. These variants are
//! raised through `anyhow` as well and recovered with `downcast_ref`.

use std::fmt;

use crate::core::types::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// Requested status change is not an edge of the pipeline.
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// Task cannot start while some dependencies are not `done`.
    DependenciesNotDone {
        task_id: String,
        pending: Vec<String>,
    },
    /// `done` is only reached through a merge, never a plain status update.
    CompletionRequiresMerge(String),
    UnknownTask(String),
    UnknownSpec(String),
    DuplicateTask(String),
    /// Proposed dependency set closes a cycle; `cycle` lists the path.
    CyclicDependency {
        task_id: String,
        cycle: Vec<String>,
    },
    InvalidPriority {
        task_id: String,
        priority: u8,
    },
    /// Task id cannot be used as a branch or directory name.
    InvalidTaskId(String),
    WorktreeBusy(String),
    WorktreeExists(String),
    UnknownWorktree(String),
    /// All three merge tiers failed; manual intervention required.
    MergeFailed {
        task_id: String,
        tier: u8,
        files: Vec<String>,
        message: String,
    },
}

impl OrchestratorError {
    /// Validation errors are rejected synchronously and never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. }
                | Self::DependenciesNotDone { .. }
                | Self::CompletionRequiresMerge(_)
                | Self::UnknownTask(_)
                | Self::UnknownSpec(_)
                | Self::DuplicateTask(_)
                | Self::CyclicDependency { .. }
                | Self::InvalidPriority { .. }
                | Self::InvalidTaskId(_)
        )
    }

    /// Stable machine-readable code for structured results.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::DependenciesNotDone { .. } => "dependencies_not_done",
            Self::CompletionRequiresMerge(_) => "completion_requires_merge",
            Self::UnknownTask(_) => "unknown_task",
            Self::UnknownSpec(_) => "unknown_spec",
            Self::DuplicateTask(_) => "duplicate_task",
            Self::CyclicDependency { .. } => "cyclic_dependency",
            Self::InvalidPriority { .. } => "invalid_priority",
            Self::InvalidTaskId(_) => "invalid_task_id",
            Self::WorktreeBusy(_) => "worktree_busy",
            Self::WorktreeExists(_) => "worktree_exists",
            Self::UnknownWorktree(_) => "unknown_worktree",
            Self::MergeFailed { .. } => "merge_failed",
        }
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTransition { task_id, from, to } => {
                write!(f, "task {task_id}: illegal status change {from} -> {to}")
            }
            Self::DependenciesNotDone { task_id, pending } => write!(
                f,
                "task {task_id}: dependencies not done: {}",
                pending.join(", ")
            ),
            Self::CompletionRequiresMerge(id) => write!(
                f,
                "task {id}: done is set by merging (use merge-task), not by a status update"
            ),
            Self::UnknownTask(id) => write!(f, "unknown task: {id}"),
            Self::UnknownSpec(id) => write!(f, "unknown spec: {id}"),
            Self::DuplicateTask(id) => write!(f, "task already exists: {id}"),
            Self::CyclicDependency { task_id, cycle } => write!(
                f,
                "task {task_id}: dependency cycle {}",
                cycle.join(" -> ")
            ),
            Self::InvalidPriority { task_id, priority } => {
                write!(f, "task {task_id}: priority {priority} outside 1..=3")
            }
            Self::InvalidTaskId(id) => write!(f, "invalid task id '{id}'"),
            Self::WorktreeBusy(id) => write!(f, "worktree for task {id} is busy"),
            Self::WorktreeExists(id) => write!(f, "worktree for task {id} already exists"),
            Self::UnknownWorktree(id) => write!(f, "no worktree for task {id}"),
            Self::MergeFailed {
                task_id,
                tier,
                files,
                message,
            } => {
                write!(f, "merge of task {task_id} failed at tier {tier}: {message}")?;
                if !files.is_empty() {
                    write!(f, " ({})", files.join(", "))?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for OrchestratorError {}

/// Find a typed error anywhere in an `anyhow` chain.
pub fn find_orchestrator_error(err: &anyhow::Error) -> Option<&OrchestratorError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<OrchestratorError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn typed_error_survives_context_wrapping() {
        let err = Err::<(), _>(OrchestratorError::UnknownTask("T-1".to_string()))
            .context("load task")
            .unwrap_err();
        let found = find_orchestrator_error(&err).expect("typed error");
        assert_eq!(found.code(), "unknown_task");
        assert!(found.is_validation());
    }

    #[test]
    fn merge_failure_lists_files() {
        let err = OrchestratorError::MergeFailed {
            task_id: "T-1".to_string(),
            tier: 3,
            files: vec!["a.rs".to_string()],
            message: "regeneration left markers".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "merge of task T-1 failed at tier 3: regeneration left markers (a.rs)"
        );
        assert!(!err.is_validation());
    }
}
