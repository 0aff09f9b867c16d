//! Structured control surface.
//!
//! Every operation returns a [`ControlResult`] instead of an error so callers
//! (the CLI, or anything driving the engine) get one machine-readable shape:
//! `{success, data?, error?}`.

use std::path::Path;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::info;

use crate::core::errors::find_orchestrator_error;
use crate::core::types::{
    ActiveAgent, AgentRole, ExecutionLog, NewTask, RalphLoopState, Spec, SpecStatus, Task,
    TaskStatus, TaskUpdate,
};
use crate::engine::Engine;
use crate::io::changelog::{read_records, replay};
use crate::io::store::{ImportSummary, NewSpec, SpecUpdate};
use crate::io::worktree::{WorktreeInfo, branch_name};
use crate::pipeline::TaskOutcome;
use crate::ralph::CancelToken;
use crate::scheduler::{RunSummary, SchedulerOptions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlError {
    /// Stable code, e.g. `unknown_task`; `internal` for untyped errors.
    pub code: String,
    pub message: String,
    /// True when the request itself was invalid and retrying cannot help.
    pub validation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlResult<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

impl<T> ControlResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(err: &anyhow::Error) -> Self {
        let typed = find_orchestrator_error(err);
        Self {
            success: false,
            data: None,
            error: Some(ControlError {
                code: typed.map_or("internal", |e| e.code()).to_string(),
                message: format!("{err:#}"),
                validation: typed.is_some_and(|e| e.is_validation()),
            }),
        }
    }

    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::err(&err),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

impl<T: Serialize> ControlResult<T> {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct Control {
    engine: Engine,
}

impl Control {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    // ---- specs and tasks ----

    pub fn create_spec(&self, new: NewSpec) -> ControlResult<Spec> {
        ControlResult::from_result(self.engine.store().create_spec(new))
    }

    pub fn list_specs(&self, status: Option<SpecStatus>) -> ControlResult<Vec<Spec>> {
        ControlResult::from_result(self.engine.store().list_specs(status))
    }

    pub fn update_spec(&self, id: &str, update: SpecUpdate) -> ControlResult<Spec> {
        ControlResult::from_result(self.engine.store().update_spec(id, update))
    }

    pub fn create_task(&self, new: NewTask) -> ControlResult<Task> {
        ControlResult::from_result(self.engine.store().create_task(new))
    }

    pub fn get_task(&self, id: &str) -> ControlResult<Task> {
        ControlResult::from_result(self.engine.store().require_task(id))
    }

    pub fn update_task(&self, id: &str, update: TaskUpdate) -> ControlResult<Task> {
        ControlResult::from_result(self.engine.store().update_task(id, update))
    }

    pub fn update_task_status(&self, id: &str, status: TaskStatus) -> ControlResult<Task> {
        ControlResult::from_result(self.engine.store().update_task_status(id, status))
    }

    pub fn list_tasks(
        &self,
        spec_id: Option<&str>,
        status: Option<TaskStatus>,
    ) -> ControlResult<Vec<Task>> {
        ControlResult::from_result(self.engine.store().list_tasks(spec_id, status))
    }

    pub fn list_ready_tasks(&self, spec_id: Option<&str>) -> ControlResult<Vec<Task>> {
        ControlResult::from_result(self.engine.store().list_ready_tasks(spec_id))
    }

    pub fn execution_logs(&self, task_id: &str) -> ControlResult<Vec<ExecutionLog>> {
        ControlResult::from_result(
            self.engine
                .store()
                .require_task(task_id)
                .and_then(|_| self.engine.store().execution_logs(task_id)),
        )
    }

    // ---- agents ----

    /// Record that `role` is working on `task_id` in `slot`.
    pub fn agent_start(&self, task_id: &str, role: AgentRole, slot: usize) -> ControlResult<ActiveAgent> {
        ControlResult::from_result(self.engine.store().require_task(task_id).and_then(|task| {
            self.engine
                .agents()
                .register(task_id, role, slot, task.worktree)
        }))
    }

    /// Returns the registration that was removed, if any.
    pub fn agent_stop(&self, task_id: &str) -> ControlResult<Option<ActiveAgent>> {
        ControlResult::from_result((|| -> Result<_> {
            let persisted = self
                .engine
                .store()
                .list_agents()?
                .into_iter()
                .find(|agent| agent.task_id == task_id);
            let removed = self.engine.agents().deregister(task_id)?;
            Ok(removed.or(persisted))
        })())
    }

    /// Agents registered by any process sharing the database.
    pub fn list_agents(&self) -> ControlResult<Vec<ActiveAgent>> {
        ControlResult::from_result(self.engine.store().list_agents())
    }

    // ---- ralph loops ----

    pub fn ralph_status(&self) -> ControlResult<Vec<RalphLoopState>> {
        ControlResult::from_result(self.engine.loops().status())
    }

    /// Returns whether a running loop was found.
    pub fn ralph_cancel(&self, task_id: &str) -> ControlResult<bool> {
        ControlResult::from_result(self.engine.loops().cancel(task_id))
    }

    // ---- worktrees ----

    /// Create the worktree for an existing task from `base_ref` (default:
    /// the target branch).
    pub fn worktree_create(&self, task_id: &str, base_ref: Option<&str>) -> ControlResult<WorktreeInfo> {
        ControlResult::from_result((|| -> Result<_> {
            self.engine.store().require_task(task_id)?;
            let base = base_ref.unwrap_or(&self.engine.config().target_branch);
            let path = self.engine.worktrees().create(task_id, base)?;
            Ok(WorktreeInfo {
                task_id: task_id.to_string(),
                path,
                branch: branch_name(task_id),
                busy: false,
            })
        })())
    }

    pub fn worktree_remove(&self, task_id: &str, keep_branch: bool) -> ControlResult<()> {
        ControlResult::from_result(self.engine.worktrees().remove(task_id, !keep_branch))
    }

    pub fn worktree_list(&self) -> ControlResult<Vec<WorktreeInfo>> {
        ControlResult::from_result(self.engine.worktrees().list())
    }

    /// Returns false when there was nothing to commit.
    pub fn worktree_commit(&self, task_id: &str, message: &str) -> ControlResult<bool> {
        ControlResult::from_result(self.engine.worktrees().commit(task_id, message))
    }

    // ---- execution and merging ----

    /// Merge a `reviewing` task by hand, e.g. after fixing a failed merge.
    pub fn merge_task(&self, task_id: &str) -> ControlResult<TaskOutcome> {
        ControlResult::from_result(self.engine.runner().finish_merge(task_id))
    }

    pub fn execute(&self, options: SchedulerOptions, cancel: CancelToken) -> ControlResult<RunSummary> {
        ControlResult::from_result(self.engine.execute(options, cancel))
    }

    // ---- change log sync ----

    /// Rewrite the change log from the database.
    pub fn sync_export(&self) -> ControlResult<usize> {
        ControlResult::from_result(self.engine.store().export_changelog())
    }

    /// Replay a change log (default: the configured one) into the database.
    pub fn sync_import(&self, path: Option<&Path>) -> ControlResult<ImportSummary> {
        ControlResult::from_result((|| -> Result<_> {
            let path = match path {
                Some(path) => path.to_path_buf(),
                None => self
                    .engine
                    .config()
                    .changelog
                    .as_ref()
                    .map(|rel| self.engine.root().join(rel))
                    .ok_or_else(|| anyhow!("no change log configured"))?,
            };
            let records = read_records(&path)?;
            let state = replay(&records)?;
            let summary = self.engine.store().import(&state)?;
            info!(path = %path.display(), specs = summary.specs, tasks = summary.tasks, "sync import");
            Ok(summary)
        })())
    }

    /// Collapse the change log to one record per entity.
    pub fn sync_compact(&self) -> ControlResult<usize> {
        self.sync_export()
    }
}
