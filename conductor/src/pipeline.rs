//! The per-task stage pipeline.
//!
//! A dispatched task walks implementing → testing → reviewing → validation,
//! each stage being up to `retries` Ralph loops run by the stage's role. The
//! first stage to exhaust its retries sends the task back to `todo` with
//! failure diagnostics; passing validation hands the task to the merge engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::core::errors::{OrchestratorError, find_orchestrator_error};
use crate::core::types::{
    CompletionCriteria, FailureInfo, FailureReason, MergeFailure, NewExecutionLog, Stage, Task,
    TaskStatus,
};
use crate::io::agents::AgentRegistry;
use crate::io::config::ConductorConfig;
use crate::io::executor::Executor;
use crate::io::prompt::{DEFAULT_PROMPT_BUDGET, PromptEngine, StagePrompt};
use crate::io::store::TaskStore;
use crate::io::worktree::{WorktreeLease, WorktreeManager};
use crate::merge::{MergeEngine, MergeReport};
use crate::ralph::{CancelToken, LoopOutcome, LoopRegistry, LoopRequest, RalphLoop};
use crate::verify::MethodVerifier;

/// Where one dispatched task ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Merged and marked `done`.
    Done { merge: MergeReport },
    /// Back in `todo` with failure diagnostics.
    StageFailed {
        stage: Stage,
        reason: FailureReason,
        iterations: u32,
    },
    /// Still `reviewing`, annotated with the merge failure.
    MergeFailed { tier: u8, message: String },
    /// Something other than the work itself went wrong.
    Error { message: String },
}

impl TaskOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, TaskOutcome::Done { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}

/// What the scheduler drives.
///
/// `prepare` runs on the dispatching thread and claims the task; `run` runs
/// on a worker thread and must report rather than fail.
pub trait TaskRunner: Sync {
    type Claim: Send;

    fn prepare(&self, task: &Task) -> Result<Self::Claim>;

    fn run(&self, claim: Self::Claim, slot: usize, cancel: &CancelToken) -> TaskReport;
}

/// A task that has its worktree leased and is `implementing`.
#[derive(Debug)]
pub struct ClaimedTask {
    task: Task,
    lease: WorktreeLease,
}

pub struct PipelineRunner {
    config: Arc<ConductorConfig>,
    store: Arc<TaskStore>,
    worktrees: Arc<WorktreeManager>,
    merger: Arc<MergeEngine>,
    executor: Arc<dyn Executor>,
    agents: Arc<AgentRegistry>,
    loops: Arc<LoopRegistry>,
    prompts: PromptEngine,
}

impl PipelineRunner {
    pub fn new(
        config: Arc<ConductorConfig>,
        store: Arc<TaskStore>,
        worktrees: Arc<WorktreeManager>,
        merger: Arc<MergeEngine>,
        executor: Arc<dyn Executor>,
        agents: Arc<AgentRegistry>,
        loops: Arc<LoopRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            worktrees,
            merger,
            executor,
            agents,
            loops,
            prompts: PromptEngine::new(),
        }
    }

    /// Merge a `reviewing` task and record the result on it.
    ///
    /// Used after the validation stage and for manual retries of a failed
    /// merge.
    #[instrument(skip_all, fields(task_id))]
    pub fn finish_merge(&self, task_id: &str) -> Result<TaskOutcome> {
        let task = self.store.require_task(task_id)?;
        if task.status != TaskStatus::Reviewing {
            return Err(OrchestratorError::InvalidTransition {
                task_id: task.id,
                from: task.status,
                to: TaskStatus::Done,
            }
            .into());
        }
        match self.merger.merge_task(task_id) {
            Ok(report) => {
                self.store.complete_task(task_id)?;
                info!(tier = report.tier, "task done");
                Ok(TaskOutcome::Done { merge: report })
            }
            Err(err) => {
                let (tier, files) = match find_orchestrator_error(&err) {
                    Some(OrchestratorError::MergeFailed { tier, files, .. }) => {
                        (*tier, files.clone())
                    }
                    _ => (1, Vec::new()),
                };
                let message = format!("{err:#}");
                warn!(tier, err = %message, "merge failed, task stays in review");
                self.store.record_merge_failure(
                    task_id,
                    MergeFailure {
                        message: message.clone(),
                        tier,
                        files,
                        recorded_at: Utc::now(),
                    },
                )?;
                Ok(TaskOutcome::MergeFailed { tier, message })
            }
        }
    }

    /// Criteria for `stage`: the task's completion spec wins over config.
    fn criteria(&self, task: &Task, stage: Stage) -> CompletionCriteria {
        let role = stage.role();
        task.completion_spec
            .as_ref()
            .and_then(|spec| spec.criteria.get(&role))
            .cloned()
            .unwrap_or_else(|| self.config.role(role).criteria)
    }

    fn execute(
        &self,
        claim: ClaimedTask,
        slot: usize,
        cancel: &CancelToken,
    ) -> Result<TaskOutcome> {
        let ClaimedTask { task, lease } = claim;
        if let Some(failed) = self.run_stages(&task, &lease, slot, cancel)? {
            return Ok(failed);
        }
        drop(lease);
        self.finish_merge(&task.id)
    }

    /// Run every stage. Returns the failure outcome of the first stage that
    /// does not pass, or `None` when all pass.
    ///
    /// Iterations across all stages and retries share `max_total_iterations`;
    /// each RalphLoop run is capped at what remains of it.
    fn run_stages(
        &self,
        task: &Task,
        lease: &WorktreeLease,
        slot: usize,
        cancel: &CancelToken,
    ) -> Result<Option<TaskOutcome>> {
        let workdir = lease.path();
        let worktree = Some(workdir.to_string_lossy().into_owned());
        let previous_failure = task.failure.clone();
        let budget = self.config.max_total_iterations;
        let mut iterations_used = 0u32;
        self.store.set_iteration(&task.id, 0)?;

        for stage in Stage::ORDER {
            let role = stage.role();
            self.store.update_task_status(&task.id, stage.status())?;
            self.store.set_assignee(&task.id, Some(role))?;
            let settings = self.config.role(role);
            let criteria = self.criteria(task, stage);
            let prompt = self.prompts.render_stage(
                &StagePrompt {
                    task,
                    stage,
                    role,
                    promise: &criteria.promise,
                    previous_failure: previous_failure.as_ref(),
                },
                DEFAULT_PROMPT_BUDGET,
            )?;
            let verifier = MethodVerifier::new(criteria.promise.clone(), criteria.verification);
            let mut request = LoopRequest {
                task_id: &task.id,
                stage,
                prompt: &prompt,
                promise: &criteria.promise,
                max_iterations: criteria.max_iterations,
                workdir,
                allowed_tools: &settings.allowed_tools,
                model: settings.model.as_deref(),
                timeout: self.config.stage_timeout(),
                output_limit_bytes: self.config.output_limit_bytes,
            };

            let mut last_output = String::new();
            let mut passed = false;
            for attempt in 1..=settings.retries {
                let remaining = budget.saturating_sub(iterations_used);
                if remaining == 0 {
                    break;
                }
                request.max_iterations = criteria.max_iterations.min(remaining);
                info!(task_id = %task.id, stage = %stage, attempt, "stage attempt");
                self.agents.register(&task.id, role, slot, worktree.clone())?;
                let ralph = RalphLoop::new(self.executor.as_ref(), &verifier, &self.loops, cancel);
                let started = Instant::now();
                let outcome = ralph.run(&request, |_| {
                    iterations_used += 1;
                    if let Err(err) = self.store.set_iteration(&task.id, iterations_used) {
                        warn!(task_id = %task.id, err = %format!("{err:#}"), "iteration update failed");
                    }
                });
                if let Err(err) = self.agents.deregister(&task.id) {
                    warn!(task_id = %task.id, err = %format!("{err:#}"), "agent deregistration failed");
                }
                let outcome = outcome?;
                self.store.log_execution(NewExecutionLog {
                    task_id: task.id.clone(),
                    role,
                    stage,
                    attempt,
                    output: outcome.output().to_string(),
                    success: outcome.is_verified(),
                    duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                })?;

                match outcome {
                    LoopOutcome::Verified { .. } => {
                        passed = true;
                        break;
                    }
                    LoopOutcome::Exhausted { last_output: out, .. } => last_output = out,
                    LoopOutcome::Cancelled { last_output: out, .. } => {
                        return self
                            .fail(task, stage, FailureReason::LoopCancelled, iterations_used, out)
                            .map(Some);
                    }
                }
            }
            if !passed {
                let reason = if iterations_used >= budget {
                    warn!(task_id = %task.id, stage = %stage, budget, "total iteration budget exhausted");
                    FailureReason::TotalIterationsExhausted
                } else {
                    FailureReason::StageRetriesExhausted
                };
                return self
                    .fail(task, stage, reason, iterations_used, last_output)
                    .map(Some);
            }
            info!(task_id = %task.id, stage = %stage, "stage passed");
        }
        Ok(None)
    }

    fn fail(
        &self,
        task: &Task,
        stage: Stage,
        reason: FailureReason,
        iterations: u32,
        last_output: String,
    ) -> Result<TaskOutcome> {
        self.store.record_failure(
            &task.id,
            FailureInfo {
                stage,
                iterations_used: iterations,
                last_output,
                reason,
                recorded_at: Utc::now(),
            },
        )?;
        Ok(TaskOutcome::StageFailed {
            stage,
            reason,
            iterations,
        })
    }

    /// Put a task whose run broke mid-pipeline back in `todo`.
    fn reset(&self, task_id: &str) {
        let reset = self
            .store
            .update_task_status(task_id, TaskStatus::Todo)
            .and_then(|_| self.store.set_assignee(task_id, None));
        if let Err(err) = reset {
            warn!(task_id, err = %format!("{err:#}"), "could not reset task");
        }
    }
}

impl TaskRunner for PipelineRunner {
    type Claim = ClaimedTask;

    /// Create (or reuse) the worktree, lease it and mark the task
    /// `implementing`. Undoes worktree creation if the task cannot start.
    #[instrument(skip_all, fields(task_id = %task.id))]
    fn prepare(&self, task: &Task) -> Result<ClaimedTask> {
        let created = if self.worktrees.exists(&task.id)? {
            false
        } else {
            self.worktrees.create(&task.id, &self.config.target_branch)?;
            true
        };
        let claimed = self.worktrees.acquire(&task.id).and_then(|lease| {
            let path: PathBuf = lease.path().to_path_buf();
            let task = self.store.update_task_status(&task.id, TaskStatus::Implementing)?;
            let task = self
                .store
                .set_worktree(&task.id, Some(path.to_string_lossy().into_owned()))?;
            Ok(ClaimedTask { task, lease })
        });
        match claimed {
            Ok(claim) => Ok(claim),
            Err(err) => {
                if created && let Err(cleanup) = self.worktrees.remove(&task.id, true) {
                    warn!(err = %format!("{cleanup:#}"), "worktree cleanup failed");
                }
                Err(err)
            }
        }
    }

    fn run(&self, claim: ClaimedTask, slot: usize, cancel: &CancelToken) -> TaskReport {
        let task_id = claim.task.id.clone();
        let outcome = match self.execute(claim, slot, cancel) {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = format!("{err:#}");
                error!(task_id = %task_id, err = %message, "pipeline run failed");
                self.reset(&task_id);
                TaskOutcome::Error { message }
            }
        };
        TaskReport { task_id, outcome }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::Path;

    use crate::core::types::{AgentRole, CompletionSpec, NewTask, VerificationMethod};
    use crate::io::config::RoleConfig;
    use crate::io::store::NewSpec;
    use crate::test_support::{ScriptedExecutor, ScriptedReply, ScriptedResolver, TestRepo};

    struct Fixture {
        repo: TestRepo,
        store: Arc<TaskStore>,
        worktrees: Arc<WorktreeManager>,
        executor: Arc<ScriptedExecutor>,
        runner: PipelineRunner,
    }

    fn fixture(config: ConductorConfig, executor: ScriptedExecutor) -> Fixture {
        let repo = TestRepo::new().expect("repo");
        let store = Arc::new(TaskStore::open_in_memory().expect("store"));
        store.create_spec(NewSpec::new("SPEC-1", "spec")).expect("spec");
        let worktrees = Arc::new(WorktreeManager::new(repo.path(), Path::new(".worktrees")));
        let merger = Arc::new(MergeEngine::new(
            Arc::clone(&worktrees),
            Arc::new(ScriptedResolver::new()),
            "main",
        ));
        let executor = Arc::new(executor);
        let runner = PipelineRunner::new(
            Arc::new(config),
            Arc::clone(&store),
            Arc::clone(&worktrees),
            merger,
            executor.clone(),
            Arc::new(AgentRegistry::with_store(Arc::clone(&store))),
            Arc::new(LoopRegistry::with_store(Arc::clone(&store))),
        );
        Fixture {
            repo,
            store,
            worktrees,
            executor,
            runner,
        }
    }

    /// Every role keeps its promise but gets `retries` and `max_iterations`.
    fn config(retries: u32, max_iterations: u32) -> ConductorConfig {
        let mut roles = BTreeMap::new();
        for role in [AgentRole::Coder, AgentRole::Tester, AgentRole::Reviewer, AgentRole::Qa] {
            roles.insert(
                role,
                RoleConfig {
                    retries: Some(retries),
                    max_iterations: Some(max_iterations),
                    ..RoleConfig::default()
                },
            );
        }
        ConductorConfig {
            roles,
            ..ConductorConfig::default()
        }
    }

    /// Answer each stage with its default promise; the coder writes a file.
    fn honest_worker(request: &crate::io::executor::ExecRequest) -> ScriptedReply {
        let promise = ["IMPLEMENTATION COMPLETE", "TESTS PASSED", "REVIEW PASSED", "QA PASSED"]
            .into_iter()
            .find(|p| request.prompt.contains(&format!("<promise>{p}</promise>")))
            .unwrap_or("NONE");
        let reply = ScriptedExecutor::reply(&format!("done\n<promise>{promise}</promise>"));
        if promise == "IMPLEMENTATION COMPLETE" {
            reply.writes("feature.txt", "implemented\n")
        } else {
            reply
        }
    }

    fn run_one(fx: &Fixture, id: &str) -> TaskReport {
        let task = fx.store.require_task(id).expect("task");
        let claim = fx.runner.prepare(&task).expect("prepare");
        fx.runner.run(claim, 0, &CancelToken::new())
    }

    #[test]
    fn full_pipeline_merges_and_marks_done() {
        let fx = fixture(config(1, 2), ScriptedExecutor::from_fn(honest_worker));
        fx.store.create_task(NewTask::new("T-1", "SPEC-1", "feature")).expect("task");

        let report = run_one(&fx, "T-1");
        assert!(report.outcome.is_done(), "{report:?}");

        let task = fx.store.require_task("T-1").expect("task");
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.iteration, 4);
        assert!(task.worktree.is_none());
        assert_eq!(fx.repo.read("feature.txt").expect("merged"), "implemented\n");
        assert!(!fx.worktrees.exists("T-1").expect("exists"));

        let logs = fx.store.execution_logs("T-1").expect("logs");
        let stages: Vec<Stage> = logs.iter().map(|l| l.stage).collect();
        assert_eq!(stages, Stage::ORDER.to_vec());
        assert!(logs.iter().all(|l| l.success));
        assert!(fx.store.list_agents().expect("agents").is_empty());
    }

    #[test]
    fn exhausted_stage_records_failure_and_returns_to_todo() {
        let fx = fixture(
            config(1, 3),
            ScriptedExecutor::from_fn(|_| ScriptedExecutor::reply("still thinking")),
        );
        fx.store.create_task(NewTask::new("T-1", "SPEC-1", "feature")).expect("task");

        let report = run_one(&fx, "T-1");
        assert_eq!(
            report.outcome,
            TaskOutcome::StageFailed {
                stage: Stage::Implementing,
                reason: FailureReason::StageRetriesExhausted,
                iterations: 3,
            }
        );
        let task = fx.store.require_task("T-1").expect("task");
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.iteration, 3);
        let failure = task.failure.expect("failure info");
        assert_eq!(failure.stage, Stage::Implementing);
        assert_eq!(failure.last_output, "still thinking");
        assert!(task.assignee.is_none());
        assert_eq!(fx.executor.requests().len(), 3);
        assert_eq!(fx.store.list_ready_tasks(None).expect("ready").len(), 1);
    }

    #[test]
    fn retries_accumulate_iterations_and_log_each_attempt() {
        let fx = fixture(
            config(2, 2),
            ScriptedExecutor::from_fn(|_| ScriptedExecutor::reply("no luck")),
        );
        fx.store.create_task(NewTask::new("T-1", "SPEC-1", "feature")).expect("task");

        let report = run_one(&fx, "T-1");
        assert!(matches!(report.outcome, TaskOutcome::StageFailed { iterations: 4, .. }));
        let logs = fx.store.execution_logs("T-1").expect("logs");
        let attempts: Vec<u32> = logs.iter().map(|l| l.attempt).collect();
        assert_eq!(attempts, vec![1, 2]);
        assert!(logs.iter().all(|l| !l.success));
    }

    #[test]
    fn total_iteration_budget_caps_work_across_stages() {
        let mut cfg = config(3, 3);
        cfg.max_total_iterations = 5;
        let fx = fixture(
            cfg,
            ScriptedExecutor::from_fn(|request| {
                if request.prompt.contains("<promise>IMPLEMENTATION COMPLETE</promise>") {
                    ScriptedExecutor::reply("<promise>IMPLEMENTATION COMPLETE</promise>")
                        .writes("feature.txt", "implemented\n")
                } else {
                    ScriptedExecutor::reply("tests still red")
                }
            }),
        );
        fx.store.create_task(NewTask::new("T-1", "SPEC-1", "feature")).expect("task");

        let report = run_one(&fx, "T-1");
        assert_eq!(
            report.outcome,
            TaskOutcome::StageFailed {
                stage: Stage::Testing,
                reason: FailureReason::TotalIterationsExhausted,
                iterations: 5,
            }
        );
        assert_eq!(fx.executor.requests().len(), 5);
        let attempts: Vec<u32> = fx
            .store
            .execution_logs("T-1")
            .expect("logs")
            .iter()
            .filter(|log| log.stage == Stage::Testing)
            .map(|log| log.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2]);
        let task = fx.store.require_task("T-1").expect("task");
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.iteration, 5);
        let failure = task.failure.expect("failure info");
        assert_eq!(failure.reason, FailureReason::TotalIterationsExhausted);
        assert_eq!(failure.iterations_used, 5);
    }

    #[test]
    fn task_completion_spec_overrides_role_criteria() {
        let fx = fixture(
            config(1, 1),
            ScriptedExecutor::from_fn(|request| {
                if request.prompt.contains("<promise>BUILT</promise>") {
                    ScriptedExecutor::reply("<promise>BUILT</promise>")
                } else {
                    ScriptedExecutor::reply("not yet")
                }
            }),
        );
        let mut criteria = BTreeMap::new();
        criteria.insert(
            AgentRole::Coder,
            CompletionCriteria {
                promise: "BUILT".to_string(),
                verification: VerificationMethod::StringMatch,
                max_iterations: 2,
            },
        );
        let spec = CompletionSpec {
            outcome: "it builds".to_string(),
            acceptance_criteria: vec![],
            criteria,
        };
        fx.store
            .create_task(NewTask::new("T-1", "SPEC-1", "feature").with_completion_spec(spec))
            .expect("task");

        let report = run_one(&fx, "T-1");
        assert_eq!(
            report.outcome,
            TaskOutcome::StageFailed {
                stage: Stage::Testing,
                reason: FailureReason::StageRetriesExhausted,
                iterations: 2,
            }
        );
    }

    #[test]
    fn cancelled_loop_fails_with_loop_cancelled() {
        let fx = fixture(config(3, 3), ScriptedExecutor::from_fn(honest_worker));
        fx.store.create_task(NewTask::new("T-1", "SPEC-1", "feature")).expect("task");
        let task = fx.store.require_task("T-1").expect("task");
        let claim = fx.runner.prepare(&task).expect("prepare");
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = fx.runner.run(claim, 0, &cancel);
        assert_eq!(
            report.outcome,
            TaskOutcome::StageFailed {
                stage: Stage::Implementing,
                reason: FailureReason::LoopCancelled,
                iterations: 0,
            }
        );
        let task = fx.store.require_task("T-1").expect("task");
        assert_eq!(task.status, TaskStatus::Todo);
        assert!(fx.executor.requests().is_empty());
        assert_eq!(fx.store.execution_logs("T-1").expect("logs").len(), 1);
    }

    #[test]
    fn prepare_rejects_blocked_task_and_removes_new_worktree() {
        let fx = fixture(config(1, 1), ScriptedExecutor::new(vec![]));
        fx.store.create_task(NewTask::new("T-1", "SPEC-1", "base")).expect("task");
        fx.store
            .create_task(
                NewTask::new("T-2", "SPEC-1", "dependent").with_dependencies(["T-1"]),
            )
            .expect("task");
        let task = fx.store.require_task("T-2").expect("task");

        let err = fx.runner.prepare(&task).unwrap_err();
        assert_eq!(
            find_orchestrator_error(&err).map(OrchestratorError::code),
            Some("dependencies_not_done")
        );
        assert!(!fx.worktrees.exists("T-2").expect("exists"));
        assert_eq!(
            fx.store.require_task("T-2").expect("task").status,
            TaskStatus::Todo
        );
    }

    #[test]
    fn failed_task_is_redispatched_into_its_existing_worktree() {
        let fx = fixture(config(1, 1), ScriptedExecutor::from_fn(honest_worker));
        fx.store.create_task(NewTask::new("T-1", "SPEC-1", "feature")).expect("task");
        let path = fx.worktrees.create("T-1", "main").expect("worktree");
        std::fs::write(path.join("draft.txt"), "earlier work\n").expect("write");

        let report = run_one(&fx, "T-1");
        assert!(report.outcome.is_done(), "{report:?}");
        assert_eq!(fx.repo.read("draft.txt").expect("merged"), "earlier work\n");
    }

    #[test]
    fn finish_merge_requires_reviewing() {
        let fx = fixture(config(1, 1), ScriptedExecutor::new(vec![]));
        fx.store.create_task(NewTask::new("T-1", "SPEC-1", "feature")).expect("task");
        let err = fx.runner.finish_merge("T-1").unwrap_err();
        assert_eq!(
            find_orchestrator_error(&err).map(OrchestratorError::code),
            Some("invalid_transition")
        );
    }
}
