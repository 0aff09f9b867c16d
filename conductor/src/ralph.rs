//! The Ralph loop: re-run one stage prompt until a verified promise appears or
//! the iteration budget runs out.
//!
//! State lives in the worktree and in counters, never in the conversation:
//! every iteration sends the same prompt to a fresh executor run. Cancellation
//! is cooperative and checked at iteration boundaries.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::promise::extract_promise;
use crate::core::types::{RalphLoopState, Stage};
use crate::io::executor::{ExecRequest, Executor};
use crate::io::store::TaskStore;
use crate::verify::{PromiseVerifier, VerifyContext};

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct LoopEntry {
    state: RalphLoopState,
    cancel: CancelToken,
}

/// Loops currently running in this process.
///
/// With a store attached, loop state is also written to the `ralph_loops`
/// table so `ralph-status` and `ralph-cancel` work from another process.
pub struct LoopRegistry {
    loops: Mutex<BTreeMap<String, LoopEntry>>,
    store: Option<Arc<TaskStore>>,
}

impl Default for LoopRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopRegistry {
    pub fn new() -> Self {
        Self {
            loops: Mutex::new(BTreeMap::new()),
            store: None,
        }
    }

    pub fn with_store(store: Arc<TaskStore>) -> Self {
        Self {
            loops: Mutex::new(BTreeMap::new()),
            store: Some(store),
        }
    }

    fn start(&self, state: RalphLoopState, cancel: CancelToken) -> Result<()> {
        if let Some(store) = &self.store {
            store.remove_loop(&state.task_id)?;
            store.upsert_loop(&state)?;
        }
        self.lock()?
            .insert(state.task_id.clone(), LoopEntry { state, cancel });
        Ok(())
    }

    fn set_iteration(&self, task_id: &str, iteration: u32) {
        let snapshot = match self.lock() {
            Ok(mut loops) => loops.get_mut(task_id).map(|entry| {
                entry.state.iteration = iteration;
                entry.state.clone()
            }),
            Err(err) => {
                warn!(task_id, err = %format!("{err:#}"), "loop registry unavailable");
                None
            }
        };
        if let (Some(store), Some(state)) = (&self.store, snapshot)
            && let Err(err) = store.upsert_loop(&state)
        {
            warn!(task_id, err = %format!("{err:#}"), "loop write-through failed");
        }
    }

    fn finish(&self, task_id: &str) {
        if let Ok(mut loops) = self.lock() {
            loops.remove(task_id);
        }
        if let Some(store) = &self.store
            && let Err(err) = store.remove_loop(task_id)
        {
            warn!(task_id, err = %format!("{err:#}"), "loop write-through failed");
        }
    }

    /// Running loops: this process's registry plus any recorded in the store
    /// by other processes.
    pub fn status(&self) -> Result<Vec<RalphLoopState>> {
        let mut by_task: BTreeMap<String, RalphLoopState> = BTreeMap::new();
        if let Some(store) = &self.store {
            for state in store.list_loops()? {
                by_task.insert(state.task_id.clone(), state);
            }
        }
        let loops = self.lock()?;
        for (task_id, entry) in &*loops {
            by_task.insert(task_id.clone(), entry.state.clone());
        }
        Ok(by_task.into_values().collect())
    }

    /// Ask the loop for `task_id` to stop at its next iteration boundary.
    ///
    /// Returns false when no such loop is running.
    pub fn cancel(&self, task_id: &str) -> Result<bool> {
        let mut found = false;
        if let Some(entry) = self.lock()?.get(task_id) {
            entry.cancel.cancel();
            found = true;
        }
        if let Some(store) = &self.store {
            found |= store.request_loop_cancel(task_id)?;
        }
        info!(task_id, found, "loop cancellation requested");
        Ok(found)
    }

    fn cancel_requested(&self, task_id: &str) -> bool {
        if let Ok(loops) = self.lock()
            && loops
                .get(task_id)
                .is_some_and(|entry| entry.cancel.is_cancelled())
        {
            return true;
        }
        match &self.store {
            Some(store) => store.loop_cancel_requested(task_id).unwrap_or_else(|err| {
                warn!(task_id, err = %format!("{err:#}"), "read cancel flag failed");
                false
            }),
            None => false,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, LoopEntry>>> {
        self.loops
            .lock()
            .map_err(|_| anyhow!("loop registry poisoned"))
    }
}

/// Removes the loop from the registry however the run ends.
struct Registration<'a> {
    registry: &'a LoopRegistry,
    task_id: &'a str,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.finish(self.task_id);
    }
}

/// One stage's loop parameters.
#[derive(Debug, Clone)]
pub struct LoopRequest<'a> {
    pub task_id: &'a str,
    pub stage: Stage,
    pub prompt: &'a str,
    pub promise: &'a str,
    pub max_iterations: u32,
    pub workdir: &'a Path,
    pub allowed_tools: &'a [String],
    pub model: Option<&'a str>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// What happened in one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationVerdict {
    /// The executor failed, timed out or could not be run.
    ExecFailed,
    NoPromise,
    Rejected,
    Verified,
}

#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: u32,
    pub verdict: IterationVerdict,
    pub duration: Duration,
}

/// How a loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Verified { iterations: u32, output: String },
    Exhausted { iterations: u32, last_output: String },
    Cancelled { iterations: u32, last_output: String },
}

impl LoopOutcome {
    pub fn iterations(&self) -> u32 {
        match self {
            LoopOutcome::Verified { iterations, .. }
            | LoopOutcome::Exhausted { iterations, .. }
            | LoopOutcome::Cancelled { iterations, .. } => *iterations,
        }
    }

    pub fn output(&self) -> &str {
        match self {
            LoopOutcome::Verified { output, .. } => output,
            LoopOutcome::Exhausted { last_output, .. }
            | LoopOutcome::Cancelled { last_output, .. } => last_output,
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, LoopOutcome::Verified { .. })
    }
}

pub struct RalphLoop<'a> {
    executor: &'a dyn Executor,
    verifier: &'a dyn PromiseVerifier,
    registry: &'a LoopRegistry,
    cancel: &'a CancelToken,
}

impl<'a> RalphLoop<'a> {
    pub fn new(
        executor: &'a dyn Executor,
        verifier: &'a dyn PromiseVerifier,
        registry: &'a LoopRegistry,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            executor,
            verifier,
            registry,
            cancel,
        }
    }

    /// Run at most `max_iterations` iterations, calling `on_iteration` after each.
    ///
    /// Only registry failures are errors; executor and verifier failures
    /// count as failed iterations.
    #[instrument(skip_all, fields(task_id = request.task_id, stage = %request.stage))]
    pub fn run(
        &self,
        request: &LoopRequest<'_>,
        mut on_iteration: impl FnMut(&IterationReport),
    ) -> Result<LoopOutcome> {
        let per_loop_cancel = CancelToken::new();
        self.registry.start(
            RalphLoopState {
                task_id: request.task_id.to_string(),
                stage: request.stage,
                iteration: 0,
                max_iterations: request.max_iterations,
                promise: request.promise.to_string(),
                started_at: Utc::now(),
            },
            per_loop_cancel,
        )?;
        let _registration = Registration {
            registry: self.registry,
            task_id: request.task_id,
        };

        let exec_request = ExecRequest {
            prompt: request.prompt.to_string(),
            workdir: request.workdir.to_path_buf(),
            allowed_tools: request.allowed_tools.to_vec(),
            model: request.model.map(str::to_string),
            timeout: request.timeout,
            output_limit_bytes: request.output_limit_bytes,
        };
        let ctx = VerifyContext {
            task_id: request.task_id,
            stage: request.stage,
            workdir: request.workdir,
            output_limit_bytes: request.output_limit_bytes,
        };

        let mut last_output = String::new();
        for iteration in 1..=request.max_iterations {
            if self.cancel.is_cancelled() || self.registry.cancel_requested(request.task_id) {
                if let Err(err) = self.executor.release(request.workdir) {
                    warn!(err = %format!("{err:#}"), "executor release failed");
                }
                info!(iteration, "loop cancelled");
                return Ok(LoopOutcome::Cancelled {
                    iterations: iteration - 1,
                    last_output,
                });
            }
            self.registry.set_iteration(request.task_id, iteration);

            let started = Instant::now();
            let verdict = match self.executor.exec(&exec_request) {
                Err(err) => {
                    warn!(iteration, err = %format!("{err:#}"), "executor failed");
                    last_output = format!("executor error: {err:#}");
                    IterationVerdict::ExecFailed
                }
                Ok(result) if !result.succeeded() => {
                    warn!(
                        iteration,
                        exit_code = ?result.exit_code,
                        timed_out = result.timed_out,
                        "executor run failed"
                    );
                    last_output = result.output;
                    IterationVerdict::ExecFailed
                }
                Ok(result) => {
                    last_output = result.output;
                    self.judge(iteration, &last_output, &ctx)
                }
            };
            on_iteration(&IterationReport {
                iteration,
                verdict,
                duration: started.elapsed(),
            });

            if verdict == IterationVerdict::Verified {
                info!(iteration, "promise verified");
                return Ok(LoopOutcome::Verified {
                    iterations: iteration,
                    output: last_output,
                });
            }
        }

        info!(iterations = request.max_iterations, "iterations exhausted");
        Ok(LoopOutcome::Exhausted {
            iterations: request.max_iterations,
            last_output,
        })
    }

    fn judge(&self, iteration: u32, output: &str, ctx: &VerifyContext<'_>) -> IterationVerdict {
        if extract_promise(output).is_none() {
            debug!(iteration, "no promise in output");
            return IterationVerdict::NoPromise;
        }
        match self.verifier.verify(output, ctx) {
            Ok(verdict) if verdict.passed => IterationVerdict::Verified,
            Ok(verdict) => {
                warn!(iteration, method = %verdict.method, reason = %verdict.reason, "promise rejected");
                IterationVerdict::Rejected
            }
            Err(err) => {
                warn!(iteration, err = %format!("{err:#}"), "verification could not run");
                IterationVerdict::Rejected
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::VerificationMethod;
    use crate::test_support::ScriptedExecutor;
    use crate::verify::MethodVerifier;

    const PROMISE: &str = "IMPLEMENTATION COMPLETE";

    fn request<'a>(workdir: &'a Path, tools: &'a [String], max: u32) -> LoopRequest<'a> {
        LoopRequest {
            task_id: "T-1",
            stage: Stage::Implementing,
            prompt: "build it",
            promise: PROMISE,
            max_iterations: max,
            workdir,
            allowed_tools: tools,
            model: None,
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
        }
    }

    fn verifier() -> MethodVerifier {
        MethodVerifier::new(PROMISE, VerificationMethod::StringMatch)
    }

    #[test]
    fn verified_on_third_iteration_with_unchanged_prompt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![
            ScriptedExecutor::reply("working"),
            ScriptedExecutor::reply("still working"),
            ScriptedExecutor::reply("done\n<promise>IMPLEMENTATION COMPLETE</promise>"),
        ]);
        let verifier = verifier();
        let registry = LoopRegistry::new();
        let cancel = CancelToken::new();
        let ralph = RalphLoop::new(&executor, &verifier, &registry, &cancel);

        let mut seen = Vec::new();
        let outcome = ralph
            .run(&request(dir.path(), &[], 5), |report| seen.push(report.verdict))
            .expect("run");

        assert_eq!(outcome.iterations(), 3);
        assert!(outcome.is_verified());
        assert_eq!(
            seen,
            vec![
                IterationVerdict::NoPromise,
                IterationVerdict::NoPromise,
                IterationVerdict::Verified
            ]
        );
        let prompts: Vec<String> = executor.requests().into_iter().map(|r| r.prompt).collect();
        assert_eq!(prompts, vec!["build it"; 3]);
        assert!(registry.status().expect("status").is_empty());
    }

    #[test]
    fn exhausts_without_exceeding_max_iterations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::from_fn(|_| {
            ScriptedExecutor::reply("<promise>IMPLEMENTATION COMPLETE</promise>").exit_code(1)
        });
        let verifier = verifier();
        let registry = LoopRegistry::new();
        let cancel = CancelToken::new();
        let ralph = RalphLoop::new(&executor, &verifier, &registry, &cancel);

        let outcome = ralph.run(&request(dir.path(), &[], 4), |_| {}).expect("run");
        assert_eq!(
            outcome,
            LoopOutcome::Exhausted {
                iterations: 4,
                last_output: "<promise>IMPLEMENTATION COMPLETE</promise>".to_string()
            }
        );
        assert_eq!(executor.requests().len(), 4);
    }

    #[test]
    fn exec_errors_and_rejections_are_failed_iterations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![
            ScriptedExecutor::error("spawn failed"),
            ScriptedExecutor::reply("<promise>SOMETHING ELSE</promise>"),
            ScriptedExecutor::reply("<promise>IMPLEMENTATION COMPLETE</promise>").timed_out(),
        ]);
        let verifier = verifier();
        let registry = LoopRegistry::new();
        let cancel = CancelToken::new();
        let ralph = RalphLoop::new(&executor, &verifier, &registry, &cancel);

        let mut seen = Vec::new();
        let outcome = ralph
            .run(&request(dir.path(), &[], 3), |report| seen.push(report.verdict))
            .expect("run");
        assert!(matches!(outcome, LoopOutcome::Exhausted { iterations: 3, .. }));
        assert_eq!(
            seen,
            vec![
                IterationVerdict::ExecFailed,
                IterationVerdict::Rejected,
                IterationVerdict::ExecFailed
            ]
        );
    }

    #[test]
    fn cancel_before_start_releases_executor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![]);
        let verifier = verifier();
        let registry = LoopRegistry::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let ralph = RalphLoop::new(&executor, &verifier, &registry, &cancel);

        let outcome = ralph.run(&request(dir.path(), &[], 3), |_| {}).expect("run");
        assert!(matches!(outcome, LoopOutcome::Cancelled { iterations: 0, .. }));
        assert!(executor.requests().is_empty());
        assert_eq!(executor.released(), vec![dir.path().to_path_buf()]);
    }

    #[test]
    fn registry_cancel_stops_at_next_boundary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::from_fn(|_| ScriptedExecutor::reply("working"));
        let verifier = verifier();
        let store = Arc::new(TaskStore::open_in_memory().expect("store"));
        let registry = LoopRegistry::with_store(Arc::clone(&store));
        let cancel = CancelToken::new();
        let ralph = RalphLoop::new(&executor, &verifier, &registry, &cancel);

        let outcome = ralph
            .run(&request(dir.path(), &[], 10), |report| {
                let status = registry.status().expect("status");
                assert_eq!(status.len(), 1);
                assert_eq!(status[0].iteration, report.iteration);
                if report.iteration == 2 {
                    assert!(registry.cancel("T-1").expect("cancel"));
                }
            })
            .expect("run");

        assert_eq!(
            outcome,
            LoopOutcome::Cancelled {
                iterations: 2,
                last_output: "working".to_string()
            }
        );
        assert!(store.list_loops().expect("loops").is_empty());
        assert!(!registry.cancel("T-1").expect("cancel after finish"));
    }

    #[test]
    fn store_cancel_flag_from_another_process_is_honoured() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::from_fn(|_| ScriptedExecutor::reply("working"));
        let verifier = verifier();
        let store = Arc::new(TaskStore::open_in_memory().expect("store"));
        let registry = LoopRegistry::with_store(Arc::clone(&store));
        let cancel = CancelToken::new();
        let ralph = RalphLoop::new(&executor, &verifier, &registry, &cancel);

        let outcome = ralph
            .run(&request(dir.path(), &[], 10), |report| {
                if report.iteration == 1 {
                    assert!(store.request_loop_cancel("T-1").expect("flag"));
                }
            })
            .expect("run");
        assert!(matches!(outcome, LoopOutcome::Cancelled { iterations: 1, .. }));
    }
}
