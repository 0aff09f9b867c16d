//! Dependency-aware dispatch onto a bounded pool of worker threads.
//!
//! The dispatching thread owns the pending queue. It claims ready tasks while
//! slots are free, hands each claim to a scoped worker thread, and after every
//! completion re-reads the ready set so newly unblocked tasks join the queue.
//! A task is dispatched at most once per run.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::core::ready::sort_for_dispatch;
use crate::core::types::{Task, TaskStatus};
use crate::io::store::TaskStore;
use crate::pipeline::{TaskOutcome, TaskReport, TaskRunner};
use crate::ralph::CancelToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub max_parallel: usize,
    /// Only dispatch tasks of this spec.
    pub spec_id: Option<String>,
    /// Only dispatch this task (if it is ready).
    pub task_id: Option<String>,
}

impl SchedulerOptions {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel,
            spec_id: None,
            task_id: None,
        }
    }
}

/// A task that could not be claimed; it is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchError {
    pub task_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Task ids in the order they were handed to workers.
    pub dispatched: Vec<String>,
    /// Worker reports in completion order.
    pub reports: Vec<TaskReport>,
    pub dispatch_errors: Vec<DispatchError>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn all_done(&self) -> bool {
        self.dispatch_errors.is_empty() && self.reports.iter().all(|r| r.outcome.is_done())
    }
}

pub struct Scheduler<'a, R: TaskRunner> {
    store: &'a TaskStore,
    runner: &'a R,
    options: SchedulerOptions,
    cancel: CancelToken,
}

impl<'a, R: TaskRunner> Scheduler<'a, R> {
    pub fn new(store: &'a TaskStore, runner: &'a R, options: SchedulerOptions) -> Self {
        Self {
            store,
            runner,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// Share an external cancellation token with the run and its loops.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Dispatch until nothing is ready and no worker is running.
    #[instrument(skip_all, fields(max_parallel = self.options.max_parallel))]
    pub fn run(&self) -> Result<RunSummary> {
        if self.options.max_parallel == 0 {
            return Err(anyhow!("max_parallel must be > 0"));
        }
        if let Some(task_id) = &self.options.task_id {
            self.store.require_task(task_id)?;
        }

        let mut summary = RunSummary::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut pending: Vec<Task> = Vec::new();
        self.refill(&mut pending, &mut seen)?;

        thread::scope(|scope| -> Result<()> {
            let (tx, rx) = mpsc::channel::<(usize, TaskReport)>();
            let mut free_slots: Vec<usize> = (0..self.options.max_parallel).rev().collect();
            let mut running = 0usize;

            loop {
                while !self.cancel.is_cancelled() && !pending.is_empty() {
                    let Some(slot) = free_slots.pop() else {
                        break;
                    };
                    let task = pending.remove(0);
                    match self.runner.prepare(&task) {
                        Ok(claim) => {
                            info!(task_id = %task.id, slot, priority = task.priority, "dispatching task");
                            summary.dispatched.push(task.id.clone());
                            running += 1;
                            let tx = tx.clone();
                            let runner = self.runner;
                            let store = self.store;
                            let cancel = &self.cancel;
                            let task_id = task.id;
                            scope.spawn(move || {
                                let report = panic::catch_unwind(AssertUnwindSafe(|| {
                                    runner.run(claim, slot, cancel)
                                }))
                                .unwrap_or_else(|payload| {
                                    lost_worker(store, task_id, panic_message(payload.as_ref()))
                                });
                                if tx.send((slot, report)).is_err() {
                                    warn!(slot, "scheduler stopped listening");
                                }
                            });
                        }
                        Err(err) => {
                            free_slots.push(slot);
                            let message = format!("{err:#}");
                            warn!(task_id = %task.id, err = %message, "dispatch failed");
                            summary.dispatch_errors.push(DispatchError {
                                task_id: task.id,
                                message,
                            });
                        }
                    }
                }

                if running == 0 {
                    break;
                }
                let (slot, report) = rx
                    .recv()
                    .map_err(|_| anyhow!("worker channel closed unexpectedly"))?;
                running -= 1;
                free_slots.push(slot);
                debug!(task_id = %report.task_id, slot, "worker finished");
                summary.reports.push(report);
                if !self.cancel.is_cancelled() {
                    self.refill(&mut pending, &mut seen)?;
                }
            }
            Ok(())
        })?;

        summary.cancelled = self.cancel.is_cancelled();
        info!(
            dispatched = summary.dispatched.len(),
            failed_dispatches = summary.dispatch_errors.len(),
            cancelled = summary.cancelled,
            "scheduler run finished"
        );
        Ok(summary)
    }

    /// Merge newly ready, not yet seen tasks into the queue and re-sort.
    fn refill(&self, pending: &mut Vec<Task>, seen: &mut HashSet<String>) -> Result<()> {
        let ready = self.store.list_ready_tasks(self.options.spec_id.as_deref())?;
        let mut added = 0usize;
        for task in ready {
            if let Some(only) = &self.options.task_id
                && &task.id != only
            {
                continue;
            }
            if seen.insert(task.id.clone()) {
                pending.push(task);
                added += 1;
            }
        }
        if added > 0 {
            sort_for_dispatch(pending);
            debug!(added, queued = pending.len(), "ready queue refilled");
        }
        Ok(())
    }
}

/// Report a worker that panicked and put its task back in `todo`.
fn lost_worker(store: &TaskStore, task_id: String, message: String) -> TaskReport {
    error!(task_id = %task_id, panic = %message, "worker panicked");
    let reset = store
        .update_task_status(&task_id, TaskStatus::Todo)
        .and_then(|_| store.set_assignee(&task_id, None));
    if let Err(err) = reset {
        warn!(task_id = %task_id, err = %format!("{err:#}"), "reset after panic failed");
    }
    TaskReport {
        task_id,
        outcome: TaskOutcome::Error {
            message: format!("worker panicked: {message}"),
        },
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::core::types::NewTask;
    use crate::io::store::NewSpec;

    /// Marks tasks done without doing any work; optionally fails some.
    struct FakeRunner {
        store: Arc<TaskStore>,
        fail_prepare: HashSet<String>,
        fail_run: HashSet<String>,
        panic_run: HashSet<String>,
        log: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl FakeRunner {
        fn new(store: Arc<TaskStore>) -> Self {
            Self {
                store,
                fail_prepare: HashSet::new(),
                fail_run: HashSet::new(),
                panic_run: HashSet::new(),
                log: Mutex::new(Vec::new()),
                delay: Duration::from_millis(5),
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().expect("log").clone()
        }
    }

    impl TaskRunner for FakeRunner {
        type Claim = String;

        fn prepare(&self, task: &Task) -> Result<String> {
            if self.fail_prepare.contains(&task.id) {
                return Err(anyhow!("no worktree for {}", task.id));
            }
            self.store.update_task_status(&task.id, TaskStatus::Implementing)?;
            Ok(task.id.clone())
        }

        fn run(&self, task_id: String, _slot: usize, _cancel: &CancelToken) -> TaskReport {
            self.log.lock().expect("log").push(format!("start:{task_id}"));
            thread::sleep(self.delay);
            if self.panic_run.contains(&task_id) {
                panic!("runner exploded on {task_id}");
            }
            let outcome = if self.fail_run.contains(&task_id) {
                self.store.update_task_status(&task_id, TaskStatus::Todo).expect("reset");
                TaskOutcome::Error {
                    message: "boom".to_string(),
                }
            } else {
                for status in [TaskStatus::Testing, TaskStatus::Reviewing] {
                    self.store.update_task_status(&task_id, status).expect("advance");
                }
                self.store.complete_task(&task_id).expect("complete");
                TaskOutcome::Done {
                    merge: crate::merge::MergeReport {
                        task_id: task_id.clone(),
                        tier: 1,
                        resolved_files: vec![],
                        regenerated_files: vec![],
                    },
                }
            };
            self.log.lock().expect("log").push(format!("end:{task_id}"));
            TaskReport { task_id, outcome }
        }
    }

    fn store() -> Arc<TaskStore> {
        let store = Arc::new(TaskStore::open_in_memory().expect("store"));
        store.create_spec(NewSpec::new("SPEC-1", "spec")).expect("spec");
        store
    }

    #[test]
    fn single_slot_dispatches_by_priority_then_creation() {
        let store = store();
        store.create_task(NewTask::new("low", "SPEC-1", "l").with_priority(3)).expect("task");
        store.create_task(NewTask::new("mid-a", "SPEC-1", "m").with_priority(2)).expect("task");
        store.create_task(NewTask::new("high", "SPEC-1", "h").with_priority(1)).expect("task");
        store.create_task(NewTask::new("mid-b", "SPEC-1", "m").with_priority(2)).expect("task");
        let runner = FakeRunner::new(Arc::clone(&store));

        let summary = Scheduler::new(&store, &runner, SchedulerOptions::new(1))
            .run()
            .expect("run");
        assert_eq!(summary.dispatched, vec!["high", "mid-a", "mid-b", "low"]);
        assert!(summary.all_done());
    }

    #[test]
    fn dependents_are_dispatched_after_their_dependencies_finish() {
        let store = store();
        store.create_task(NewTask::new("api", "SPEC-1", "api").with_priority(3)).expect("task");
        store
            .create_task(NewTask::new("ui", "SPEC-1", "ui").with_priority(1).with_dependencies(["api"]))
            .expect("task");
        store.create_task(NewTask::new("docs", "SPEC-1", "docs").with_priority(2)).expect("task");
        let runner = FakeRunner::new(Arc::clone(&store));

        let summary = Scheduler::new(&store, &runner, SchedulerOptions::new(4))
            .run()
            .expect("run");
        assert_eq!(summary.reports.len(), 3);
        let log = runner.log();
        let end_api = log.iter().position(|e| e == "end:api").expect("api ran");
        let start_ui = log.iter().position(|e| e == "start:ui").expect("ui ran");
        assert!(end_api < start_ui, "{log:?}");
        assert_eq!(store.require_task("ui").expect("ui").status, TaskStatus::Done);
    }

    #[test]
    fn parallel_slots_run_independent_tasks_concurrently() {
        let store = store();
        for id in ["a", "b", "c"] {
            store.create_task(NewTask::new(id, "SPEC-1", id)).expect("task");
        }
        let mut runner = FakeRunner::new(Arc::clone(&store));
        runner.delay = Duration::from_millis(50);

        let summary = Scheduler::new(&store, &runner, SchedulerOptions::new(3))
            .run()
            .expect("run");
        assert_eq!(summary.dispatched, vec!["a", "b", "c"]);
        let log = runner.log();
        let first_end = log.iter().position(|e| e.starts_with("end:")).expect("end");
        let starts_before = log[..first_end].iter().filter(|e| e.starts_with("start:")).count();
        assert_eq!(starts_before, 3, "{log:?}");
    }

    #[test]
    fn failed_tasks_are_not_redispatched_in_the_same_run() {
        let store = store();
        store.create_task(NewTask::new("flaky", "SPEC-1", "f")).expect("task");
        store.create_task(NewTask::new("blocked", "SPEC-1", "b")).expect("task");
        let mut runner = FakeRunner::new(Arc::clone(&store));
        runner.fail_run.insert("flaky".to_string());
        runner.fail_prepare.insert("blocked".to_string());

        let summary = Scheduler::new(&store, &runner, SchedulerOptions::new(2))
            .run()
            .expect("run");
        assert_eq!(summary.dispatched, vec!["flaky"]);
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.dispatch_errors.len(), 1);
        assert_eq!(summary.dispatch_errors[0].task_id, "blocked");
        assert!(!summary.all_done());
        assert_eq!(store.require_task("flaky").expect("task").status, TaskStatus::Todo);
        assert_eq!(store.require_task("blocked").expect("task").status, TaskStatus::Todo);
    }

    #[test]
    fn panicking_worker_is_reported_and_its_task_reset() {
        let store = store();
        store.create_task(NewTask::new("bad", "SPEC-1", "b")).expect("task");
        store.create_task(NewTask::new("good", "SPEC-1", "g")).expect("task");
        let mut runner = FakeRunner::new(Arc::clone(&store));
        runner.panic_run.insert("bad".to_string());
        let runner = Arc::new(runner);

        let (done_tx, done_rx) = mpsc::channel();
        let worker_store = Arc::clone(&store);
        let worker_runner = Arc::clone(&runner);
        thread::spawn(move || {
            let summary = Scheduler::new(&worker_store, &*worker_runner, SchedulerOptions::new(2)).run();
            let _ = done_tx.send(summary);
        });
        let summary = done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("scheduler returned")
            .expect("run");

        assert_eq!(summary.reports.len(), 2);
        let bad = summary
            .reports
            .iter()
            .find(|report| report.task_id == "bad")
            .expect("bad reported");
        assert!(
            matches!(&bad.outcome, TaskOutcome::Error { message } if message.contains("runner exploded")),
            "{bad:?}"
        );
        assert!(!summary.all_done());
        assert_eq!(store.require_task("bad").expect("task").status, TaskStatus::Todo);
        assert_eq!(store.require_task("good").expect("task").status, TaskStatus::Done);
    }

    #[test]
    fn single_task_and_spec_filters() {
        let store = store();
        store.create_spec(NewSpec::new("SPEC-2", "other")).expect("spec");
        store.create_task(NewTask::new("a", "SPEC-1", "a")).expect("task");
        store.create_task(NewTask::new("b", "SPEC-1", "b")).expect("task");
        store.create_task(NewTask::new("c", "SPEC-2", "c")).expect("task");
        let runner = FakeRunner::new(Arc::clone(&store));

        let mut only_b = SchedulerOptions::new(2);
        only_b.task_id = Some("b".to_string());
        let summary = Scheduler::new(&store, &runner, only_b).run().expect("run");
        assert_eq!(summary.dispatched, vec!["b"]);

        let mut spec_two = SchedulerOptions::new(2);
        spec_two.spec_id = Some("SPEC-2".to_string());
        let summary = Scheduler::new(&store, &runner, spec_two).run().expect("run");
        assert_eq!(summary.dispatched, vec!["c"]);

        let mut unknown = SchedulerOptions::new(2);
        unknown.task_id = Some("zzz".to_string());
        assert!(Scheduler::new(&store, &runner, unknown).run().is_err());
    }

    #[test]
    fn cancelled_run_dispatches_nothing() {
        let store = store();
        store.create_task(NewTask::new("a", "SPEC-1", "a")).expect("task");
        let runner = FakeRunner::new(Arc::clone(&store));
        let cancel = CancelToken::new();
        cancel.cancel();

        let summary = Scheduler::new(&store, &runner, SchedulerOptions::new(2))
            .with_cancel(cancel)
            .run()
            .expect("run");
        assert!(summary.dispatched.is_empty());
        assert!(summary.cancelled);
    }
}
