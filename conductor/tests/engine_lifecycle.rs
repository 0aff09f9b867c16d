use std::collections::BTreeMap;
use std::sync::Arc;

use conductor::core::types::{
    AgentRole, FailureReason, NewTask, Stage, TaskStatus, VerificationMethod,
};
use conductor::engine::Engine;
use conductor::io::config::{ConductorConfig, RoleConfig};
use conductor::io::executor::ExecRequest;
use conductor::io::store::NewSpec;
use conductor::pipeline::TaskOutcome;
use conductor::ralph::CancelToken;
use conductor::test_support::{ScriptedExecutor, ScriptedReply, ScriptedResolver, TestRepo};

const PROMISES: [&str; 4] = [
    "IMPLEMENTATION COMPLETE",
    "TESTS PASSED",
    "REVIEW PASSED",
    "QA PASSED",
];

fn requested_promise(request: &ExecRequest) -> &'static str {
    PROMISES
        .into_iter()
        .find(|p| request.prompt.contains(&format!("<promise>{p}</promise>")))
        .unwrap_or("NONE")
}

fn task_of(request: &ExecRequest) -> String {
    request
        .workdir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn config(max_parallel: usize, retries: u32, max_iterations: u32) -> ConductorConfig {
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
        max_parallel,
        roles,
        ..ConductorConfig::default()
    }
}

fn engine(
    repo: &TestRepo,
    config: ConductorConfig,
    executor: ScriptedExecutor,
    resolver: ScriptedResolver,
) -> Engine {
    let engine = Engine::with_capabilities(
        repo.path(),
        config,
        Arc::new(executor),
        Arc::new(resolver),
    )
    .expect("engine");
    engine
        .store()
        .create_spec(NewSpec::new("SPEC-1", "orchestrated work"))
        .expect("spec");
    engine
}

#[test]
fn dependent_task_is_not_ready_until_its_dependency_is_done() {
    let repo = TestRepo::new().expect("repo");
    let executor = ScriptedExecutor::from_fn(|request| {
        let promise = requested_promise(request);
        let reply = ScriptedExecutor::reply(&format!("ok\n<promise>{promise}</promise>"));
        if promise == PROMISES[0] {
            let task = task_of(request);
            reply.writes(&format!("{task}.txt"), &format!("{task}\n"))
        } else {
            reply
        }
    });
    let engine = engine(&repo, config(4, 1, 2), executor, ScriptedResolver::new());
    let store = engine.store();
    store
        .create_task(NewTask::new("TASK-00", "SPEC-1", "foundation"))
        .expect("task");
    store
        .create_task(NewTask::new("TASK-01", "SPEC-1", "building").with_dependencies(["TASK-00"]))
        .expect("task");

    let ready: Vec<String> = store
        .list_ready_tasks(None)
        .expect("ready")
        .into_iter()
        .map(|task| task.id)
        .collect();
    assert_eq!(ready, vec!["TASK-00"]);

    let summary = engine
        .execute(engine.default_options(), CancelToken::new())
        .expect("execute");
    assert!(summary.all_done(), "{summary:?}");
    assert_eq!(summary.dispatched, vec!["TASK-00", "TASK-01"]);
    for id in ["TASK-00", "TASK-01"] {
        assert_eq!(store.require_task(id).expect("task").status, TaskStatus::Done);
        assert_eq!(repo.read(&format!("{id}.txt")).expect("merged"), format!("{id}\n"));
    }
    assert!(engine.worktrees().list().expect("worktrees").is_empty());
    assert!(store.list_agents().expect("agents").is_empty());
}

#[test]
fn rejected_promises_exhaust_the_loop_and_reset_the_task() {
    let repo = TestRepo::new().expect("repo");
    let executor =
        ScriptedExecutor::from_fn(|_| ScriptedExecutor::reply("still thinking about it"));
    let engine = engine(&repo, config(1, 1, 3), executor, ScriptedResolver::new());
    let store = engine.store();
    store
        .create_task(NewTask::new("T-1", "SPEC-1", "never finishes"))
        .expect("task");

    let summary = engine
        .execute(engine.default_options(), CancelToken::new())
        .expect("execute");
    assert!(!summary.all_done());
    assert_eq!(
        summary.reports[0].outcome,
        TaskOutcome::StageFailed {
            stage: Stage::Implementing,
            reason: FailureReason::StageRetriesExhausted,
            iterations: 3,
        }
    );

    let task = store.require_task("T-1").expect("task");
    assert_eq!(task.status, TaskStatus::Todo);
    assert_eq!(task.iteration, 3);
    let failure = task.failure.expect("failure recorded");
    assert_eq!(failure.stage, Stage::Implementing);
    assert_eq!(failure.iterations_used, 3);
    assert_eq!(failure.last_output, "still thinking about it");
    assert!(engine.loops().status().expect("loops").is_empty());
}

#[test]
fn second_conflicting_merge_escalates_to_regeneration() {
    let repo = TestRepo::new().expect("repo");
    repo.write("a.txt", "base a\n").expect("write");
    repo.write("b.txt", "base b\n").expect("write");
    repo.commit_all("base files").expect("commit");

    let executor = ScriptedExecutor::from_fn(|request| {
        let promise = requested_promise(request);
        let reply = ScriptedExecutor::reply(&format!("ok\n<promise>{promise}</promise>"));
        if promise == PROMISES[0] {
            let task = task_of(request);
            reply
                .writes("a.txt", &format!("a from {task}\n"))
                .writes("b.txt", &format!("b from {task}\n"))
        } else {
            reply
        }
    });
    let resolver = ScriptedResolver::new()
        .resolves("a.txt", "a from both\n")
        .resolves("b.txt", "<<<<<<< HEAD\nstill torn\n=======\nno\n>>>>>>> theirs\n")
        .regenerates("b.txt", "b rebuilt from both\n");
    let engine = engine(&repo, config(2, 1, 2), executor, resolver);
    let store = engine.store();
    store
        .create_task(NewTask::new("T-1", "SPEC-1", "left"))
        .expect("task");
    store
        .create_task(NewTask::new("T-2", "SPEC-1", "right"))
        .expect("task");

    let summary = engine
        .execute(engine.default_options(), CancelToken::new())
        .expect("execute");
    assert!(summary.all_done(), "{summary:?}");

    let mut merges: Vec<_> = summary
        .reports
        .iter()
        .map(|report| match &report.outcome {
            TaskOutcome::Done { merge } => merge.clone(),
            other => panic!("unexpected outcome {other:?}"),
        })
        .collect();
    merges.sort_by_key(|merge| merge.tier);
    assert_eq!(merges[0].tier, 1);
    assert_eq!(merges[1].tier, 3);
    assert_eq!(merges[1].resolved_files, vec!["a.txt"]);
    assert_eq!(merges[1].regenerated_files, vec!["b.txt"]);

    assert_eq!(repo.read("a.txt").expect("a"), "a from both\n");
    assert_eq!(repo.read("b.txt").expect("b"), "b rebuilt from both\n");
    let status = repo
        .git(&["status", "--porcelain", "--untracked-files=no"])
        .expect("status");
    assert!(status.trim().is_empty(), "{status}");
}

#[test]
fn failing_external_check_rejects_exact_promises() {
    let repo = TestRepo::new().expect("repo");
    let mut config = config(1, 1, 2);
    if let Some(coder) = config.roles.get_mut(&AgentRole::Coder) {
        coder.verification = Some(VerificationMethod::External {
            command: "exit 1".to_string(),
            expected_exit_code: 0,
            forbidden_output: None,
            timeout_secs: 30,
        });
    }
    let executor = ScriptedExecutor::from_fn(|request| {
        let promise = requested_promise(request);
        ScriptedExecutor::reply(&format!("all good\n<promise>{promise}</promise>"))
    });
    let engine = engine(&repo, config, executor, ScriptedResolver::new());
    engine
        .store()
        .create_task(NewTask::new("T-1", "SPEC-1", "unverifiable"))
        .expect("task");

    let summary = engine
        .execute(engine.default_options(), CancelToken::new())
        .expect("execute");
    assert!(matches!(
        summary.reports[0].outcome,
        TaskOutcome::StageFailed {
            stage: Stage::Implementing,
            iterations: 2,
            ..
        }
    ));
    let logs = engine.store().execution_logs("T-1").expect("logs");
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].success);
    assert!(logs[0].output.contains("<promise>IMPLEMENTATION COMPLETE</promise>"));
}

#[test]
fn every_stage_reaches_the_change_log() {
    let repo = TestRepo::new().expect("repo");
    let executor = ScriptedExecutor::from_fn(|request| -> ScriptedReply {
        let promise = requested_promise(request);
        ScriptedExecutor::reply(&format!("<promise>{promise}</promise>"))
            .writes("out.txt", "done\n")
    });
    let engine = engine(&repo, config(1, 1, 1), executor, ScriptedResolver::new());
    engine
        .store()
        .create_task(NewTask::new("T-1", "SPEC-1", "logged"))
        .expect("task");
    engine
        .execute(engine.default_options(), CancelToken::new())
        .expect("execute");

    let log = engine.store().changelog().expect("change log configured");
    let statuses: Vec<String> = log
        .read_all()
        .expect("records")
        .into_iter()
        .filter(|record| record.entity_id == "T-1")
        .filter_map(|record| {
            record
                .data
                .get("status")
                .and_then(|status| status.as_str())
                .map(str::to_string)
        })
        .collect();
    for status in ["todo", "implementing", "testing", "reviewing", "done"] {
        assert!(statuses.iter().any(|s| s == status), "missing {status} in {statuses:?}");
    }
}
