//! Multi-agent development orchestrator CLI.
//!
//! Operates on the repository in the current directory. State lives in
//! `.conductor/` (config, SQLite database, change log); task worktrees live
//! under the configured worktree directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use conductor::control::{Control, ControlResult};
use conductor::core::types::{AgentRole, NewTask, SpecStatus, Task, TaskStatus, TaskUpdate};
use conductor::engine::Engine;
use conductor::exit_codes;
use conductor::io::completion::load_completion_spec;
use conductor::io::init::{InitOptions, init_workspace};
use conductor::io::store::{NewSpec, SpecUpdate};
use conductor::logging;
use conductor::pipeline::TaskOutcome;
use conductor::ralph::CancelToken;
use conductor::scheduler::SchedulerOptions;

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Run specs through a coder/tester/reviewer agent pipeline"
)]
struct Cli {
    /// Print structured `{success, data, error}` JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    /// Show scheduler progress on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.conductor/` with a default config and an empty database.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Create a spec that groups tasks.
    SpecCreate {
        id: String,
        title: String,
        #[arg(long, default_value = "draft")]
        status: SpecStatus,
        #[arg(long)]
        source_type: Option<String>,
    },
    /// Change a spec's lifecycle status.
    SpecStatus { id: String, status: SpecStatus },
    /// List specs.
    Specs,
    /// Create a task in `todo`.
    TaskCreate {
        id: String,
        #[arg(long)]
        spec: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        /// 1 (highest) to 3 (lowest).
        #[arg(long, default_value_t = 2)]
        priority: u8,
        /// Comma-separated task ids that must be `done` first.
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
        /// JSON file with the task's completion spec.
        #[arg(long)]
        completion_spec: Option<PathBuf>,
    },
    /// Edit a task's descriptive fields.
    TaskUpdate {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<u8>,
        /// Replace the dependency set (comma-separated).
        #[arg(long, value_delimiter = ',', conflicts_with = "clear_dependencies")]
        depends_on: Option<Vec<String>>,
        #[arg(long)]
        clear_dependencies: bool,
        #[arg(long, conflicts_with = "clear_completion_spec")]
        completion_spec: Option<PathBuf>,
        #[arg(long)]
        clear_completion_spec: bool,
    },
    /// Move a task along the pipeline by hand.
    SetStatus { id: String, status: TaskStatus },
    /// Show one task.
    Show { id: String },
    /// List tasks.
    ListTasks {
        #[arg(long)]
        spec: Option<String>,
        #[arg(long)]
        status: Option<TaskStatus>,
    },
    /// List tasks that can be dispatched now, in dispatch order.
    Ready {
        #[arg(long)]
        spec: Option<String>,
    },
    /// Show a task's execution history.
    Logs { id: String },
    /// Dispatch ready tasks through the pipeline until nothing can run.
    Execute {
        #[arg(long)]
        spec: Option<String>,
        #[arg(long)]
        task: Option<String>,
        /// Overrides `max_parallel` from the config.
        #[arg(long)]
        max_parallel: Option<usize>,
    },
    /// Register an agent as working on a task.
    AgentStart {
        task: String,
        #[arg(long)]
        role: AgentRole,
        #[arg(long, default_value_t = 0)]
        slot: usize,
    },
    AgentStop { task: String },
    /// List active agents.
    Agents,
    /// Show running completion loops.
    RalphStatus,
    /// Ask the completion loop of a task to stop after its current iteration.
    RalphCancel { task: String },
    WorktreeCreate {
        task: String,
        /// Base ref (default: target branch).
        #[arg(long)]
        base: Option<String>,
    },
    WorktreeRemove {
        task: String,
        #[arg(long)]
        keep_branch: bool,
    },
    WorktreeList,
    WorktreeCommit {
        task: String,
        #[arg(short, long)]
        message: String,
    },
    /// Merge a `reviewing` task into the target branch.
    MergeTask { task: String },
    /// Rewrite the change log from the database.
    SyncExport,
    /// Load a change log into the database.
    SyncImport {
        /// Change log to read (default: the configured one).
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// Collapse the change log to one record per entity.
    SyncCompact,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let root = std::env::current_dir().context("resolve current directory")?;
    if let Command::Init { force } = cli.command {
        return cmd_init(&root, force, cli.json);
    }
    let control = Control::new(Engine::open(&root)?);
    dispatch(&control, cli.command, cli.json)
}

fn cmd_init(root: &Path, force: bool, json: bool) -> Result<i32> {
    let result = ControlResult::from_result(
        init_workspace(root, &InitOptions { force }).map(|paths| paths.config_path),
    );
    emit(&result, json, |path| format!("initialized {}", path.display()))
}

fn dispatch(control: &Control, command: Command, json: bool) -> Result<i32> {
    match command {
        Command::Init { force } => cmd_init(control.engine().root(), force, json),
        Command::SpecCreate {
            id,
            title,
            status,
            source_type,
        } => {
            let mut new = NewSpec::new(id, title);
            new.status = status;
            new.source_type = source_type;
            emit(&control.create_spec(new), json, |spec| {
                format!("{}\t{}\t{}", spec.id, spec.status, spec.title)
            })
        }
        Command::SpecStatus { id, status } => {
            let update = SpecUpdate {
                status: Some(status),
                ..Default::default()
            };
            emit(&control.update_spec(&id, update), json, |spec| {
                format!("{}\t{}", spec.id, spec.status)
            })
        }
        Command::Specs => emit(&control.list_specs(None), json, |specs| {
            specs
                .iter()
                .map(|spec| format!("{}\t{}\t{}", spec.id, spec.status, spec.title))
                .collect::<Vec<_>>()
                .join("\n")
        }),
        Command::TaskCreate {
            id,
            spec,
            title,
            description,
            priority,
            depends_on,
            completion_spec,
        } => {
            let mut new = NewTask::new(id, spec, title)
                .with_priority(priority)
                .with_dependencies(depends_on);
            new.description = description;
            if let Some(path) = completion_spec {
                new = new.with_completion_spec(load_completion_spec(&path)?);
            }
            emit(&control.create_task(new), json, task_line)
        }
        Command::TaskUpdate {
            id,
            title,
            description,
            priority,
            depends_on,
            clear_dependencies,
            completion_spec,
            clear_completion_spec,
        } => {
            let completion_spec = match completion_spec {
                Some(path) => Some(Some(load_completion_spec(&path)?)),
                None if clear_completion_spec => Some(None),
                None => None,
            };
            let dependencies = match depends_on {
                Some(deps) => Some(deps.into_iter().collect()),
                None if clear_dependencies => Some(Default::default()),
                None => None,
            };
            let update = TaskUpdate {
                title,
                description,
                priority,
                dependencies,
                assignee: None,
                completion_spec,
            };
            emit(&control.update_task(&id, update), json, task_line)
        }
        Command::SetStatus { id, status } => {
            emit(&control.update_task_status(&id, status), json, task_line)
        }
        Command::Show { id } => emit(&control.get_task(&id), json, task_details),
        Command::ListTasks { spec, status } => {
            emit(&control.list_tasks(spec.as_deref(), status), json, |tasks| task_lines(tasks))
        }
        Command::Ready { spec } => {
            emit(&control.list_ready_tasks(spec.as_deref()), json, |tasks| task_lines(tasks))
        }
        Command::Logs { id } => emit(&control.execution_logs(&id), json, |logs| {
            logs.iter()
                .map(|log| {
                    format!(
                        "{}\t{}\tattempt {}\t{}\t{}ms",
                        log.created_at.to_rfc3339(),
                        log.stage,
                        log.attempt,
                        if log.success { "ok" } else { "failed" },
                        log.duration_ms
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        }),
        Command::Execute {
            spec,
            task,
            max_parallel,
        } => {
            let mut options = control.engine().default_options();
            if let Some(max_parallel) = max_parallel {
                options.max_parallel = max_parallel;
            }
            options.spec_id = spec;
            options.task_id = task;
            cmd_execute(control, options, json)
        }
        Command::AgentStart { task, role, slot } => {
            emit(&control.agent_start(&task, role, slot), json, |agent| {
                format!("{}\t{}\tslot {}", agent.task_id, agent.role, agent.slot)
            })
        }
        Command::AgentStop { task } => emit(&control.agent_stop(&task), json, |agent| match agent {
            Some(agent) => format!("stopped {} ({})", agent.task_id, agent.role),
            None => format!("no agent registered for {task}"),
        }),
        Command::Agents => emit(&control.list_agents(), json, |agents| {
            agents
                .iter()
                .map(|agent| {
                    format!(
                        "{}\t{}\tslot {}\tsince {}",
                        agent.task_id,
                        agent.role,
                        agent.slot,
                        agent.started_at.to_rfc3339()
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        }),
        Command::RalphStatus => emit(&control.ralph_status(), json, |loops| {
            loops
                .iter()
                .map(|state| {
                    format!(
                        "{}\t{}\titeration {}/{}\t<promise>{}</promise>",
                        state.task_id,
                        state.stage,
                        state.iteration,
                        state.max_iterations,
                        state.promise
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        }),
        Command::RalphCancel { task } => emit(&control.ralph_cancel(&task), json, |found| {
            if *found {
                format!("cancel requested for {task}")
            } else {
                format!("no running loop for {task}")
            }
        }),
        Command::WorktreeCreate { task, base } => {
            emit(&control.worktree_create(&task, base.as_deref()), json, |info| {
                format!("{}\t{}", info.branch, info.path.display())
            })
        }
        Command::WorktreeRemove { task, keep_branch } => {
            emit(&control.worktree_remove(&task, keep_branch), json, |_| {
                format!("removed worktree for {task}")
            })
        }
        Command::WorktreeList => emit(&control.worktree_list(), json, |worktrees| {
            worktrees
                .iter()
                .map(|info| {
                    let busy = if info.busy { "\tbusy" } else { "" };
                    format!("{}\t{}\t{}{busy}", info.task_id, info.branch, info.path.display())
                })
                .collect::<Vec<_>>()
                .join("\n")
        }),
        Command::WorktreeCommit { task, message } => {
            emit(&control.worktree_commit(&task, &message), json, |committed| {
                if *committed {
                    "committed".to_string()
                } else {
                    "nothing to commit".to_string()
                }
            })
        }
        Command::MergeTask { task } => {
            let result = control.merge_task(&task);
            let merged = result.data.as_ref().is_some_and(|outcome| outcome.is_done());
            let code = emit(&result, json, |outcome| format!("{task}: {}", outcome_text(outcome)))?;
            Ok(if code == exit_codes::OK && !merged {
                exit_codes::INCOMPLETE
            } else {
                code
            })
        }
        Command::SyncExport => emit(&control.sync_export(), json, |count| {
            format!("exported {count} records")
        }),
        Command::SyncImport { from } => emit(&control.sync_import(from.as_deref()), json, |s| {
            format!("imported {} specs, {} tasks", s.specs, s.tasks)
        }),
        Command::SyncCompact => emit(&control.sync_compact(), json, |count| {
            format!("compacted change log to {count} records")
        }),
    }
}

fn cmd_execute(control: &Control, options: SchedulerOptions, json: bool) -> Result<i32> {
    let result = control.execute(options, CancelToken::new());
    let all_done = result.data.as_ref().is_some_and(|summary| summary.all_done());
    let code = emit(&result, json, |summary| {
        let mut lines: Vec<String> = summary
            .reports
            .iter()
            .map(|report| format!("{}\t{}", report.task_id, outcome_text(&report.outcome)))
            .collect();
        lines.extend(
            summary
                .dispatch_errors
                .iter()
                .map(|err| format!("{}\tnot dispatched: {}", err.task_id, err.message)),
        );
        if summary.dispatched.is_empty() {
            lines.push("no ready tasks".to_string());
        }
        lines.join("\n")
    })?;
    Ok(if code == exit_codes::OK && !all_done {
        exit_codes::INCOMPLETE
    } else {
        code
    })
}

/// Print a result and map it to an exit code.
fn emit<T: Serialize>(
    result: &ControlResult<T>,
    json: bool,
    human: impl FnOnce(&T) -> String,
) -> Result<i32> {
    if json {
        println!("{}", result.to_json()?);
    } else if let Some(data) = &result.data {
        let text = human(data);
        if !text.is_empty() {
            println!("{text}");
        }
    }
    let Some(error) = &result.error else {
        return Ok(exit_codes::OK);
    };
    if !json {
        eprintln!("error [{}]: {}", error.code, error.message);
    }
    Ok(if error.validation {
        exit_codes::INVALID
    } else {
        exit_codes::FAILED
    })
}

fn outcome_text(outcome: &TaskOutcome) -> String {
    match outcome {
        TaskOutcome::Done { merge } => format!("done (merged at tier {})", merge.tier),
        TaskOutcome::StageFailed {
            stage,
            reason,
            iterations,
        } => format!("{stage} failed: {reason} after {iterations} iterations"),
        TaskOutcome::MergeFailed { tier, message } => {
            format!("merge failed at tier {tier}: {message}")
        }
        TaskOutcome::Error { message } => format!("error: {message}"),
    }
}

fn task_line(task: &Task) -> String {
    format!(
        "{}\t{}\tp{}\t{}",
        task.id, task.status, task.priority, task.title
    )
}

fn task_lines(tasks: &[Task]) -> String {
    tasks.iter().map(task_line).collect::<Vec<_>>().join("\n")
}

fn task_details(task: &Task) -> String {
    let mut lines = vec![
        format!("id:          {}", task.id),
        format!("spec:        {}", task.spec_id),
        format!("title:       {}", task.title),
        format!("status:      {}", task.status),
        format!("priority:    {}", task.priority),
        format!("iteration:   {}", task.iteration),
    ];
    if !task.dependencies.is_empty() {
        let deps: Vec<&str> = task.dependencies.iter().map(String::as_str).collect();
        lines.push(format!("depends on:  {}", deps.join(", ")));
    }
    if let Some(role) = task.assignee {
        lines.push(format!("assignee:    {role}"));
    }
    if let Some(worktree) = &task.worktree {
        lines.push(format!("worktree:    {worktree}"));
    }
    if let Some(failure) = &task.failure {
        lines.push(format!(
            "failure:     {} at {} ({} iterations)",
            failure.reason, failure.stage, failure.iterations_used
        ));
    }
    if let Some(merge) = &task.merge_failure {
        lines.push(format!("merge:       tier {} failed: {}", merge.tier, merge.message));
    }
    if !task.description.is_empty() {
        lines.push(String::new());
        lines.push(task.description.clone());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["conductor", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
        assert!(!cli.json);
    }

    #[test]
    fn parse_task_create_with_dependencies() {
        let cli = Cli::parse_from([
            "conductor", "task-create", "T-3", "--spec", "SPEC-1", "--title", "wire it",
            "--priority", "1", "--depends-on", "T-1,T-2",
        ]);
        let Command::TaskCreate {
            id,
            priority,
            depends_on,
            ..
        } = cli.command
        else {
            panic!("expected task-create");
        };
        assert_eq!(id, "T-3");
        assert_eq!(priority, 1);
        assert_eq!(depends_on, vec!["T-1", "T-2"]);
    }

    #[test]
    fn parse_status_values() {
        let cli = Cli::parse_from(["conductor", "--json", "set-status", "T-1", "reviewing"]);
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Command::SetStatus { status: TaskStatus::Reviewing, .. }
        ));
        assert!(Cli::try_parse_from(["conductor", "set-status", "T-1", "finished"]).is_err());
    }

    #[test]
    fn parse_execute_filters() {
        let cli = Cli::parse_from([
            "conductor", "execute", "--spec", "SPEC-1", "--max-parallel", "2", "-v",
        ]);
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Command::Execute { max_parallel: Some(2), task: None, .. }
        ));
    }

    #[test]
    fn update_flags_conflict() {
        let parsed = Cli::try_parse_from([
            "conductor", "task-update", "T-1", "--depends-on", "T-2", "--clear-dependencies",
        ]);
        assert!(parsed.is_err());
    }
}
