//! SQLite-backed task store.
//!
//! The store is the only scheduling truth. Every task mutation is a
//! read-modify-write inside one transaction under the connection lock, so
//! concurrent writers to the same row serialize and none is lost. Mutations
//! are mirrored to the optional [`ChangeLog`] while the lock is still held,
//! which keeps change-log order identical to commit order.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::core::errors::OrchestratorError;
use crate::core::graph::{DependencyGraph, find_cycle};
use crate::core::ready::{pending_dependencies, select_ready};
use crate::core::transitions::{Transition, classify};
use crate::core::types::{
    ActiveAgent, AgentRole, ExecutionLog, FailureInfo, MergeFailure, NewExecutionLog, NewTask,
    RalphLoopState, Spec, SpecStatus, Task, TaskStatus, TaskUpdate, is_safe_id,
};
use crate::io::changelog::{ChangeLog, ChangeType, EntityType, Replay};

/// Execution log output is truncated to this many bytes.
pub const EXECUTION_OUTPUT_LIMIT: usize = 10_000;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS specs (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    status TEXT NOT NULL,
    source_type TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tasks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    spec_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    priority INTEGER NOT NULL,
    dependencies TEXT NOT NULL DEFAULT '[]',
    assignee TEXT,
    worktree TEXT,
    iteration INTEGER NOT NULL DEFAULT 0,
    completion_spec TEXT,
    failure TEXT,
    merge_failure TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_spec_status ON tasks(spec_id, status);
CREATE TABLE IF NOT EXISTS execution_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    role TEXT NOT NULL,
    stage TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    output TEXT NOT NULL,
    success INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_execution_logs_task ON execution_logs(task_id);
CREATE TABLE IF NOT EXISTS active_agents (
    task_id TEXT PRIMARY KEY,
    role TEXT NOT NULL,
    slot INTEGER NOT NULL,
    worktree TEXT,
    started_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ralph_loops (
    task_id TEXT PRIMARY KEY,
    stage TEXT NOT NULL,
    iteration INTEGER NOT NULL,
    max_iterations INTEGER NOT NULL,
    promise TEXT NOT NULL,
    started_at TEXT NOT NULL,
    cancel_requested INTEGER NOT NULL DEFAULT 0
);
";

const TASK_COLUMNS: &str = "seq, id, spec_id, title, description, status, priority, dependencies, \
     assignee, worktree, iteration, completion_spec, failure, merge_failure, created_at, updated_at";

const TASK_ORDER: &str = "ORDER BY priority ASC, created_at ASC, seq ASC";

/// Input for spec creation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSpec {
    pub id: String,
    pub title: String,
    pub status: SpecStatus,
    pub source_type: Option<String>,
    pub metadata: Map<String, Value>,
}

impl NewSpec {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: SpecStatus::Draft,
            source_type: None,
            metadata: Map::new(),
        }
    }
}

/// Partial spec update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecUpdate {
    pub title: Option<String>,
    pub status: Option<SpecStatus>,
    pub metadata: Option<Map<String, Value>>,
}

/// Counts of entities written by a change-log import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub specs: usize,
    pub tasks: usize,
}

pub struct TaskStore {
    conn: Mutex<Connection>,
    changelog: Option<ChangeLog>,
}

impl TaskStore {
    /// Open (or create) the database at `path`.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("open database {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("set busy timeout")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory database")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("create schema")?;
        let version: Option<i64> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()
            .context("read schema version")?;
        match version {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )
                .context("write schema version")?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(anyhow!(
                    "database schema version {v} is newer than supported {SCHEMA_VERSION}"
                ));
            }
            Some(_) => {}
        }
        debug!(version = SCHEMA_VERSION, "schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
            changelog: None,
        })
    }

    /// Mirror every subsequent mutation to `log`.
    pub fn with_changelog(mut self, log: ChangeLog) -> Self {
        self.changelog = Some(log);
        self
    }

    pub fn changelog(&self) -> Option<&ChangeLog> {
        self.changelog.as_ref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))
    }

    fn mirror<T: Serialize>(&self, entity: EntityType, id: &str, change: ChangeType, value: &T) {
        let Some(log) = &self.changelog else {
            return;
        };
        let result = serde_json::to_value(value)
            .map_err(anyhow::Error::from)
            .and_then(|data| log.record(entity, id, change, data));
        if let Err(err) = result {
            warn!(entity_id = id, err = %format!("{err:#}"), "change log append failed");
        }
    }

    // ---- specs ----

    #[instrument(skip_all, fields(spec_id = %new.id))]
    pub fn create_spec(&self, new: NewSpec) -> Result<Spec> {
        if !is_safe_id(&new.id) {
            return Err(OrchestratorError::InvalidTaskId(new.id).into());
        }
        let now = now();
        let spec = Spec {
            id: new.id,
            title: new.title,
            status: new.status,
            source_type: new.source_type,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };
        let conn = self.lock()?;
        if load_spec(&conn, &spec.id)?.is_some() {
            return Err(anyhow!("spec already exists: {}", spec.id));
        }
        write_spec(&conn, &spec)?;
        self.mirror(EntityType::Spec, &spec.id, ChangeType::Create, &spec);
        info!("spec created");
        Ok(spec)
    }

    pub fn get_spec(&self, id: &str) -> Result<Option<Spec>> {
        let conn = self.lock()?;
        load_spec(&conn, id)
    }

    pub fn list_specs(&self, status: Option<SpecStatus>) -> Result<Vec<Spec>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, status, source_type, metadata, created_at, updated_at
             FROM specs WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![status.map(SpecStatus::as_str)], SpecRow::from_row)?;
        let specs = rows
            .map(|row| row.context("read spec row")?.into_spec())
            .collect::<Result<Vec<_>>>();
        specs
    }

    pub fn update_spec(&self, id: &str, update: SpecUpdate) -> Result<Spec> {
        let conn = self.lock()?;
        let mut spec =
            load_spec(&conn, id)?.ok_or_else(|| OrchestratorError::UnknownSpec(id.to_string()))?;
        if let Some(title) = update.title {
            spec.title = title;
        }
        if let Some(status) = update.status {
            spec.status = status;
        }
        if let Some(metadata) = update.metadata {
            spec.metadata = metadata;
        }
        spec.updated_at = now();
        write_spec(&conn, &spec)?;
        self.mirror(EntityType::Spec, id, ChangeType::Update, &spec);
        Ok(spec)
    }

    // ---- tasks ----

    pub fn create_task(&self, new: NewTask) -> Result<Task> {
        let mut created = self.create_tasks(vec![new])?;
        created
            .pop()
            .ok_or_else(|| anyhow!("task creation returned nothing"))
    }

    /// Create a batch of tasks atomically.
    ///
    /// Tasks in the batch may depend on each other. Either every task is
    /// created or none is.
    #[instrument(skip_all, fields(count = batch.len()))]
    pub fn create_tasks(&self, batch: Vec<NewTask>) -> Result<Vec<Task>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut graph = load_graph(&tx)?;
        let mut batch_ids = BTreeSet::new();
        for new in &batch {
            if !is_safe_id(&new.id) {
                return Err(OrchestratorError::InvalidTaskId(new.id.clone()).into());
            }
            if !(1..=3).contains(&new.priority) {
                return Err(OrchestratorError::InvalidPriority {
                    task_id: new.id.clone(),
                    priority: new.priority,
                }
                .into());
            }
            if graph.contains_key(&new.id) || !batch_ids.insert(new.id.clone()) {
                return Err(OrchestratorError::DuplicateTask(new.id.clone()).into());
            }
            if load_spec(&tx, &new.spec_id)?.is_none() {
                return Err(OrchestratorError::UnknownSpec(new.spec_id.clone()).into());
            }
        }
        for new in &batch {
            if let Some(unknown) = new
                .dependencies
                .iter()
                .find(|dep| !graph.contains_key(*dep) && !batch_ids.contains(*dep))
            {
                return Err(OrchestratorError::UnknownTask(unknown.clone()).into());
            }
            graph.insert(new.id.clone(), new.dependencies.clone());
        }
        for new in &batch {
            if let Some(cycle) = find_cycle(&graph, &new.id, &new.dependencies) {
                return Err(OrchestratorError::CyclicDependency {
                    task_id: new.id.clone(),
                    cycle,
                }
                .into());
            }
        }

        let now = now();
        let mut created = Vec::with_capacity(batch.len());
        for new in batch {
            let mut task = Task {
                id: new.id,
                spec_id: new.spec_id,
                title: new.title,
                description: new.description,
                status: TaskStatus::Todo,
                priority: new.priority,
                dependencies: new.dependencies,
                assignee: new.assignee,
                worktree: None,
                iteration: 0,
                completion_spec: new.completion_spec,
                failure: None,
                merge_failure: None,
                created_at: now,
                updated_at: now,
                seq: 0,
            };
            task.seq = insert_task(&tx, &task)?;
            created.push(task);
        }
        tx.commit().context("commit task creation")?;

        for task in &created {
            self.mirror(EntityType::Task, &task.id, ChangeType::Create, task);
        }
        info!(count = created.len(), "tasks created");
        Ok(created)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.lock()?;
        load_task(&conn, id)
    }

    /// Like [`TaskStore::get_task`], but a missing task is `UnknownTask`.
    pub fn require_task(&self, id: &str) -> Result<Task> {
        self.get_task(id)?
            .ok_or_else(|| OrchestratorError::UnknownTask(id.to_string()).into())
    }

    /// Tasks filtered by spec and status, in dispatch order.
    pub fn list_tasks(&self, spec_id: Option<&str>, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        query_tasks(
            &conn,
            "WHERE (?1 IS NULL OR spec_id = ?1) AND (?2 IS NULL OR status = ?2)",
            params![spec_id, status.map(TaskStatus::as_str)],
        )
    }

    /// `todo` tasks whose dependencies are all `done`, in dispatch order.
    ///
    /// `None` spans every active spec (not completed or archived).
    pub fn list_ready_tasks(&self, spec_id: Option<&str>) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let candidates = query_tasks(
            &conn,
            "WHERE status = 'todo' AND ((?1 IS NULL AND spec_id IN \
             (SELECT id FROM specs WHERE status NOT IN ('completed', 'archived'))) OR spec_id = ?1)",
            params![spec_id],
        )?;
        let done = done_ids(&conn)?;
        Ok(select_ready(candidates, &done))
    }

    /// Update descriptive fields. Dependency changes re-run the cycle check.
    #[instrument(skip_all, fields(task_id = id))]
    pub fn update_task(&self, id: &str, update: TaskUpdate) -> Result<Task> {
        self.mutate_task(id, |conn, task| {
            let mut changed = false;
            if let Some(priority) = update.priority {
                if !(1..=3).contains(&priority) {
                    return Err(OrchestratorError::InvalidPriority {
                        task_id: task.id.clone(),
                        priority,
                    }
                    .into());
                }
                changed |= replace(&mut task.priority, priority);
            }
            if let Some(deps) = update.dependencies {
                let graph = load_graph(conn)?;
                if let Some(unknown) = deps.iter().find(|dep| !graph.contains_key(*dep)) {
                    return Err(OrchestratorError::UnknownTask(unknown.clone()).into());
                }
                if let Some(cycle) = find_cycle(&graph, &task.id, &deps) {
                    return Err(OrchestratorError::CyclicDependency {
                        task_id: task.id.clone(),
                        cycle,
                    }
                    .into());
                }
                changed |= replace(&mut task.dependencies, deps);
            }
            if let Some(title) = update.title {
                changed |= replace(&mut task.title, title);
            }
            if let Some(description) = update.description {
                changed |= replace(&mut task.description, description);
            }
            if let Some(assignee) = update.assignee {
                changed |= replace(&mut task.assignee, assignee);
            }
            if let Some(spec) = update.completion_spec {
                changed |= replace(&mut task.completion_spec, spec);
            }
            Ok(changed)
        })
    }

    /// Move a task along the pipeline.
    ///
    /// Re-applying the current status is a no-op: nothing is written, the
    /// timestamp is untouched and no change-log line is emitted.
    #[instrument(skip_all, fields(task_id = id, to = %status))]
    pub fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<Task> {
        self.mutate_task(id, |conn, task| {
            if status == TaskStatus::Done && task.status != TaskStatus::Done {
                return Err(OrchestratorError::CompletionRequiresMerge(task.id.clone()).into());
            }
            match classify(task.status, status) {
                Transition::NoOp => return Ok(false),
                Transition::Illegal => {
                    return Err(OrchestratorError::InvalidTransition {
                        task_id: task.id.clone(),
                        from: task.status,
                        to: status,
                    }
                    .into());
                }
                Transition::Legal => {}
            }
            if status == TaskStatus::Implementing {
                let pending = pending_dependencies(task, &done_ids(conn)?);
                if !pending.is_empty() {
                    return Err(OrchestratorError::DependenciesNotDone {
                        task_id: task.id.clone(),
                        pending,
                    }
                    .into());
                }
            }
            debug!(from = %task.status, "status change");
            task.status = status;
            Ok(true)
        })
    }

    pub fn set_iteration(&self, id: &str, iteration: u32) -> Result<Task> {
        self.mutate_task(id, |_, task| Ok(replace(&mut task.iteration, iteration)))
    }

    pub fn set_worktree(&self, id: &str, worktree: Option<String>) -> Result<Task> {
        self.mutate_task(id, |_, task| Ok(replace(&mut task.worktree, worktree)))
    }

    pub fn set_assignee(&self, id: &str, assignee: Option<AgentRole>) -> Result<Task> {
        self.mutate_task(id, |_, task| Ok(replace(&mut task.assignee, assignee)))
    }

    /// Attach failure diagnostics and send the task back to `todo`.
    #[instrument(skip_all, fields(task_id = id, stage = %failure.stage))]
    pub fn record_failure(&self, id: &str, mut failure: FailureInfo) -> Result<Task> {
        failure.last_output = truncate_utf8(&failure.last_output, EXECUTION_OUTPUT_LIMIT).to_string();
        self.mutate_task(id, |_, task| {
            if task.status == TaskStatus::Done {
                return Err(OrchestratorError::InvalidTransition {
                    task_id: task.id.clone(),
                    from: task.status,
                    to: TaskStatus::Todo,
                }
                .into());
            }
            warn!(reason = ?failure.reason, iterations = failure.iterations_used, "task failed");
            task.status = TaskStatus::Todo;
            task.assignee = None;
            task.failure = Some(failure);
            Ok(true)
        })
    }

    pub fn clear_failure(&self, id: &str) -> Result<Task> {
        self.mutate_task(id, |_, task| Ok(task.failure.take().is_some()))
    }

    pub fn record_merge_failure(&self, id: &str, failure: MergeFailure) -> Result<Task> {
        self.mutate_task(id, |_, task| {
            task.merge_failure = Some(failure);
            Ok(true)
        })
    }

    pub fn clear_merge_failure(&self, id: &str) -> Result<Task> {
        self.mutate_task(id, |_, task| Ok(task.merge_failure.take().is_some()))
    }

    /// Mark a merged task `done` and clear its failure annotations.
    #[instrument(skip_all, fields(task_id = id))]
    pub fn complete_task(&self, id: &str) -> Result<Task> {
        self.mutate_task(id, |_, task| {
            if classify(task.status, TaskStatus::Done) == Transition::Illegal {
                return Err(OrchestratorError::InvalidTransition {
                    task_id: task.id.clone(),
                    from: task.status,
                    to: TaskStatus::Done,
                }
                .into());
            }
            task.status = TaskStatus::Done;
            task.assignee = None;
            task.worktree = None;
            task.failure = None;
            task.merge_failure = None;
            Ok(true)
        })
    }

    /// Read-modify-write one task row in a single transaction.
    ///
    /// `f` returns whether it changed anything; unchanged tasks are not
    /// written and keep their `updated_at`.
    fn mutate_task<F>(&self, id: &str, f: F) -> Result<Task>
    where
        F: FnOnce(&Transaction<'_>, &mut Task) -> Result<bool>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut task =
            load_task(&tx, id)?.ok_or_else(|| OrchestratorError::UnknownTask(id.to_string()))?;
        let changed = f(&tx, &mut task)?;
        if changed {
            task.updated_at = now();
            update_task_row(&tx, &task)?;
        }
        tx.commit().with_context(|| format!("commit update of task {id}"))?;
        if changed {
            self.mirror(EntityType::Task, id, ChangeType::Update, &task);
        }
        Ok(task)
    }

    // ---- execution logs ----

    /// Append one execution record. Output beyond the limit is truncated.
    pub fn log_execution(&self, entry: NewExecutionLog) -> Result<i64> {
        let conn = self.lock()?;
        let output = truncate_utf8(&entry.output, EXECUTION_OUTPUT_LIMIT);
        conn.execute(
            "INSERT INTO execution_logs
               (task_id, role, stage, attempt, output, success, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.task_id,
                entry.role.as_str(),
                entry.stage.as_str(),
                i64::from(entry.attempt),
                output,
                entry.success,
                i64::try_from(entry.duration_ms).unwrap_or(i64::MAX),
                format_ts(&now()),
            ],
        )
        .with_context(|| format!("insert execution log for {}", entry.task_id))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn execution_logs(&self, task_id: &str) -> Result<Vec<ExecutionLog>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, role, stage, attempt, output, success, duration_ms, created_at
             FROM execution_logs WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, bool>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;
        let logs = rows
            .map(|row| -> Result<ExecutionLog> {
                let (id, task_id, role, stage, attempt, output, success, duration_ms, created_at) =
                    row.context("read execution log row")?;
                Ok(ExecutionLog {
                    id,
                    task_id,
                    role: role.parse()?,
                    stage: stage.parse()?,
                    attempt: u32::try_from(attempt).context("attempt out of range")?,
                    output,
                    success,
                    duration_ms: u64::try_from(duration_ms).unwrap_or(0),
                    created_at: parse_ts(&created_at)?,
                })
            })
            .collect::<Result<Vec<_>>>();
        logs
    }

    // ---- active agents ----

    pub fn register_agent(&self, agent: &ActiveAgent) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO active_agents (task_id, role, slot, worktree, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                agent.task_id,
                agent.role.as_str(),
                i64::try_from(agent.slot).unwrap_or(i64::MAX),
                agent.worktree,
                format_ts(&agent.started_at),
            ],
        )
        .with_context(|| format!("register agent for {}", agent.task_id))?;
        Ok(())
    }

    /// Returns whether a registration existed.
    pub fn deregister_agent(&self, task_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM active_agents WHERE task_id = ?1",
                params![task_id],
            )
            .with_context(|| format!("deregister agent for {task_id}"))?;
        Ok(removed > 0)
    }

    pub fn list_agents(&self) -> Result<Vec<ActiveAgent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, role, slot, worktree, started_at FROM active_agents
             ORDER BY started_at ASC, task_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let agents = rows
            .map(|row| -> Result<ActiveAgent> {
                let (task_id, role, slot, worktree, started_at) =
                    row.context("read agent row")?;
                Ok(ActiveAgent {
                    task_id,
                    role: role.parse()?,
                    slot: usize::try_from(slot).unwrap_or(0),
                    worktree,
                    started_at: parse_ts(&started_at)?,
                })
            })
            .collect::<Result<Vec<_>>>();
        agents
    }

    // ---- ralph loops ----

    pub fn upsert_loop(&self, state: &RalphLoopState) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ralph_loops (task_id, stage, iteration, max_iterations, promise, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(task_id) DO UPDATE SET
               stage = excluded.stage,
               iteration = excluded.iteration,
               max_iterations = excluded.max_iterations,
               promise = excluded.promise,
               started_at = excluded.started_at",
            params![
                state.task_id,
                state.stage.as_str(),
                i64::from(state.iteration),
                i64::from(state.max_iterations),
                state.promise,
                format_ts(&state.started_at),
            ],
        )
        .with_context(|| format!("record loop state for {}", state.task_id))?;
        Ok(())
    }

    pub fn remove_loop(&self, task_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM ralph_loops WHERE task_id = ?1", params![task_id])
            .with_context(|| format!("remove loop state for {task_id}"))?;
        Ok(())
    }

    pub fn list_loops(&self) -> Result<Vec<RalphLoopState>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, stage, iteration, max_iterations, promise, started_at
             FROM ralph_loops ORDER BY started_at ASC, task_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let loops = rows
            .map(|row| -> Result<RalphLoopState> {
                let (task_id, stage, iteration, max_iterations, promise, started_at) =
                    row.context("read loop row")?;
                Ok(RalphLoopState {
                    task_id,
                    stage: stage.parse()?,
                    iteration: u32::try_from(iteration).unwrap_or(0),
                    max_iterations: u32::try_from(max_iterations).unwrap_or(0),
                    promise,
                    started_at: parse_ts(&started_at)?,
                })
            })
            .collect::<Result<Vec<_>>>();
        loops
    }

    /// Flag a running loop for cancellation. Returns false if no loop runs.
    pub fn request_loop_cancel(&self, task_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE ralph_loops SET cancel_requested = 1 WHERE task_id = ?1",
                params![task_id],
            )
            .with_context(|| format!("cancel loop for {task_id}"))?;
        Ok(updated > 0)
    }

    pub fn loop_cancel_requested(&self, task_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let flag: Option<bool> = conn
            .query_row(
                "SELECT cancel_requested FROM ralph_loops WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("read cancel flag for {task_id}"))?;
        Ok(flag.unwrap_or(false))
    }

    // ---- change log sync ----

    /// Rewrite the change log as one `create` per spec and task.
    pub fn export_changelog(&self) -> Result<usize> {
        let log = self
            .changelog
            .as_ref()
            .ok_or_else(|| anyhow!("no change log configured"))?;
        let specs = self.list_specs(None)?;
        let tasks = self.list_tasks(None, None)?;
        log.export(&specs, &tasks)
    }

    /// Upsert replayed entities without re-validating transitions or
    /// mirroring them back to the change log.
    #[instrument(skip_all, fields(specs = state.specs.len(), tasks = state.tasks.len()))]
    pub fn import(&self, state: &Replay) -> Result<ImportSummary> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for spec in &state.specs {
            write_spec(&tx, spec)?;
        }
        for task in &state.tasks {
            if load_task(&tx, &task.id)?.is_some() {
                update_task_row(&tx, task)?;
            } else {
                insert_task(&tx, task)?;
            }
        }
        tx.commit().context("commit import")?;
        info!("change log imported");
        Ok(ImportSummary {
            specs: state.specs.len(),
            tasks: state.tasks.len(),
        })
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

/// Current time at the precision stored in the database.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("parse timestamp '{raw}'"))?
        .with_timezone(&Utc))
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("serialize column")
}

fn opt_json<T: Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value.map(to_json).transpose()
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_str(raw).with_context(|| format!("decode {what}"))
}

fn truncate_utf8(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

struct SpecRow {
    id: String,
    title: String,
    status: String,
    source_type: Option<String>,
    metadata: String,
    created_at: String,
    updated_at: String,
}

impl SpecRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            status: row.get(2)?,
            source_type: row.get(3)?,
            metadata: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_spec(self) -> Result<Spec> {
        Ok(Spec {
            status: self.status.parse()?,
            metadata: from_json(&self.metadata, "spec metadata")?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            title: self.title,
            source_type: self.source_type,
        })
    }
}

fn load_spec(conn: &Connection, id: &str) -> Result<Option<Spec>> {
    let row = conn
        .query_row(
            "SELECT id, title, status, source_type, metadata, created_at, updated_at
             FROM specs WHERE id = ?1",
            params![id],
            SpecRow::from_row,
        )
        .optional()
        .with_context(|| format!("load spec {id}"))?;
    row.map(SpecRow::into_spec).transpose()
}

fn write_spec(conn: &Connection, spec: &Spec) -> Result<()> {
    conn.execute(
        "INSERT INTO specs (id, title, status, source_type, metadata, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
           title = excluded.title,
           status = excluded.status,
           source_type = excluded.source_type,
           metadata = excluded.metadata,
           updated_at = excluded.updated_at",
        params![
            spec.id,
            spec.title,
            spec.status.as_str(),
            spec.source_type,
            to_json(&spec.metadata)?,
            format_ts(&spec.created_at),
            format_ts(&spec.updated_at),
        ],
    )
    .with_context(|| format!("write spec {}", spec.id))?;
    Ok(())
}

struct TaskRow {
    seq: i64,
    id: String,
    spec_id: String,
    title: String,
    description: String,
    status: String,
    priority: i64,
    dependencies: String,
    assignee: Option<String>,
    worktree: Option<String>,
    iteration: i64,
    completion_spec: Option<String>,
    failure: Option<String>,
    merge_failure: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            spec_id: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            status: row.get(5)?,
            priority: row.get(6)?,
            dependencies: row.get(7)?,
            assignee: row.get(8)?,
            worktree: row.get(9)?,
            iteration: row.get(10)?,
            completion_spec: row.get(11)?,
            failure: row.get(12)?,
            merge_failure: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let id = self.id;
        Ok(Task {
            spec_id: self.spec_id,
            title: self.title,
            description: self.description,
            status: self.status.parse()?,
            priority: u8::try_from(self.priority)
                .with_context(|| format!("task {id}: priority out of range"))?,
            dependencies: from_json(&self.dependencies, "task dependencies")?,
            assignee: self.assignee.as_deref().map(str::parse).transpose()?,
            worktree: self.worktree,
            iteration: u32::try_from(self.iteration).unwrap_or(0),
            completion_spec: self
                .completion_spec
                .as_deref()
                .map(|raw| from_json(raw, "completion spec"))
                .transpose()?,
            failure: self
                .failure
                .as_deref()
                .map(|raw| from_json(raw, "failure info"))
                .transpose()?,
            merge_failure: self
                .merge_failure
                .as_deref()
                .map(|raw| from_json(raw, "merge failure"))
                .transpose()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            seq: self.seq,
            id,
        })
    }
}

fn query_tasks(conn: &Connection, filter: &str, params: impl rusqlite::Params) -> Result<Vec<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks {filter} {TASK_ORDER}");
    let mut stmt = conn.prepare(&sql).context("prepare task query")?;
    let rows = stmt.query_map(params, TaskRow::from_row)?;
    let tasks = rows
        .map(|row| row.context("read task row")?.into_task())
        .collect::<Result<Vec<_>>>();
    tasks
}

fn load_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    let row = conn
        .query_row(&sql, params![id], TaskRow::from_row)
        .optional()
        .with_context(|| format!("load task {id}"))?;
    row.map(TaskRow::into_task).transpose()
}

/// Insert a task row and return its sequence number.
fn insert_task(conn: &Connection, task: &Task) -> Result<i64> {
    conn.execute(
        "INSERT INTO tasks (id, spec_id, title, description, status, priority, dependencies,
           assignee, worktree, iteration, completion_spec, failure, merge_failure,
           created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            task.id,
            task.spec_id,
            task.title,
            task.description,
            task.status.as_str(),
            i64::from(task.priority),
            to_json(&task.dependencies)?,
            task.assignee.map(AgentRole::as_str),
            task.worktree,
            i64::from(task.iteration),
            opt_json(task.completion_spec.as_ref())?,
            opt_json(task.failure.as_ref())?,
            opt_json(task.merge_failure.as_ref())?,
            format_ts(&task.created_at),
            format_ts(&task.updated_at),
        ],
    )
    .with_context(|| format!("insert task {}", task.id))?;
    Ok(conn.last_insert_rowid())
}

fn update_task_row(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET spec_id = ?2, title = ?3, description = ?4, status = ?5,
           priority = ?6, dependencies = ?7, assignee = ?8, worktree = ?9, iteration = ?10,
           completion_spec = ?11, failure = ?12, merge_failure = ?13, updated_at = ?14
         WHERE id = ?1",
        params![
            task.id,
            task.spec_id,
            task.title,
            task.description,
            task.status.as_str(),
            i64::from(task.priority),
            to_json(&task.dependencies)?,
            task.assignee.map(AgentRole::as_str),
            task.worktree,
            i64::from(task.iteration),
            opt_json(task.completion_spec.as_ref())?,
            opt_json(task.failure.as_ref())?,
            opt_json(task.merge_failure.as_ref())?,
            format_ts(&task.updated_at),
        ],
    )
    .with_context(|| format!("update task {}", task.id))?;
    Ok(())
}

fn load_graph(conn: &Connection) -> Result<DependencyGraph> {
    let mut stmt = conn.prepare("SELECT id, dependencies FROM tasks")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let graph = rows
        .map(|row| -> Result<(String, BTreeSet<String>)> {
            let (id, deps) = row.context("read dependency row")?;
            Ok((id, from_json(&deps, "task dependencies")?))
        })
        .collect::<Result<DependencyGraph>>();
    graph
}

fn done_ids(conn: &Connection) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare("SELECT id FROM tasks WHERE status = 'done'")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let ids = rows
        .map(|row| row.context("read task id"))
        .collect::<Result<BTreeSet<_>>>();
    ids
}
