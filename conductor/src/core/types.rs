//! Shared domain types for the orchestration engine.
//!
//! These types are plain data: they carry no handles to storage, git or
//! processes, so every component (and every test) can construct them freely.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// True if `id` is usable as a directory and branch name component.
pub fn is_safe_id(id: &str) -> bool {
    static SAFE_ID_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"^[A-Za-z0-9_-][A-Za-z0-9._-]*$").expect("id regex should be valid")
    });
    SAFE_ID_RE.is_match(id) && !id.contains("..") && !id.ends_with(".lock")
}

/// Pipeline status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Implementing,
    Testing,
    Reviewing,
    Done,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Todo,
        TaskStatus::Implementing,
        TaskStatus::Testing,
        TaskStatus::Reviewing,
        TaskStatus::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Implementing => "implementing",
            TaskStatus::Testing => "testing",
            TaskStatus::Reviewing => "reviewing",
            TaskStatus::Done => "done",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow!("unknown task status '{s}'"))
    }
}

/// Lifecycle status of a spec document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecStatus {
    Draft,
    Clarifying,
    Specified,
    Approved,
    Planning,
    Planned,
    Implementing,
    Completed,
    Archived,
}

impl SpecStatus {
    pub const ALL: [SpecStatus; 9] = [
        SpecStatus::Draft,
        SpecStatus::Clarifying,
        SpecStatus::Specified,
        SpecStatus::Approved,
        SpecStatus::Planning,
        SpecStatus::Planned,
        SpecStatus::Implementing,
        SpecStatus::Completed,
        SpecStatus::Archived,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SpecStatus::Draft => "draft",
            SpecStatus::Clarifying => "clarifying",
            SpecStatus::Specified => "specified",
            SpecStatus::Approved => "approved",
            SpecStatus::Planning => "planning",
            SpecStatus::Planned => "planned",
            SpecStatus::Implementing => "implementing",
            SpecStatus::Completed => "completed",
            SpecStatus::Archived => "archived",
        }
    }

    /// Specs whose tasks the scheduler still considers.
    pub fn is_active(self) -> bool {
        !matches!(self, SpecStatus::Completed | SpecStatus::Archived)
    }
}

impl fmt::Display for SpecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpecStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        SpecStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow!("unknown spec status '{s}'"))
    }
}

/// Fixed set of agent roles that work a task through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Coder,
    Tester,
    Reviewer,
    Qa,
}

impl AgentRole {
    pub const ALL: [AgentRole; 4] = [
        AgentRole::Coder,
        AgentRole::Tester,
        AgentRole::Reviewer,
        AgentRole::Qa,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Coder => "coder",
            AgentRole::Tester => "tester",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Qa => "qa",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        AgentRole::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| anyhow!("unknown agent role '{s}'"))
    }
}

/// Ordered pipeline stages.
///
/// `Validation` is the final QA pass; the task stays `reviewing` while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Implementing,
    Testing,
    Reviewing,
    Validation,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [
        Stage::Implementing,
        Stage::Testing,
        Stage::Reviewing,
        Stage::Validation,
    ];

    pub fn role(self) -> AgentRole {
        match self {
            Stage::Implementing => AgentRole::Coder,
            Stage::Testing => AgentRole::Tester,
            Stage::Reviewing => AgentRole::Reviewer,
            Stage::Validation => AgentRole::Qa,
        }
    }

    /// Task status held while this stage runs.
    pub fn status(self) -> TaskStatus {
        match self {
            Stage::Implementing => TaskStatus::Implementing,
            Stage::Testing => TaskStatus::Testing,
            Stage::Reviewing | Stage::Validation => TaskStatus::Reviewing,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Implementing => "implementing",
            Stage::Testing => "testing",
            Stage::Reviewing => "reviewing",
            Stage::Validation => "validation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ORDER
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| anyhow!("unknown stage '{s}'"))
    }
}

/// How `multi_stage` verification combines its sub-results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiStagePolicy {
    /// Every sub-verification must pass.
    #[default]
    RequireAll,
    /// One passing sub-verification is enough.
    RequireAny,
}

/// Strategy used to decide whether a completion promise is genuine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum VerificationMethod {
    #[default]
    StringMatch,
    Semantic {
        /// Case-insensitive regexes; an empty list uses the built-in set.
        #[serde(default)]
        patterns: Vec<String>,
    },
    External {
        command: String,
        #[serde(default)]
        expected_exit_code: i32,
        #[serde(default)]
        forbidden_output: Option<String>,
        #[serde(default = "default_external_timeout_secs")]
        timeout_secs: u64,
    },
    MultiStage {
        #[serde(default)]
        policy: MultiStagePolicy,
        stages: Vec<VerificationMethod>,
    },
}

impl VerificationMethod {
    pub fn name(&self) -> &'static str {
        match self {
            VerificationMethod::StringMatch => "string_match",
            VerificationMethod::Semantic { .. } => "semantic",
            VerificationMethod::External { .. } => "external",
            VerificationMethod::MultiStage { .. } => "multi_stage",
        }
    }
}

fn default_external_timeout_secs() -> u64 {
    300
}

/// Per-role completion contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionCriteria {
    pub promise: String,
    #[serde(default)]
    pub verification: VerificationMethod,
    pub max_iterations: u32,
}

/// Task-level completion contract supplied at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompletionSpec {
    pub outcome: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub criteria: BTreeMap<AgentRole, CompletionCriteria>,
}

/// Machine-readable reason a task was sent back to `todo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    StageRetriesExhausted,
    /// The task used up `max_total_iterations` across all stages.
    TotalIterationsExhausted,
    LoopCancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureReason::StageRetriesExhausted => "stage retries exhausted",
            FailureReason::TotalIterationsExhausted => "total iteration budget exhausted",
            FailureReason::LoopCancelled => "loop cancelled",
        })
    }
}

/// Diagnostics recorded when a stage exhausts its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub stage: Stage,
    pub iterations_used: u32,
    pub last_output: String,
    pub reason: FailureReason,
    pub recorded_at: DateTime<Utc>,
}

/// Annotation left on a `reviewing` task whose merge could not be completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeFailure {
    pub message: String,
    pub tier: u8,
    #[serde(default)]
    pub files: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    pub id: String,
    pub title: String,
    pub status: SpecStatus,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub spec_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// 1 (highest) to 3 (lowest).
    pub priority: u8,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub assignee: Option<AgentRole>,
    #[serde(default)]
    pub worktree: Option<String>,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub completion_spec: Option<CompletionSpec>,
    #[serde(default)]
    pub failure: Option<FailureInfo>,
    #[serde(default)]
    pub merge_failure: Option<MergeFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Insertion sequence; breaks ties between equal priority and timestamp.
    #[serde(default)]
    pub seq: i64,
}

/// Input for task creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub id: String,
    pub spec_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: u8,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub assignee: Option<AgentRole>,
    #[serde(default)]
    pub completion_spec: Option<CompletionSpec>,
}

impl NewTask {
    pub fn new(id: impl Into<String>, spec_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            spec_id: spec_id.into(),
            title: title.into(),
            description: String::new(),
            priority: 2,
            dependencies: BTreeSet::new(),
            assignee: None,
            completion_spec: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_completion_spec(mut self, spec: CompletionSpec) -> Self {
        self.completion_spec = Some(spec);
        self
    }
}

/// Partial update of a task's descriptive fields. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<u8>,
    pub dependencies: Option<BTreeSet<String>>,
    pub assignee: Option<Option<AgentRole>>,
    pub completion_spec: Option<Option<CompletionSpec>>,
}

/// One row of execution history: a single (task, stage, attempt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: i64,
    pub task_id: String,
    pub role: AgentRole,
    pub stage: Stage,
    pub attempt: u32,
    pub output: String,
    pub success: bool,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExecutionLog {
    pub task_id: String,
    pub role: AgentRole,
    pub stage: Stage,
    pub attempt: u32,
    pub output: String,
    pub success: bool,
    pub duration_ms: u64,
}

/// An agent currently working on a task. Observability only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveAgent {
    pub task_id: String,
    pub role: AgentRole,
    pub slot: usize,
    #[serde(default)]
    pub worktree: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Progress of one running Ralph loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RalphLoopState {
    pub task_id: String,
    pub stage: Stage,
    pub iteration: u32,
    pub max_iterations: u32,
    pub promise: String,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_round_trip_through_strings() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().expect("parse"), status);
        }
        assert!("in_progress".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn safe_ids_exclude_path_tricks() {
        assert!(is_safe_id("TASK-01"));
        assert!(is_safe_id("v1.2_fix"));
        assert!(!is_safe_id(""));
        assert!(!is_safe_id(".."));
        assert!(!is_safe_id("a/b"));
        assert!(!is_safe_id("a b"));
        assert!(!is_safe_id("branch.lock"));
        assert!(!is_safe_id(".hidden"));
        assert!(!is_safe_id("tâche"));
        assert!(!is_safe_id("T-1\n"));
    }

    #[test]
    fn validation_stage_keeps_reviewing_status() {
        assert_eq!(Stage::Validation.status(), TaskStatus::Reviewing);
        assert_eq!(Stage::Validation.role(), AgentRole::Qa);
    }

    #[test]
    fn verification_method_parses_tagged_toml() {
        let raw = r#"
method = "multi_stage"
policy = "require_any"

[[stages]]
method = "semantic"

[[stages]]
method = "external"
command = "cargo test"
"#;
        let parsed: VerificationMethod = toml::from_str(raw).expect("parse");
        match parsed {
            VerificationMethod::MultiStage { policy, stages } => {
                assert_eq!(policy, MultiStagePolicy::RequireAny);
                assert_eq!(stages.len(), 2);
                assert_eq!(
                    stages[1],
                    VerificationMethod::External {
                        command: "cargo test".to_string(),
                        expected_exit_code: 0,
                        forbidden_output: None,
                        timeout_secs: 300,
                    }
                );
            }
            other => panic!("unexpected method {other:?}"),
        }
    }

    #[test]
    fn completion_spec_keys_criteria_by_role() {
        let raw = r#"{
            "outcome": "login works",
            "acceptance_criteria": ["user can log in"],
            "criteria": {
                "coder": {"promise": "DONE", "max_iterations": 4}
            }
        }"#;
        let spec: CompletionSpec = serde_json::from_str(raw).expect("parse");
        let coder = &spec.criteria[&AgentRole::Coder];
        assert_eq!(coder.promise, "DONE");
        assert_eq!(coder.verification, VerificationMethod::StringMatch);
    }
}
