//! Test-only helpers: task builders, scripted capabilities and temp git repos.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use crate::core::types::{Task, TaskStatus};
use crate::io::executor::{ExecRequest, ExecResult, Executor};
use crate::io::resolver::ConflictResolver;

/// Fixed timestamp used by builders so ordering tests are deterministic.
pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Start building a deterministic task in spec `SPEC-1`.
pub fn task(id: &str, priority: u8) -> TaskBuilder {
    TaskBuilder {
        task: Task {
            id: id.to_string(),
            spec_id: "SPEC-1".to_string(),
            title: format!("{id} title"),
            description: String::new(),
            status: TaskStatus::Todo,
            priority,
            dependencies: BTreeSet::new(),
            assignee: None,
            worktree: None,
            iteration: 0,
            completion_spec: None,
            failure: None,
            merge_failure: None,
            created_at: fixed_time(),
            updated_at: fixed_time(),
            seq: 0,
        },
    }
}

pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.task.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn seq(mut self, seq: i64) -> Self {
        self.task.seq = seq;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// One scripted executor response.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    output: String,
    exit_code: Option<i32>,
    timed_out: bool,
    error: Option<String>,
    writes: Vec<(String, String)>,
}

impl ScriptedReply {
    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn timed_out(mut self) -> Self {
        self.timed_out = true;
        self.exit_code = None;
        self
    }

    /// Write `content` to `path` (relative to the request workdir) when replayed.
    pub fn writes(mut self, path: &str, content: &str) -> Self {
        self.writes.push((path.to_string(), content.to_string()));
        self
    }

    fn replay(&self, request: &ExecRequest) -> Result<ExecResult> {
        if let Some(message) = &self.error {
            return Err(anyhow!(message.clone()));
        }
        for (rel, content) in &self.writes {
            let path = request.workdir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
        }
        Ok(ExecResult {
            output: self.output.clone(),
            exit_code: self.exit_code,
            timed_out: self.timed_out,
            duration: Duration::from_millis(1),
        })
    }
}

type Responder = Box<dyn Fn(&ExecRequest) -> ScriptedReply + Send + Sync>;

/// Executor that replays queued replies in order, recording every request.
pub struct ScriptedExecutor {
    replies: Mutex<VecDeque<ScriptedReply>>,
    responder: Option<Responder>,
    requests: Mutex<Vec<ExecRequest>>,
    released: Mutex<Vec<PathBuf>>,
}

impl ScriptedExecutor {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            responder: None,
            requests: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        }
    }

    /// Answer every request by calling `f`; for concurrent tests where queue
    /// order is not deterministic.
    pub fn from_fn(f: impl Fn(&ExecRequest) -> ScriptedReply + Send + Sync + 'static) -> Self {
        Self {
            responder: Some(Box::new(f)),
            ..Self::new(Vec::new())
        }
    }

    /// A successful run printing `output`.
    pub fn reply(output: &str) -> ScriptedReply {
        ScriptedReply {
            output: output.to_string(),
            exit_code: Some(0),
            timed_out: false,
            error: None,
            writes: Vec::new(),
        }
    }

    /// A run that could not be started at all.
    pub fn error(message: &str) -> ScriptedReply {
        ScriptedReply {
            error: Some(message.to_string()),
            ..Self::reply("")
        }
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn released(&self) -> Vec<PathBuf> {
        self.released.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Executor for ScriptedExecutor {
    fn exec(&self, request: &ExecRequest) -> Result<ExecResult> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("requests lock poisoned"))?
            .push(request.clone());
        if let Some(responder) = &self.responder {
            return responder(request).replay(request);
        }
        let reply = self
            .replies
            .lock()
            .map_err(|_| anyhow!("replies lock poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("scripted executor has no replies left"))?;
        reply.replay(request)
    }

    fn release(&self, workdir: &Path) -> Result<()> {
        self.released
            .lock()
            .map_err(|_| anyhow!("released lock poisoned"))?
            .push(workdir.to_path_buf());
        Ok(())
    }
}

/// Resolver with canned answers per path. Unknown paths are errors.
#[derive(Default)]
pub struct ScriptedResolver {
    resolutions: HashMap<String, String>,
    regenerations: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolves(mut self, path: &str, content: &str) -> Self {
        self.resolutions.insert(path.to_string(), content.to_string());
        self
    }

    pub fn regenerates(mut self, path: &str, content: &str) -> Self {
        self.regenerations
            .insert(path.to_string(), content.to_string());
        self
    }

    /// Calls in order, as `resolve:<path>` or `regenerate:<path>`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl ConflictResolver for ScriptedResolver {
    fn resolve(&self, path: &str, _conflicted: &str) -> Result<String> {
        self.record(format!("resolve:{path}"));
        self.resolutions
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no scripted resolution for {path}"))
    }

    fn regenerate(&self, path: &str, _ours: &str, _theirs: &str) -> Result<String> {
        self.record(format!("regenerate:{path}"));
        self.regenerations
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no scripted regeneration for {path}"))
    }
}

/// Temporary git repository with one commit on `main`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo dir")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        repo.git(&["config", "user.name", "Conductor Test"])?;
        repo.git(&["config", "user.email", "conductor@example.com"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "# test repo\n")?;
        repo.commit_all("initial commit")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-q", "-m", message])?;
        Ok(())
    }

    /// Run git in the repo and return stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
