//! Conflict resolution capabilities used by the merge engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::conflict::strip_code_fence;
use crate::io::executor::{ExecRequest, Executor};
use crate::io::prompt::PromptEngine;

/// Produces merged file content for conflicted paths.
///
/// Implementations are not trusted: the merge engine validates every result
/// for leftover conflict markers.
pub trait ConflictResolver: Send + Sync {
    /// Resolve one file whose content still contains conflict markers.
    fn resolve(&self, path: &str, conflicted: &str) -> Result<String>;

    /// Write one coherent file from the complete target and task versions.
    fn regenerate(&self, path: &str, ours: &str, theirs: &str) -> Result<String>;
}

/// Resolver backed by any [`Executor`].
pub struct ExecutorResolver {
    executor: Arc<dyn Executor>,
    prompts: PromptEngine,
    workdir: PathBuf,
    model: Option<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl ExecutorResolver {
    pub fn new(
        executor: Arc<dyn Executor>,
        workdir: impl Into<PathBuf>,
        model: Option<String>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            executor,
            prompts: PromptEngine::new(),
            workdir: workdir.into(),
            model,
            timeout,
            output_limit_bytes,
        }
    }

    fn ask(&self, path: &str, prompt: String) -> Result<String> {
        let request = ExecRequest {
            prompt,
            workdir: self.workdir.clone(),
            allowed_tools: Vec::new(),
            model: self.model.clone(),
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        };
        let result = self.executor.exec(&request)?;
        if !result.succeeded() {
            warn!(path, exit_code = ?result.exit_code, timed_out = result.timed_out, "resolver run failed");
            return Err(anyhow!(
                "resolver for {path} failed (exit {:?}, timed out: {})",
                result.exit_code,
                result.timed_out
            ));
        }
        let content = strip_code_fence(&result.output);
        debug!(path, bytes = content.len(), "resolver produced content");
        Ok(content)
    }
}

impl ConflictResolver for ExecutorResolver {
    #[instrument(skip_all, fields(path))]
    fn resolve(&self, path: &str, conflicted: &str) -> Result<String> {
        let prompt = self.prompts.render_resolve(path, conflicted)?;
        self.ask(path, prompt)
    }

    #[instrument(skip_all, fields(path))]
    fn regenerate(&self, path: &str, ours: &str, theirs: &str) -> Result<String> {
        let prompt = self.prompts.render_regenerate(path, ours, theirs)?;
        self.ask(path, prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedExecutor;

    #[test]
    fn resolve_strips_fence_and_sends_conflict() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = Arc::new(ScriptedExecutor::new(vec![
            ScriptedExecutor::reply("```rust\nfn merged() {}\n```"),
        ]));
        let resolver = ExecutorResolver::new(
            executor.clone(),
            temp.path(),
            None,
            Duration::from_secs(5),
            10_000,
        );

        let merged = resolver
            .resolve("src/lib.rs", "<<<<<<< HEAD\na\n=======\nb\n>>>>>>> task/T\n")
            .expect("resolve");
        assert_eq!(merged, "fn merged() {}\n");

        let requests = executor.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].prompt.contains("<<<<<<< HEAD"));
    }

    #[test]
    fn failed_run_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = Arc::new(ScriptedExecutor::new(vec![
            ScriptedExecutor::reply("boom").exit_code(1),
        ]));
        let resolver =
            ExecutorResolver::new(executor, temp.path(), None, Duration::from_secs(5), 10_000);
        assert!(resolver.regenerate("a.txt", "a", "b").is_err());
    }
}
