//! Wiring of one orchestrator instance for a repository.
//!
//! `Engine` owns the shared pieces workers use (store, worktrees, registries,
//! merge engine, pipeline) and builds them from `.conductor/config.toml`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::types::AgentRole;
use crate::io::agents::AgentRegistry;
use crate::io::changelog::ChangeLog;
use crate::io::config::{ConductorConfig, config_path, load_config};
use crate::io::executor::{ClaudeExecutor, Executor};
use crate::io::resolver::{ConflictResolver, ExecutorResolver};
use crate::io::store::TaskStore;
use crate::io::worktree::WorktreeManager;
use crate::merge::MergeEngine;
use crate::pipeline::PipelineRunner;
use crate::ralph::{CancelToken, LoopRegistry};
use crate::scheduler::{RunSummary, Scheduler, SchedulerOptions};

pub struct Engine {
    root: PathBuf,
    config: Arc<ConductorConfig>,
    store: Arc<TaskStore>,
    worktrees: Arc<WorktreeManager>,
    agents: Arc<AgentRegistry>,
    loops: Arc<LoopRegistry>,
    runner: PipelineRunner,
}

impl Engine {
    /// Load config from `root` and use the `claude` CLI for execution and
    /// conflict resolution.
    pub fn open(root: &Path) -> Result<Self> {
        let config = load_config(&config_path(root))?;
        let executor: Arc<dyn Executor> = Arc::new(ClaudeExecutor::new(&config.claude_path));
        let resolver: Arc<dyn ConflictResolver> = Arc::new(ExecutorResolver::new(
            Arc::clone(&executor),
            root,
            config.role(AgentRole::Coder).model,
            config.stage_timeout(),
            config.output_limit_bytes,
        ));
        Self::with_capabilities(root, config, executor, resolver)
    }

    /// Build an engine around injected capabilities.
    #[instrument(skip_all, fields(root = %root.display()))]
    pub fn with_capabilities(
        root: &Path,
        config: ConductorConfig,
        executor: Arc<dyn Executor>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Result<Self> {
        config.validate()?;
        let mut store = TaskStore::open(&root.join(&config.database))?;
        if let Some(changelog) = &config.changelog {
            let log = ChangeLog::open(&root.join(changelog)).context("open change log")?;
            store = store.with_changelog(log);
        }
        let store = Arc::new(store);
        let config = Arc::new(config);
        let worktrees = Arc::new(WorktreeManager::new(root, &config.worktree_dir));
        let agents = Arc::new(AgentRegistry::with_store(Arc::clone(&store)));
        let loops = Arc::new(LoopRegistry::with_store(Arc::clone(&store)));
        let merger = Arc::new(MergeEngine::new(
            Arc::clone(&worktrees),
            resolver,
            config.target_branch.clone(),
        ));
        let runner = PipelineRunner::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&worktrees),
            merger,
            executor,
            Arc::clone(&agents),
            Arc::clone(&loops),
        );
        debug!("engine ready");
        Ok(Self {
            root: root.to_path_buf(),
            config,
            store,
            worktrees,
            agents,
            loops,
            runner,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn loops(&self) -> &LoopRegistry {
        &self.loops
    }

    pub fn runner(&self) -> &PipelineRunner {
        &self.runner
    }

    /// Options for a run over every active spec at configured capacity.
    pub fn default_options(&self) -> SchedulerOptions {
        SchedulerOptions::new(self.config.max_parallel)
    }

    /// Dispatch ready tasks until nothing more can run.
    pub fn execute(&self, options: SchedulerOptions, cancel: CancelToken) -> Result<RunSummary> {
        Scheduler::new(&self.store, &self.runner, options)
            .with_cancel(cancel)
            .run()
    }
}
