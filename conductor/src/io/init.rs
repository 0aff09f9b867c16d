//! Initialization helpers for `.conductor/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{CONFIG_DIR, ConductorConfig, config_path, write_config};
use super::store::TaskStore;

/// Canonical paths within `.conductor/` for a repository root.
#[derive(Debug, Clone)]
pub struct ConductorPaths {
    pub root: PathBuf,
    pub conductor_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
}

impl ConductorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let conductor_dir = root.join(CONFIG_DIR);
        Self {
            config_path: config_path(&root),
            gitignore_path: conductor_dir.join(".gitignore"),
            conductor_dir,
            root,
        }
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing conductor-owned files.
    pub force: bool,
}

/// Create `.conductor/` with a default config and an empty database.
///
/// Fails if `.conductor/config.toml` already exists unless `options.force` is
/// set. The database is never overwritten; opening it only creates missing
/// tables.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<ConductorPaths> {
    let paths = ConductorPaths::new(root);
    if paths.conductor_dir.exists() && !paths.conductor_dir.is_dir() {
        return Err(anyhow!(
            "conductor init: {CONFIG_DIR} exists but is not a directory"
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "conductor init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    fs::create_dir_all(&paths.conductor_dir)
        .with_context(|| format!("create directory {}", paths.conductor_dir.display()))?;
    fs::write(&paths.gitignore_path, CONDUCTOR_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    let config = ConductorConfig::default();
    write_config(&paths.config_path, &config)?;
    TaskStore::open(&root.join(&config.database)).context("create database")?;

    Ok(paths)
}

const CONDUCTOR_GITIGNORE: &str = "conductor.db\nconductor.db-*\nchanges.jsonl\n*.tmp\n";
