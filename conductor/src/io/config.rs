//! Orchestrator configuration stored under `.conductor/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{AgentRole, CompletionCriteria, MultiStagePolicy, VerificationMethod};

pub const CONFIG_DIR: &str = ".conductor";
pub const CONFIG_FILE: &str = "config.toml";

/// Orchestrator configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults, and
/// the file is resolved once per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConductorConfig {
    /// Worker pool capacity.
    pub max_parallel: usize,

    /// Wall-clock budget for one executor invocation.
    pub stage_timeout_secs: u64,

    /// Executor iterations one task may spend across all stages and retries
    /// in a single dispatch.
    pub max_total_iterations: u32,

    /// Truncate captured executor output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Branch that finished tasks merge into.
    pub target_branch: String,

    /// Worktree root, relative to the repository.
    pub worktree_dir: PathBuf,

    /// SQLite database, relative to the repository.
    pub database: PathBuf,

    /// JSONL change log mirror; disabled when absent.
    pub changelog: Option<PathBuf>,

    /// `claude` executable used by the shipped executor.
    pub claude_path: PathBuf,

    /// Verification used when neither a role nor a task configures one.
    pub default_verification: VerificationMethod,

    /// Per-role overrides. Unset fields use the role's built-in defaults.
    pub roles: BTreeMap<AgentRole, RoleConfig>,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 6,
            stage_timeout_secs: 600,
            max_total_iterations: 10,
            output_limit_bytes: 100_000,
            target_branch: "main".to_string(),
            worktree_dir: PathBuf::from(".worktrees"),
            database: PathBuf::from(CONFIG_DIR).join("conductor.db"),
            changelog: Some(PathBuf::from(CONFIG_DIR).join("changes.jsonl")),
            claude_path: PathBuf::from("claude"),
            default_verification: VerificationMethod::StringMatch,
            roles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RoleConfig {
    pub model: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    /// RalphLoop runs per stage before the task fails.
    pub retries: Option<u32>,
    /// Iterations per RalphLoop run.
    pub max_iterations: Option<u32>,
    pub promise: Option<String>,
    pub verification: Option<VerificationMethod>,
}

/// Fully resolved settings for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSettings {
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
    pub retries: u32,
    pub criteria: CompletionCriteria,
}

struct RoleDefaults {
    retries: u32,
    promise: &'static str,
    tools: &'static [&'static str],
}

fn role_defaults(role: AgentRole) -> RoleDefaults {
    match role {
        AgentRole::Coder => RoleDefaults {
            retries: 3,
            promise: "IMPLEMENTATION COMPLETE",
            tools: &["Task", "Read", "Write", "Edit", "Bash", "Grep", "Glob"],
        },
        AgentRole::Tester => RoleDefaults {
            retries: 2,
            promise: "TESTS PASSED",
            tools: &["Task", "Read", "Write", "Edit", "Bash", "Grep"],
        },
        AgentRole::Reviewer => RoleDefaults {
            retries: 2,
            promise: "REVIEW PASSED",
            tools: &["Task", "Read", "Grep", "Glob", "Bash"],
        },
        AgentRole::Qa => RoleDefaults {
            retries: 10,
            promise: "QA PASSED",
            tools: &["Task", "Read", "Bash", "Grep", "Glob"],
        },
    }
}

const DEFAULT_MAX_ITERATIONS: u32 = 3;

impl ConductorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(anyhow!("max_parallel must be > 0"));
        }
        if self.stage_timeout_secs == 0 {
            return Err(anyhow!("stage_timeout_secs must be > 0"));
        }
        if self.max_total_iterations == 0 {
            return Err(anyhow!("max_total_iterations must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.target_branch.trim().is_empty() {
            return Err(anyhow!("target_branch must not be empty"));
        }
        if self.worktree_dir.as_os_str().is_empty() || self.worktree_dir.is_absolute() {
            return Err(anyhow!("worktree_dir must be a non-empty relative path"));
        }
        validate_verification("default_verification", &self.default_verification)?;
        for (role, cfg) in &self.roles {
            if cfg.retries == Some(0) {
                return Err(anyhow!("roles.{role}.retries must be > 0"));
            }
            if cfg.max_iterations == Some(0) {
                return Err(anyhow!("roles.{role}.max_iterations must be > 0"));
            }
            if let Some(promise) = &cfg.promise
                && (promise.trim().is_empty() || promise.contains('<') || promise.contains('\n'))
            {
                return Err(anyhow!(
                    "roles.{role}.promise must be non-empty single-line text without '<'"
                ));
            }
            if let Some(verification) = &cfg.verification {
                validate_verification(&format!("roles.{role}.verification"), verification)?;
            }
        }
        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Resolve one role: built-in defaults, then `[roles.<role>]`.
    pub fn role(&self, role: AgentRole) -> RoleSettings {
        let defaults = role_defaults(role);
        let overrides = self.roles.get(&role).cloned().unwrap_or_default();
        RoleSettings {
            model: overrides.model,
            allowed_tools: overrides
                .allowed_tools
                .unwrap_or_else(|| defaults.tools.iter().map(|t| t.to_string()).collect()),
            retries: overrides.retries.unwrap_or(defaults.retries),
            criteria: CompletionCriteria {
                promise: overrides
                    .promise
                    .unwrap_or_else(|| defaults.promise.to_string()),
                verification: overrides
                    .verification
                    .unwrap_or_else(|| self.default_verification.clone()),
                max_iterations: overrides.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
            },
        }
    }
}

fn validate_verification(field: &str, method: &VerificationMethod) -> Result<()> {
    match method {
        VerificationMethod::StringMatch => Ok(()),
        VerificationMethod::Semantic { patterns } => {
            for pattern in patterns {
                regex::Regex::new(pattern)
                    .with_context(|| format!("{field}: invalid pattern '{pattern}'"))?;
            }
            Ok(())
        }
        VerificationMethod::External {
            command,
            timeout_secs,
            ..
        } => {
            if command.trim().is_empty() {
                return Err(anyhow!("{field}: external command must not be empty"));
            }
            if *timeout_secs == 0 {
                return Err(anyhow!("{field}: timeout_secs must be > 0"));
            }
            Ok(())
        }
        VerificationMethod::MultiStage { policy, stages } => {
            if stages.is_empty() {
                let which = match policy {
                    MultiStagePolicy::RequireAll => "require_all",
                    MultiStagePolicy::RequireAny => "require_any",
                };
                return Err(anyhow!("{field}: {which} multi_stage needs at least one stage"));
            }
            for (i, stage) in stages.iter().enumerate() {
                validate_verification(&format!("{field}.stages[{i}]"), stage)?;
            }
            Ok(())
        }
    }
}

/// Default config location for a repository root.
pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConductorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    if !path.exists() {
        let cfg = ConductorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConductorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConductorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ConductorConfig::default());
        assert_eq!(cfg.max_parallel, 6);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = ConductorConfig::default();
        cfg.roles.insert(
            AgentRole::Tester,
            RoleConfig {
                retries: Some(4),
                verification: Some(VerificationMethod::External {
                    command: "cargo test".to_string(),
                    expected_exit_code: 0,
                    forbidden_output: Some("FAILED".to_string()),
                    timeout_secs: 60,
                }),
                ..RoleConfig::default()
            },
        );
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn role_resolution_layers_overrides_on_defaults() {
        let raw = r#"
max_parallel = 2

[roles.coder]
model = "opus"
max_iterations = 5
"#;
        let cfg: ConductorConfig = toml::from_str(raw).expect("parse");
        cfg.validate().expect("valid");

        assert_eq!(cfg.max_total_iterations, 10);

        let coder = cfg.role(AgentRole::Coder);
        assert_eq!(coder.model.as_deref(), Some("opus"));
        assert_eq!(coder.retries, 3);
        assert_eq!(coder.criteria.max_iterations, 5);
        assert_eq!(coder.criteria.promise, "IMPLEMENTATION COMPLETE");

        let qa = cfg.role(AgentRole::Qa);
        assert_eq!(qa.retries, 10);
        assert_eq!(qa.criteria.promise, "QA PASSED");
        assert_eq!(qa.allowed_tools, vec!["Task", "Read", "Bash", "Grep", "Glob"]);
    }

    #[test]
    fn rejects_invalid_values() {
        let cfg = ConductorConfig {
            max_parallel: 0,
            ..ConductorConfig::default()
        };
        assert!(cfg.validate().is_err());

        let raw = "max_total_iterations = 0\n";
        let cfg: ConductorConfig = toml::from_str(raw).expect("parse");
        assert!(cfg.validate().is_err());

        let raw = r#"
[roles.reviewer]
retries = 0
"#;
        let cfg: ConductorConfig = toml::from_str(raw).expect("parse");
        assert!(cfg.validate().is_err());

        let raw = r#"
[default_verification]
method = "semantic"
patterns = ["(unclosed"]
"#;
        let cfg: ConductorConfig = toml::from_str(raw).expect("parse");
        assert!(cfg.validate().is_err());
    }
}
