//! Promise verification strategies.
//!
//! Every strategy first checks the promise structurally (a standalone
//! `<promise>` line carrying exactly the expected text). Only then does the
//! configured method decide whether the claim is believable.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::RegexBuilder;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::core::promise::{PromiseCheck, check_structure};
use crate::core::types::{MultiStagePolicy, Stage, VerificationMethod};
use crate::io::process::run_shell;

/// Contradiction patterns used when a semantic method lists none.
pub const DEFAULT_CONTRADICTIONS: &[&str] = &[
    r"\bTODO\b",
    r"\bFIXME\b",
    r"not implemented",
    r"tests? fail",
    r"failing tests?",
    r"\bunresolved\b",
];

/// Where the claim was made.
#[derive(Debug, Clone, Copy)]
pub struct VerifyContext<'a> {
    pub task_id: &'a str,
    pub stage: Stage,
    /// Worktree external commands run in.
    pub workdir: &'a Path,
    pub output_limit_bytes: usize,
}

/// Verdict on one promise claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub passed: bool,
    pub method: String,
    pub reason: String,
}

impl Verification {
    fn pass(method: &str, reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            method: method.to_string(),
            reason: reason.into(),
        }
    }

    fn reject(method: &str, reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}

/// Judges whether a worker's completion claim is genuine.
///
/// A rejection is a normal verdict, not an error. `Err` means the check itself
/// could not run (e.g. the external command could not be spawned).
pub trait PromiseVerifier: Send + Sync {
    fn verify(&self, output: &str, ctx: &VerifyContext<'_>) -> Result<Verification>;
}

/// Verifier for one expected promise and one configured method.
#[derive(Debug, Clone)]
pub struct MethodVerifier {
    expected: String,
    method: VerificationMethod,
}

impl MethodVerifier {
    pub fn new(expected: impl Into<String>, method: VerificationMethod) -> Self {
        Self {
            expected: expected.into(),
            method,
        }
    }
}

impl PromiseVerifier for MethodVerifier {
    #[instrument(skip_all, fields(task_id = ctx.task_id, stage = %ctx.stage, method = self.method.name()))]
    fn verify(&self, output: &str, ctx: &VerifyContext<'_>) -> Result<Verification> {
        let method = self.method.name();
        match check_structure(output, &self.expected) {
            PromiseCheck::Missing => {
                return Ok(Verification::reject(method, "no standalone promise line"));
            }
            PromiseCheck::Mismatch { found } => {
                return Ok(Verification::reject(
                    method,
                    format!("promise '{found}' does not match '{}'", self.expected),
                ));
            }
            PromiseCheck::Valid => {}
        }
        let verdict = run_method(&self.method, output, ctx)?;
        debug!(passed = verdict.passed, reason = %verdict.reason, "verification finished");
        Ok(verdict)
    }
}

/// Apply `method` to an output whose promise is already structurally valid.
fn run_method(
    method: &VerificationMethod,
    output: &str,
    ctx: &VerifyContext<'_>,
) -> Result<Verification> {
    let name = method.name();
    match method {
        VerificationMethod::StringMatch => Ok(Verification::pass(name, "promise matched")),
        VerificationMethod::Semantic { patterns } => check_semantic(name, patterns, output),
        VerificationMethod::External {
            command,
            expected_exit_code,
            forbidden_output,
            timeout_secs,
        } => {
            let result = run_shell(
                command,
                ctx.workdir,
                Duration::from_secs(*timeout_secs),
                ctx.output_limit_bytes,
            )?;
            if result.timed_out {
                return Ok(Verification::reject(
                    name,
                    format!("`{command}` timed out after {timeout_secs}s"),
                ));
            }
            if result.exit_code() != Some(*expected_exit_code) {
                return Ok(Verification::reject(
                    name,
                    format!(
                        "`{command}` exited with {:?}, expected {expected_exit_code}",
                        result.exit_code()
                    ),
                ));
            }
            if let Some(forbidden) = forbidden_output
                && result.combined_lossy().contains(forbidden.as_str())
            {
                return Ok(Verification::reject(
                    name,
                    format!("`{command}` output contains '{forbidden}'"),
                ));
            }
            Ok(Verification::pass(name, format!("`{command}` succeeded")))
        }
        VerificationMethod::MultiStage { policy, stages } => {
            if stages.is_empty() {
                return Ok(Verification::reject(name, "no stages configured"));
            }
            let mut reasons = Vec::new();
            for (i, stage) in stages.iter().enumerate() {
                let verdict = run_method(stage, output, ctx)?;
                let line = format!("stage {} ({}): {}", i + 1, verdict.method, verdict.reason);
                match (policy, verdict.passed) {
                    (MultiStagePolicy::RequireAll, false) => {
                        return Ok(Verification::reject(name, line));
                    }
                    (MultiStagePolicy::RequireAny, true) => {
                        return Ok(Verification::pass(name, line));
                    }
                    _ => reasons.push(line),
                }
            }
            let joined = reasons.join("; ");
            Ok(match policy {
                MultiStagePolicy::RequireAll => Verification::pass(name, joined),
                MultiStagePolicy::RequireAny => Verification::reject(name, joined),
            })
        }
    }
}

fn check_semantic(name: &str, patterns: &[String], output: &str) -> Result<Verification> {
    let defaults: Vec<String>;
    let patterns = if patterns.is_empty() {
        defaults = DEFAULT_CONTRADICTIONS.iter().map(|p| p.to_string()).collect();
        &defaults
    } else {
        patterns
    };
    for pattern in patterns {
        let re = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("compile contradiction pattern '{pattern}'"))?;
        if let Some(found) = re.find(output) {
            return Ok(Verification::reject(
                name,
                format!("output contradicts promise: '{}'", found.as_str()),
            ));
        }
    }
    Ok(Verification::pass(name, "no contradictions found"))
}
