//! Multi-agent development orchestrator.
//!
//! Tasks grouped under specs move through a fixed pipeline
//! (`todo → implementing → testing → reviewing → done`), each stage driven by
//! an AI agent working in its own git worktree. Stage output is accepted only
//! when it carries the expected completion promise and passes verification;
//! finished worktrees are merged back into the target branch with tiered
//! conflict resolution.
//!
//! - **[`core`]**: Pure logic (types, transitions, dependency graph, ready
//!   ordering, promise parsing). No I/O.
//! - **[`io`]**: Side effects (SQLite store, change log, git, worktrees,
//!   subprocesses, prompt rendering, config).
//!
//! Orchestration modules ([`verify`], [`ralph`], [`merge`], [`pipeline`],
//! [`scheduler`]) combine the two; [`engine`] wires them for a repository and
//! [`control`] exposes them as structured results for the CLI.

pub mod control;
pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod merge;
pub mod pipeline;
pub mod ralph;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;
