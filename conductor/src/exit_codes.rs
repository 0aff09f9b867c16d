//! Stable exit codes for conductor CLI commands.

/// Command succeeded (for `execute`: every dispatched task reached `done`).
pub const OK: i32 = 0;
/// Command failed for an operational reason (I/O, git, database, busy worktree).
pub const FAILED: i32 = 1;
/// Request was rejected by validation (unknown task, illegal transition, cycle).
pub const INVALID: i32 = 2;
/// `execute` finished but some task failed a stage, a merge, or dispatch.
pub const INCOMPLETE: i32 = 3;
