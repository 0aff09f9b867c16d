//! Side-effecting adapters: database, files, git and agent processes.

pub mod agents;
pub mod changelog;
pub mod completion;
pub mod config;
pub mod executor;
pub mod git;
pub mod init;
pub mod process;
pub mod prompt;
pub mod resolver;
pub mod store;
pub mod worktree;
