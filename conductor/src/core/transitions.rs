//! Legal task status transitions.

use crate::core::types::TaskStatus;

/// Classification of a requested status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Requested status equals the current one; nothing to write.
    NoOp,
    Legal,
    Illegal,
}

/// Classify `from -> to`.
///
/// Forward edges follow the pipeline one step at a time. Any unfinished state
/// may fall back to `todo`. `done` is terminal.
pub fn classify(from: TaskStatus, to: TaskStatus) -> Transition {
    use crate::core::types::TaskStatus::{Done, Implementing, Reviewing, Testing, Todo};

    if from == to {
        return Transition::NoOp;
    }
    match (from, to) {
        (Todo, Implementing)
        | (Implementing, Testing)
        | (Testing, Reviewing)
        | (Reviewing, Done)
        | (Implementing | Testing | Reviewing, Todo) => Transition::Legal,
        _ => Transition::Illegal,
    }
}
