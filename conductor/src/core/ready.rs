//! Ready-set selection and dispatch ordering.

use std::collections::BTreeSet;

use crate::core::types::{Task, TaskStatus};

/// A task is ready when it is `todo` and every dependency is `done`.
pub fn is_ready(task: &Task, done_ids: &BTreeSet<String>) -> bool {
    task.status == TaskStatus::Todo && task.dependencies.iter().all(|dep| done_ids.contains(dep))
}

/// Dependencies of `task` that are not yet `done`, in id order.
pub fn pending_dependencies(task: &Task, done_ids: &BTreeSet<String>) -> Vec<String> {
    task.dependencies
        .iter()
        .filter(|dep| !done_ids.contains(*dep))
        .cloned()
        .collect()
}

/// Sort into dispatch order: priority ascending, then FIFO by creation.
pub fn sort_for_dispatch(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.seq.cmp(&b.seq))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Filter `candidates` down to ready tasks, in dispatch order.
pub fn select_ready(candidates: Vec<Task>, done_ids: &BTreeSet<String>) -> Vec<Task> {
    let mut ready: Vec<Task> = candidates
        .into_iter()
        .filter(|task| is_ready(task, done_ids))
        .collect();
    sort_for_dispatch(&mut ready);
    ready
}
