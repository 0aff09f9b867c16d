//! Dependency graph checks run when tasks are created or re-wired.

use std::collections::{BTreeMap, BTreeSet};

/// Adjacency map: task id -> ids it depends on.
pub type DependencyGraph = BTreeMap<String, BTreeSet<String>>;

/// Return the cycle closed by `task_id` depending on `deps`, if any.
///
/// The check is a reachability search: a cycle exists iff `task_id` can be
/// reached from one of its own dependencies through `graph`. Edges already
/// stored for `task_id` in `graph` are ignored and replaced by `deps`.
/// The returned path starts and ends at `task_id`.
pub fn find_cycle(graph: &DependencyGraph, task_id: &str, deps: &BTreeSet<String>) -> Option<Vec<String>> {
    if deps.contains(task_id) {
        return Some(vec![task_id.to_string(), task_id.to_string()]);
    }

    let mut visited = BTreeSet::new();
    for dep in deps {
        let mut path = vec![task_id.to_string()];
        if reaches(graph, dep, task_id, &mut visited, &mut path) {
            return Some(path);
        }
    }
    None
}

fn reaches(
    graph: &DependencyGraph,
    current: &str,
    target: &str,
    visited: &mut BTreeSet<String>,
    path: &mut Vec<String>,
) -> bool {
    path.push(current.to_string());
    if current == target {
        return true;
    }
    if visited.insert(current.to_string())
        && let Some(next) = graph.get(current)
    {
        for dep in next {
            if reaches(graph, dep, target, visited, path) {
                return true;
            }
        }
    }
    path.pop();
    false
}
