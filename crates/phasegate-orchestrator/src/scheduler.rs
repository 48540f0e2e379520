//! Dependency-aware task selection
//!
//! Pure functions over a workflow's task slice. Dependency statuses are looked
//! up in the same slice, so the caller passes every task of the workflow, not
//! just the current phase.

use phasegate_core::{Task, TaskStatus};
use std::collections::HashMap;

/// Dependencies of `task` that are not COMPLETED, in id order.
///
/// Ids missing from `tasks` count as unsatisfied.
pub fn pending_dependencies(task: &Task, tasks: &[Task]) -> Vec<String> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.task_id.as_str(), t)).collect();
    pending_in(task, &by_id)
}

fn pending_in(task: &Task, by_id: &HashMap<&str, &Task>) -> Vec<String> {
    task.dependencies
        .iter()
        .filter(|dep| {
            by_id
                .get(dep.as_str())
                .map(|t| t.status != TaskStatus::Completed)
                .unwrap_or(true)
        })
        .cloned()
        .collect()
}

/// Pick the next task to dispatch in `phase`.
///
/// A candidate is NOT_STARTED or IN_PROGRESS, not currently assigned, and has
/// every dependency COMPLETED. The winner is the minimum by
/// `(priority, created_at, task_id)`, so the same ledger always yields the same
/// answer.
pub fn next_actionable<'a>(tasks: &'a [Task], phase: &str) -> Option<&'a Task> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.task_id.as_str(), t)).collect();

    tasks
        .iter()
        .filter(|t| t.phase == phase)
        .filter(|t| t.status.is_schedulable())
        .filter(|t| t.assignee.is_none())
        .filter(|t| pending_in(t, &by_id).is_empty())
        .min_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then_with(|| a.task_id.cmp(&b.task_id))
        })
}

/// Tasks of `phase` that still block the gate (neither COMPLETED nor DEFERRED)
pub fn unsettled<'a>(tasks: &'a [Task], phase: &str) -> impl Iterator<Item = &'a Task> + 'a {
    let phase = phase.to_string();
    tasks
        .iter()
        .filter(move |t| t.phase == phase)
        .filter(|t| !t.status.is_terminal())
}
