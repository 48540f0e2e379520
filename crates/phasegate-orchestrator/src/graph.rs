//! Workflow dependency graph validation
//!
//! Run whenever the graph can change: workflow creation, task addition and
//! dependency edits. A workflow with a cycle would never make progress, so it
//! is rejected up front instead of discovered at dispatch time.

use phasegate_core::{PhasegateError, Result, Task};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Topological order of the workflow's tasks (dependencies first).
///
/// Uses Kahn's algorithm with id order as the tie-breaker, so the result is
/// deterministic for a given task set.
///
/// # Errors
///
/// - `InvalidWorkflow` if a task depends on an id not in `tasks`
/// - `CyclicDependency` naming every task left on a cycle (self-dependency included)
pub fn topological_order(tasks: &[Task]) -> Result<Vec<String>> {
    let ids: BTreeSet<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
    if ids.len() != tasks.len() {
        return Err(PhasegateError::InvalidWorkflow(
            "duplicate task ids in workflow".to_string(),
        ));
    }

    // dependency -> dependents
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();

    for task in tasks {
        in_degree.insert(task.task_id.as_str(), task.dependencies.len());
        for dep in &task.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(PhasegateError::InvalidWorkflow(format!(
                    "task {} depends on unknown task {}",
                    task.task_id, dep
                )));
            }
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(task.task_id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(tasks.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());

        let mut next: Vec<&str> = dependents.get(id).cloned().unwrap_or_default();
        next.sort_unstable();
        for dependent in next {
            if let Some(deg) = in_degree.get_mut(dependent) {
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if order.len() != tasks.len() {
        let cycle: Vec<String> = in_degree
            .iter()
            .filter(|(_, deg)| **deg > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(PhasegateError::CyclicDependency(cycle));
    }

    Ok(order)
}

/// Validate the graph without keeping the order
pub fn validate_dependencies(tasks: &[Task]) -> Result<()> {
    topological_order(tasks).map(|_| ())
}
