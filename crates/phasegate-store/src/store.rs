//! The ledger store contract

use async_trait::async_trait;
use chrono::Utc;
use phasegate_core::{
    PhasegateError, ProgressEntry, Result, Task, TaskStatus, Workflow,
};

/// In-place change applied to a task under the store's write lock
pub type TaskMutation = Box<dyn FnOnce(&mut Task) -> Result<()> + Send>;

/// Filter for listing tasks. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub workflow_id: Option<String>,
    pub phase: Option<String>,
    pub statuses: Vec<TaskStatus>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn workflow(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: Some(workflow_id.into()),
            ..Default::default()
        }
    }

    pub fn in_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(workflow_id) = &self.workflow_id {
            if &task.workflow_id != workflow_id {
                return false;
            }
        }
        if let Some(phase) = &self.phase {
            if &task.phase != phase {
                return false;
            }
        }
        self.statuses.is_empty() || self.statuses.contains(&task.status)
    }
}

/// Durable access to tasks and workflows.
///
/// Implementations serialize read-modify-write per task so two concurrent reports
/// can never lose an update, and every write is durable before the call returns.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a new task; fails with `AlreadyExists` on a duplicate id
    async fn create_task(&self, task: Task) -> Result<Task>;

    async fn get_task(&self, task_id: &str) -> Result<Task>;

    /// Append one progress entry and set the resulting status atomically
    async fn append_progress(
        &self,
        task_id: &str,
        entry: ProgressEntry,
        status: TaskStatus,
    ) -> Result<Task>;

    /// Atomic read-modify-write of a single task
    async fn update_task(&self, task_id: &str, mutation: TaskMutation) -> Result<Task>;

    /// Matching tasks ordered by priority, then creation time
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow>;

    async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow>;

    /// Replace the stored workflow record
    async fn put_workflow(&self, workflow: Workflow) -> Result<Workflow>;

    async fn list_workflows(&self) -> Result<Vec<Workflow>>;
}

/// Deterministic scheduling order: priority, creation time, then id
pub fn sort_tasks(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then_with(|| a.task_id.cmp(&b.task_id))
    });
}

/// Shared append rules so every store behaves identically
pub(crate) fn apply_progress(
    task: &mut Task,
    entry: ProgressEntry,
    status: TaskStatus,
) -> Result<()> {
    if task.status.is_terminal() {
        return Err(PhasegateError::InvalidTransition(format!(
            "task {} is {}; reopen it before reporting progress",
            task.task_id, task.status
        )));
    }

    let timestamp = entry.timestamp;
    task.history.push(entry);
    task.status = status;
    task.assignee = None;
    task.touch(timestamp);
    task.check_invariants()
        .map_err(PhasegateError::InvalidTransition)
}

/// Shared mutation rules: run the closure on a copy, validate, bump `updated_at`
pub(crate) fn apply_mutation(task: &Task, mutation: TaskMutation) -> Result<Task> {
    let mut updated = task.clone();
    mutation(&mut updated)?;

    if updated.task_id != task.task_id || updated.workflow_id != task.workflow_id {
        return Err(PhasegateError::InvalidTransition(format!(
            "task {} identity is immutable",
            task.task_id
        )));
    }
    if updated.history.len() < task.history.len()
        || updated.history[..task.history.len()] != task.history[..]
    {
        return Err(PhasegateError::InvalidTransition(format!(
            "task {} history is append-only",
            task.task_id
        )));
    }

    updated.touch(Utc::now());
    updated
        .check_invariants()
        .map_err(PhasegateError::InvalidTransition)?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_filter_matching() {
        let mut task = Task::new("t1", "SPEC", "Spec");
        task.workflow_id = "wf".to_string();

        assert!(TaskFilter::all().matches(&task));
        assert!(TaskFilter::workflow("wf").in_phase("SPEC").matches(&task));
        assert!(!TaskFilter::workflow("other").matches(&task));
        assert!(!TaskFilter::all()
            .with_status(TaskStatus::Completed)
            .matches(&task));
    }

    #[test]
    fn test_sort_by_priority_then_age() {
        let base = Utc::now();
        let mut tasks = vec![
            Task::new("low", "P", "low")
                .with_priority(phasegate_core::Priority::Low)
                .created(base),
            Task::new("late", "P", "late").created(base + Duration::seconds(5)),
            Task::new("early", "P", "early").created(base),
            Task::new("crit", "P", "crit")
                .with_priority(phasegate_core::Priority::Critical)
                .created(base + Duration::seconds(9)),
        ];
        sort_tasks(&mut tasks);

        let order: Vec<_> = tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(order, vec!["crit", "early", "late", "low"]);
    }

    #[test]
    fn test_apply_progress_rejects_terminal() {
        let mut task = Task::new("t1", "SPEC", "Spec");
        task.status = TaskStatus::Deferred;

        let result = apply_progress(
            &mut task,
            ProgressEntry::new("a", "draft", "failed: x"),
            TaskStatus::InProgress,
        );
        assert!(matches!(result, Err(PhasegateError::InvalidTransition(_))));
        assert!(task.history.is_empty());
    }

    #[test]
    fn test_apply_mutation_protects_history() {
        let mut task = Task::new("t1", "SPEC", "Spec");
        task.history.push(ProgressEntry::new("a", "draft", "failed: x"));

        let result = apply_mutation(&task, Box::new(|t: &mut Task| {
            t.history.clear();
            Ok(())
        }));
        assert!(matches!(result, Err(PhasegateError::InvalidTransition(_))));
    }
}
