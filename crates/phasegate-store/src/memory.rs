//! In-process ledger store

use async_trait::async_trait;
use phasegate_core::{PhasegateError, ProgressEntry, Result, Task, TaskStatus, Workflow};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::store::{apply_mutation, apply_progress, sort_tasks, LedgerStore, TaskFilter, TaskMutation};

#[derive(Default)]
struct Ledger {
    tasks: HashMap<String, Task>,
    workflows: HashMap<String, Workflow>,
}

/// Ledger store kept entirely in memory.
///
/// Durable only for the life of the process; used by tests and by callers that
/// persist snapshots themselves.
#[derive(Default)]
pub struct MemoryStore {
    ledger: RwLock<Ledger>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn create_task(&self, task: Task) -> Result<Task> {
        task.check_invariants()
            .map_err(PhasegateError::InvalidWorkflow)?;

        let mut ledger = self.ledger.write().await;
        if ledger.tasks.contains_key(&task.task_id) {
            return Err(PhasegateError::AlreadyExists(format!("task {}", task.task_id)));
        }
        debug!(task_id = %task.task_id, "Created task");
        ledger.tasks.insert(task.task_id.clone(), task.clone());
        Ok(task)
    }

    async fn get_task(&self, task_id: &str) -> Result<Task> {
        let ledger = self.ledger.read().await;
        ledger
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| PhasegateError::task_not_found(task_id))
    }

    async fn append_progress(
        &self,
        task_id: &str,
        entry: ProgressEntry,
        status: TaskStatus,
    ) -> Result<Task> {
        let mut ledger = self.ledger.write().await;
        let current = ledger
            .tasks
            .get(task_id)
            .ok_or_else(|| PhasegateError::task_not_found(task_id))?;

        let mut updated = current.clone();
        apply_progress(&mut updated, entry, status)?;
        ledger.tasks.insert(task_id.to_string(), updated.clone());
        Ok(updated)
    }

    async fn update_task(&self, task_id: &str, mutation: TaskMutation) -> Result<Task> {
        let mut ledger = self.ledger.write().await;
        let current = ledger
            .tasks
            .get(task_id)
            .ok_or_else(|| PhasegateError::task_not_found(task_id))?;

        let updated = apply_mutation(current, mutation)?;
        ledger.tasks.insert(task_id.to_string(), updated.clone());
        Ok(updated)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let ledger = self.ledger.read().await;
        let mut tasks: Vec<Task> = ledger
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        sort_tasks(&mut tasks);
        Ok(tasks)
    }

    async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow> {
        let mut ledger = self.ledger.write().await;
        if ledger.workflows.contains_key(&workflow.workflow_id) {
            return Err(PhasegateError::AlreadyExists(format!(
                "workflow {}",
                workflow.workflow_id
            )));
        }
        ledger
            .workflows
            .insert(workflow.workflow_id.clone(), workflow.clone());
        Ok(workflow)
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        let ledger = self.ledger.read().await;
        ledger
            .workflows
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| PhasegateError::workflow_not_found(workflow_id))
    }

    async fn put_workflow(&self, workflow: Workflow) -> Result<Workflow> {
        let mut ledger = self.ledger.write().await;
        if !ledger.workflows.contains_key(&workflow.workflow_id) {
            return Err(PhasegateError::workflow_not_found(&workflow.workflow_id));
        }
        ledger
            .workflows
            .insert(workflow.workflow_id.clone(), workflow.clone());
        Ok(workflow)
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let ledger = self.ledger.read().await;
        let mut workflows: Vec<Workflow> = ledger.workflows.values().cloned().collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(workflows)
    }
}
