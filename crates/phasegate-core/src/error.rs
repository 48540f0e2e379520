//! Unified error types for Phasegate

use thiserror::Error;

/// Unified error type for all Phasegate operations
#[derive(Error, Debug)]
pub enum PhasegateError {
    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    // State machine errors
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Immutable artifact: {0}")]
    ImmutableArtifact(String),

    #[error("Dependency unsatisfied: task {task_id} waits on {pending:?}")]
    DependencyUnsatisfied {
        task_id: String,
        pending: Vec<String>,
    },

    // Budget errors
    #[error("Budget suspended for workflow {0}: reset the breaker to resume dispatch")]
    BudgetSuspended(String),

    // Construction-time validation errors
    #[error("Cyclic dependency among tasks: {0:?}")]
    CyclicDependency(Vec<String>),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    // Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PhasegateError {
    pub fn task_not_found(task_id: &str) -> Self {
        Self::NotFound(format!("task {}", task_id))
    }

    pub fn workflow_not_found(workflow_id: &str) -> Self {
        Self::NotFound(format!("workflow {}", workflow_id))
    }
}

/// Result type alias using PhasegateError
pub type Result<T> = std::result::Result<T, PhasegateError>;
