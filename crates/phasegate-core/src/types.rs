//! Task ledger data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Task identifier (caller-assigned, immutable)
pub type TaskId = String;

/// Workflow identifier
pub type WorkflowId = String;

/// Task priority levels. Lower numeric value means more urgent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 1,
    High = 2,
    #[default]
    Medium = 3,
    Low = 4,
}

impl Priority {
    /// Numeric urgency (1 = critical, 4 = low)
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" | "1" => Ok(Self::Critical),
            "high" | "2" => Ok(Self::High),
            "medium" | "3" => Ok(Self::Medium),
            "low" | "4" => Ok(Self::Low),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Scheduling status of a task
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    NotStarted,
    InProgress,
    Blocked,
    PendingReview,
    Completed,
    Deferred,
}

impl TaskStatus {
    /// COMPLETED and DEFERRED accept no further progress without an explicit reopen
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Deferred)
    }

    /// Statuses the scheduler may pick from
    pub fn is_schedulable(self) -> bool {
        matches!(self, Self::NotStarted | Self::InProgress)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Blocked => write!(f, "blocked"),
            Self::PendingReview => write!(f, "pending_review"),
            Self::Completed => write!(f, "completed"),
            Self::Deferred => write!(f, "deferred"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "not_started" | "notstarted" => Ok(Self::NotStarted),
            "in_progress" | "inprogress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "pending_review" | "pendingreview" | "review" => Ok(Self::PendingReview),
            "completed" | "done" => Ok(Self::Completed),
            "deferred" => Ok(Self::Deferred),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

/// Coarse reading of a free-text outcome string.
///
/// The engine never interprets what an outcome means beyond this prefix convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
    Blocked,
    Other,
}

impl Outcome {
    pub fn classify(outcome: &str) -> Self {
        let outcome = outcome.trim().to_lowercase();
        if outcome.starts_with("success") {
            Self::Success
        } else if outcome.starts_with("failed") {
            Self::Failed
        } else if outcome.starts_with("blocked") {
            Self::Blocked
        } else {
            Self::Other
        }
    }

    /// Task status implied by a report with this outcome
    pub fn implied_status(self) -> TaskStatus {
        match self {
            Self::Success => TaskStatus::Completed,
            Self::Blocked => TaskStatus::Blocked,
            Self::Failed | Self::Other => TaskStatus::InProgress,
        }
    }
}

/// Token usage reported by a worker, split by direction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Worker tier used for pricing (e.g. "opus", "sonnet", "haiku")
    pub tier: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(tier: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            tier: tier.into(),
            input_tokens,
            output_tokens,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// One immutable report from a worker about one attempt on a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    /// Short description of what was attempted
    pub action_taken: String,
    /// Conventionally "success", "failed: <reason>" or "blocked"
    pub outcome: String,
    #[serde(default)]
    pub artifacts_produced: Vec<String>,
    #[serde(default)]
    pub blockers_encountered: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_consumed: Option<TokenUsage>,
}

impl ProgressEntry {
    pub fn new(
        agent_id: impl Into<String>,
        action_taken: impl Into<String>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            agent_id: agent_id.into(),
            action_taken: action_taken.into(),
            outcome: outcome.into(),
            artifacts_produced: Vec::new(),
            blockers_encountered: Vec::new(),
            next_steps: Vec::new(),
            tokens_consumed: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_tokens(mut self, usage: TokenUsage) -> Self {
        self.tokens_consumed = Some(usage);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts_produced = artifacts;
        self
    }

    pub fn with_blockers(mut self, blockers: Vec<String>) -> Self {
        self.blockers_encountered = blockers;
        self
    }

    pub fn with_next_steps(mut self, next_steps: Vec<String>) -> Self {
        self.next_steps = next_steps;
        self
    }

    pub fn outcome_kind(&self) -> Outcome {
        Outcome::classify(&self.outcome)
    }
}

/// One unit of work in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    /// Owning workflow (filled in when the task is registered with one)
    #[serde(default)]
    pub workflow_id: WorkflowId,

    // Classification
    pub phase: String,
    #[serde(default)]
    pub category: String,

    // Description
    pub title: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,

    // Scheduling state
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Agent the task is currently dispatched to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    // Timestamps
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    // History and outputs
    #[serde(default)]
    pub history: Vec<ProgressEntry>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Task {
    pub fn new(
        task_id: impl Into<String>,
        phase: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            workflow_id: String::new(),
            phase: phase.into(),
            category: String::new(),
            title: title.into(),
            objective: String::new(),
            acceptance_criteria: Vec::new(),
            status: TaskStatus::NotStarted,
            priority: Priority::Medium,
            dependencies: BTreeSet::new(),
            assignee: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
            artifacts: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_objective(mut self, objective: impl Into<String>) -> Self {
        self.objective = objective.into();
        self
    }

    pub fn with_acceptance_criteria(mut self, criteria: Vec<String>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// Bump `updated_at`, never moving it backwards
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.updated_at {
            self.updated_at = at;
        }
    }

    pub fn has_success(&self) -> bool {
        self.history
            .iter()
            .any(|e| e.outcome_kind() == Outcome::Success)
    }

    /// Ledger invariants that hold for every stored task
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        if self.task_id.trim().is_empty() {
            return Err("task_id must not be empty".to_string());
        }
        if self.status == TaskStatus::Completed && !self.has_success() {
            return Err(format!(
                "task {} is completed without a successful progress entry",
                self.task_id
            ));
        }
        if self.updated_at < self.created_at {
            return Err(format!("task {} updated before it was created", self.task_id));
        }
        if self.dependencies.contains(&self.task_id) {
            return Err(format!("task {} depends on itself", self.task_id));
        }
        Ok(())
    }
}

/// Content edit to an existing task. `None` fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskEdit {
    pub title: Option<String>,
    pub objective: Option<String>,
    pub category: Option<String>,
    pub acceptance_criteria: Option<Vec<String>>,
    pub priority: Option<Priority>,
    pub dependencies: Option<BTreeSet<TaskId>>,
    /// Appended to `artifacts`
    #[serde(default)]
    pub add_artifacts: Vec<String>,
    /// Appended to `notes`
    pub add_note: Option<String>,
}

impl TaskEdit {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.objective.is_none()
            && self.category.is_none()
            && self.acceptance_criteria.is_none()
            && self.priority.is_none()
            && self.dependencies.is_none()
            && self.add_artifacts.is_empty()
            && self.add_note.is_none()
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(objective) = &self.objective {
            task.objective = objective.clone();
        }
        if let Some(category) = &self.category {
            task.category = category.clone();
        }
        if let Some(criteria) = &self.acceptance_criteria {
            task.acceptance_criteria = criteria.clone();
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(deps) = &self.dependencies {
            task.dependencies = deps.clone();
        }
        task.artifacts.extend(self.add_artifacts.iter().cloned());
        if let Some(note) = &self.add_note {
            task.notes.push(note.clone());
        }
    }
}
