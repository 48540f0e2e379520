//! Workflow aggregate: phase sequence, lock states and budget ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Task, TaskId, WorkflowId};

/// Standard pipeline phases
pub const DEFAULT_PHASES: [&str; 7] = [
    "SPEC",
    "TEST_DESIGN",
    "TEST_IMPL",
    "IMPLEMENT",
    "VALIDATE",
    "REVIEW",
    "DELIVER",
];

/// Warning thresholds raised before the breaker trips
pub const DEFAULT_THRESHOLDS: [f64; 3] = [0.50, 0.75, 0.90];

/// Lock state of a single phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseLockState {
    /// Tasks schedulable, artifacts mutable
    #[default]
    Open,
    /// Every phase task settled, waiting for an approval signal
    AwaitingApproval,
    /// Approved; immutable phases reject further content mutation
    Locked,
}

impl std::fmt::Display for PhaseLockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::AwaitingApproval => write!(f, "awaiting_approval"),
            Self::Locked => write!(f, "locked"),
        }
    }
}

/// Cost circuit breaker state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    #[default]
    Closed,
    Warning,
    Suspended,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Warning => write!(f, "warning"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

/// Lifecycle of the workflow as a whole
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Active,
    Complete,
    Aborted,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Complete => write!(f, "complete"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// A rejection recorded against a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Per-phase gate state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub name: String,
    #[serde(default)]
    pub lock: PhaseLockState,
    /// Whether the phase's tasks freeze once the phase locks
    #[serde(default)]
    pub immutable: bool,
    #[serde(default)]
    pub rejections: Vec<Rejection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    /// SHA-256 over the phase's task content, taken when an immutable phase locks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_fingerprint: Option<String>,
}

impl PhaseState {
    pub fn new(name: impl Into<String>, immutable: bool) -> Self {
        Self {
            name: name.into(),
            lock: PhaseLockState::Open,
            immutable,
            rejections: Vec::new(),
            locked_at: None,
            locked_fingerprint: None,
        }
    }

    /// Content of this phase's tasks may no longer change
    pub fn is_frozen(&self) -> bool {
        self.immutable && self.lock == PhaseLockState::Locked
    }
}

/// Per-workflow monetary accounting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLedger {
    pub spent_usd: f64,
    pub budget_usd: f64,
    /// Warning fractions, ascending
    pub thresholds: Vec<f64>,
    /// Thresholds already raised, never raised again
    #[serde(default)]
    pub warnings_emitted: Vec<f64>,
    #[serde(default)]
    pub breaker_state: BreakerState,
}

impl BudgetLedger {
    pub fn new(budget_usd: f64) -> Self {
        Self::with_thresholds(budget_usd, DEFAULT_THRESHOLDS.to_vec())
    }

    pub fn with_thresholds(budget_usd: f64, mut thresholds: Vec<f64>) -> Self {
        thresholds.retain(|t| t.is_finite() && *t > 0.0 && *t < 1.0);
        thresholds.sort_by(|a, b| a.total_cmp(b));
        thresholds.dedup();
        Self {
            spent_usd: 0.0,
            budget_usd,
            thresholds,
            warnings_emitted: Vec::new(),
            breaker_state: BreakerState::Closed,
        }
    }

    /// Fraction of the budget spent; a non-positive budget counts as exhausted
    pub fn fraction(&self) -> f64 {
        if self.budget_usd <= 0.0 {
            return f64::INFINITY;
        }
        self.spent_usd / self.budget_usd
    }

    pub fn remaining_usd(&self) -> f64 {
        (self.budget_usd - self.spent_usd).max(0.0)
    }

    pub fn warning_emitted(&self, threshold: f64) -> bool {
        self.warnings_emitted
            .iter()
            .any(|t| (t - threshold).abs() < f64::EPSILON)
    }

    pub fn is_suspended(&self) -> bool {
        self.breaker_state == BreakerState::Suspended
    }
}

/// Everything needed to instantiate a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub workflow_id: WorkflowId,
    /// Empty means the configured default sequence
    #[serde(default)]
    pub phase_sequence: Vec<String>,
    /// Phases whose tasks become immutable once approved
    #[serde(default)]
    pub immutable_phases: Vec<String>,
    #[serde(default)]
    pub initial_tasks: Vec<Task>,
    /// `None` means the configured default budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_usd: Option<f64>,
    /// Overrides the configured warning thresholds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<Vec<f64>>,
}

impl WorkflowSpec {
    pub fn new(workflow_id: impl Into<String>, phase_sequence: Vec<String>, budget_usd: f64) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            phase_sequence,
            immutable_phases: Vec::new(),
            initial_tasks: Vec::new(),
            budget_usd: Some(budget_usd),
            thresholds: None,
        }
    }

    /// A spec that takes its phases and budget from configuration
    pub fn with_defaults(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            phase_sequence: Vec::new(),
            immutable_phases: Vec::new(),
            initial_tasks: Vec::new(),
            budget_usd: None,
            thresholds: None,
        }
    }

    pub fn with_tasks(mut self, tasks: Vec<Task>) -> Self {
        self.initial_tasks = tasks;
        self
    }

    pub fn with_immutable_phases(mut self, phases: Vec<String>) -> Self {
        self.immutable_phases = phases;
        self
    }

    pub fn with_thresholds(mut self, thresholds: Vec<f64>) -> Self {
        self.thresholds = Some(thresholds);
        self
    }
}

/// Durable record of one workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: WorkflowId,
    pub phases: Vec<PhaseState>,
    pub current_phase_index: usize,
    pub budget: BudgetLedger,
    /// Member tasks in creation order
    #[serde(default)]
    pub task_ids: Vec<TaskId>,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(workflow_id: impl Into<String>, phases: Vec<PhaseState>, budget: BudgetLedger) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            phases,
            current_phase_index: 0,
            budget,
            task_ids: Vec::new(),
            status: WorkflowStatus::Active,
            abort_reason: None,
            archived_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The phase currently eligible for scheduling; `None` once every phase is locked
    pub fn current_phase(&self) -> Option<&PhaseState> {
        self.phases.get(self.current_phase_index)
    }

    pub fn current_phase_mut(&mut self) -> Option<&mut PhaseState> {
        self.phases.get_mut(self.current_phase_index)
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseState> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    pub fn contains_task(&self, task_id: &str) -> bool {
        self.task_ids.iter().any(|id| id == task_id)
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }

    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}
