//! Signals surfaced to the dispatcher and the approval surface

use phasegate_core::{BreakerState, PhaseLockState, Task, TaskStatus, WorkflowStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::breaker::BreakerEvent;

/// Something a caller must react to. Returned only after the state change that
/// caused it is durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    /// Spend crossed a warning threshold
    Warning {
        threshold: f64,
        spent_usd: f64,
        budget_usd: f64,
    },
    /// Spend reached the budget; the breaker just tripped
    Break { spent_usd: f64, budget_usd: f64 },
    /// Dispatch is blocked until the breaker is reset
    Suspended { workflow_id: String },
    /// A task kept repeating itself and was blocked
    Looping { task_id: String },
    /// An in-progress task has not reported for too long
    Stale { task_id: String, idle_secs: u64 },
    /// The current phase is settled and needs a human decision
    PhaseAwaitingApproval { phase: String },
    /// Every phase is locked
    WorkflowComplete { workflow_id: String },
}

impl From<BreakerEvent> for Signal {
    fn from(event: BreakerEvent) -> Self {
        match event {
            BreakerEvent::Warning {
                threshold,
                spent_usd,
                budget_usd,
            } => Signal::Warning {
                threshold,
                spent_usd,
                budget_usd,
            },
            BreakerEvent::Break {
                spent_usd,
                budget_usd,
            } => Signal::Break {
                spent_usd,
                budget_usd,
            },
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Warning {
                threshold,
                spent_usd,
                budget_usd,
            } => write!(
                f,
                "budget warning: {:.0}% threshold crossed (${:.4} of ${:.2})",
                threshold * 100.0,
                spent_usd,
                budget_usd
            ),
            Signal::Break {
                spent_usd,
                budget_usd,
            } => write!(
                f,
                "budget exhausted: ${:.4} of ${:.2}, breaker tripped",
                spent_usd, budget_usd
            ),
            Signal::Suspended { workflow_id } => {
                write!(f, "workflow {} suspended, dispatch blocked", workflow_id)
            }
            Signal::Looping { task_id } => write!(f, "task {} is looping, blocked", task_id),
            Signal::Stale { task_id, idle_secs } => {
                write!(f, "task {} stale, idle for {}s", task_id, idle_secs)
            }
            Signal::PhaseAwaitingApproval { phase } => {
                write!(f, "phase {} awaiting approval", phase)
            }
            Signal::WorkflowComplete { workflow_id } => {
                write!(f, "workflow {} complete", workflow_id)
            }
        }
    }
}

/// Result of a progress report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressOutcome {
    /// The task the dispatcher should start next, if any
    pub next_task: Option<Task>,
    pub signals: Vec<Signal>,
}

impl ProgressOutcome {
    pub fn has_signal(&self, predicate: impl Fn(&Signal) -> bool) -> bool {
        self.signals.iter().any(predicate)
    }
}

/// Read-only summary of a workflow for status displays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusView {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    /// Current phase; `None` once every phase is locked
    pub phase: Option<String>,
    pub phase_lock_state: Option<PhaseLockState>,
    pub breaker_state: BreakerState,
    pub spent_usd: f64,
    pub budget_usd: f64,
    pub task_counts: BTreeMap<TaskStatus, usize>,
    pub total_tasks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_event_conversion() {
        let signal: Signal = BreakerEvent::Break {
            spent_usd: 10.5,
            budget_usd: 10.0,
        }
        .into();
        assert!(matches!(signal, Signal::Break { .. }));
    }

    #[test]
    fn test_signal_serialization_is_tagged() {
        let json = serde_json::to_value(Signal::Looping {
            task_id: "t1".into(),
        })
        .unwrap();
        assert_eq!(json["signal"], "looping");
        assert_eq!(json["task_id"], "t1");
    }

    #[test]
    fn test_display() {
        let signal = Signal::Warning {
            threshold: 0.75,
            spent_usd: 7.5,
            budget_usd: 10.0,
        };
        assert!(signal.to_string().contains("75%"));
    }
}
