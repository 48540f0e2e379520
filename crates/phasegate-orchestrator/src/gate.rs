//! Phase gate: approval-gated advancement through the phase sequence
//!
//! The lock-state machine is a pure function with NO I/O:
//! `transition(lock, event) -> (lock, actions)`. [`PhaseGate`] applies it to a
//! [`Workflow`] record; persisting the result is the caller's job.
//!
//! ```text
//! OPEN --AllTasksSettled--> AWAITING_APPROVAL --Approve--> LOCKED
//!   ^                              |
//!   +------------Reject(reason)----+
//! ```

use chrono::{DateTime, Utc};
use phasegate_core::{
    PhaseLockState, PhasegateError, Rejection, Result, Task, Workflow, WorkflowStatus,
};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::scheduler::unsettled;

/// Events that drive a phase's lock state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateEvent {
    /// Every task of the phase is COMPLETED or DEFERRED
    AllTasksSettled,
    /// Human approval of the phase's output
    Approve,
    /// Human rejection; the phase reopens for rework
    Reject { reason: String },
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateAction {
    /// Tell the approval surface a phase is waiting
    RequestApproval,
    /// Freeze immutable content and record the lock time
    Lock,
    /// Move the workflow to the next phase
    Advance,
    /// Keep the rejection reason in the phase history
    RecordRejection { reason: String },
}

/// Pure lock-state transition.
///
/// # Errors
/// Any pair not in the diagram above is `InvalidTransition`.
pub fn transition(
    lock: PhaseLockState,
    event: GateEvent,
) -> Result<(PhaseLockState, Vec<GateAction>)> {
    match (lock, event) {
        (PhaseLockState::Open, GateEvent::AllTasksSettled) => Ok((
            PhaseLockState::AwaitingApproval,
            vec![GateAction::RequestApproval],
        )),
        (PhaseLockState::AwaitingApproval, GateEvent::Approve) => Ok((
            PhaseLockState::Locked,
            vec![GateAction::Lock, GateAction::Advance],
        )),
        (PhaseLockState::AwaitingApproval, GateEvent::Reject { reason }) => Ok((
            PhaseLockState::Open,
            vec![GateAction::RecordRejection { reason }],
        )),
        (lock, event) => Err(PhasegateError::InvalidTransition(format!(
            "phase in state {} cannot handle {:?}",
            lock, event
        ))),
    }
}

/// What an approval did to the workflow
#[derive(Debug, Clone, PartialEq)]
pub struct Approval {
    pub locked_phase: String,
    /// Phase now open for scheduling, `None` when the workflow completed
    pub next_phase: Option<String>,
    pub fingerprint: Option<String>,
}

impl Approval {
    pub fn workflow_complete(&self) -> bool {
        self.next_phase.is_none()
    }
}

/// Applies gate transitions to one workflow
pub struct PhaseGate<'a> {
    workflow: &'a mut Workflow,
}

impl<'a> PhaseGate<'a> {
    pub fn new(workflow: &'a mut Workflow) -> Self {
        Self { workflow }
    }

    /// Move the current phase to AWAITING_APPROVAL if all its tasks are settled.
    ///
    /// `tasks` is the workflow's full task slice. Returns the phase name when the
    /// transition happened. An empty phase settles immediately.
    pub fn evaluate(&mut self, tasks: &[Task]) -> Option<String> {
        if self.workflow.status != WorkflowStatus::Active {
            return None;
        }
        let phase = self.workflow.current_phase_mut()?;
        if phase.lock != PhaseLockState::Open {
            return None;
        }
        if unsettled(tasks, &phase.name).next().is_some() {
            return None;
        }

        let (lock, _) = transition(phase.lock, GateEvent::AllTasksSettled).ok()?;
        phase.lock = lock;
        let name = phase.name.clone();
        info!(
            workflow_id = %self.workflow.workflow_id,
            phase = %name,
            "Phase settled, awaiting approval"
        );
        self.workflow.touch();
        Some(name)
    }

    /// Approve the current phase: lock it, fingerprint immutable content and advance.
    pub fn approve(&mut self, phase_name: &str, tasks: &[Task], now: DateTime<Utc>) -> Result<Approval> {
        let index = self.current_index_for(phase_name)?;
        let phase = &mut self.workflow.phases[index];

        let (lock, actions) = transition(phase.lock, GateEvent::Approve)?;
        phase.lock = lock;

        let mut fingerprint_value = None;
        for action in actions {
            match action {
                GateAction::Lock => {
                    phase.locked_at = Some(now);
                    if phase.immutable {
                        let fp = fingerprint(tasks, &phase.name);
                        phase.locked_fingerprint = Some(fp.clone());
                        fingerprint_value = Some(fp);
                    }
                }
                GateAction::Advance => {
                    self.workflow.current_phase_index = index + 1;
                }
                GateAction::RequestApproval | GateAction::RecordRejection { .. } => {}
            }
        }

        let next_phase = self.workflow.current_phase().map(|p| p.name.clone());
        if next_phase.is_none() {
            self.workflow.status = WorkflowStatus::Complete;
        }
        self.workflow.touch();

        info!(
            workflow_id = %self.workflow.workflow_id,
            phase = phase_name,
            next_phase = next_phase.as_deref().unwrap_or("-"),
            immutable = fingerprint_value.is_some(),
            "Phase approved and locked"
        );

        Ok(Approval {
            locked_phase: phase_name.to_string(),
            next_phase,
            fingerprint: fingerprint_value,
        })
    }

    /// Reject the current phase back to OPEN, recording the reason
    pub fn reject(&mut self, phase_name: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let index = self.current_index_for(phase_name)?;
        let phase = &mut self.workflow.phases[index];

        let (lock, actions) = transition(
            phase.lock,
            GateEvent::Reject {
                reason: reason.to_string(),
            },
        )?;
        phase.lock = lock;
        for action in actions {
            if let GateAction::RecordRejection { reason } = action {
                phase.rejections.push(Rejection { reason, at: now });
            }
        }
        self.workflow.touch();

        info!(
            workflow_id = %self.workflow.workflow_id,
            phase = phase_name,
            reason,
            "Phase rejected, reopened for rework"
        );
        Ok(())
    }

    fn current_index_for(&self, phase_name: &str) -> Result<usize> {
        if !self.workflow.is_active() {
            return Err(PhasegateError::InvalidTransition(format!(
                "workflow {} is {}",
                self.workflow.workflow_id, self.workflow.status
            )));
        }
        let index = self.workflow.phase_index(phase_name).ok_or_else(|| {
            PhasegateError::NotFound(format!(
                "phase {} in workflow {}",
                phase_name, self.workflow.workflow_id
            ))
        })?;
        if index != self.workflow.current_phase_index {
            return Err(PhasegateError::InvalidTransition(format!(
                "phase {} is not the current phase of workflow {}",
                phase_name, self.workflow.workflow_id
            )));
        }
        Ok(index)
    }
}

/// SHA-256 over the content of a phase's tasks, in id order.
///
/// Timestamps and the assignee are excluded so the value only changes when
/// the phase's output does.
pub fn fingerprint(tasks: &[Task], phase: &str) -> String {
    let mut members: Vec<&Task> = tasks.iter().filter(|t| t.phase == phase).collect();
    members.sort_by(|a, b| a.task_id.cmp(&b.task_id));

    let mut hasher = Sha256::new();
    for task in members {
        hash_str(&mut hasher, &task.task_id);
        hash_str(&mut hasher, &task.title);
        hash_str(&mut hasher, &task.objective);
        hash_str(&mut hasher, &task.category);
        hash_str(&mut hasher, &task.status.to_string());
        hash_str(&mut hasher, &task.priority.to_string());
        for criterion in &task.acceptance_criteria {
            hash_str(&mut hasher, criterion);
        }
        hasher.update([0xff]);
        for dep in &task.dependencies {
            hash_str(&mut hasher, dep);
        }
        hasher.update([0xff]);
        for artifact in &task.artifacts {
            hash_str(&mut hasher, artifact);
        }
        hasher.update([0xff]);
        hash_str(&mut hasher, &task.history.len().to_string());
    }
    hex::encode(hasher.finalize())
}

fn hash_str(hasher: &mut Sha256, s: &str) {
    hasher.update(s.as_bytes());
    hasher.update([0]);
}

/// Recompute every locked fingerprint and compare with the recorded value
pub fn verify_locks(workflow: &Workflow, tasks: &[Task]) -> Result<()> {
    for phase in workflow.phases.iter().filter(|p| p.is_frozen()) {
        let Some(expected) = &phase.locked_fingerprint else {
            continue;
        };
        let actual = fingerprint(tasks, &phase.name);
        if &actual != expected {
            return Err(PhasegateError::ImmutableArtifact(format!(
                "content of locked phase {} changed (expected {}, found {})",
                phase.name, expected, actual
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use phasegate_core::{BudgetLedger, PhaseState, ProgressEntry, TaskStatus};

    fn workflow() -> Workflow {
        Workflow::new(
            "wf",
            vec![
                PhaseState::new("SPEC", false),
                PhaseState::new("TEST_IMPL", true),
            ],
            BudgetLedger::new(10.0),
        )
    }

    fn done(id: &str, phase: &str) -> Task {
        let mut task = Task::new(id, phase, id);
        task.history.push(ProgressEntry::new("a", "work", "success"));
        task.status = TaskStatus::Completed;
        task
    }

    #[test]
    fn test_transition_table() {
        let (lock, actions) =
            transition(PhaseLockState::Open, GateEvent::AllTasksSettled).unwrap();
        assert_eq!(lock, PhaseLockState::AwaitingApproval);
        assert_eq!(actions, vec![GateAction::RequestApproval]);

        let (lock, actions) =
            transition(PhaseLockState::AwaitingApproval, GateEvent::Approve).unwrap();
        assert_eq!(lock, PhaseLockState::Locked);
        assert_eq!(actions, vec![GateAction::Lock, GateAction::Advance]);

        let (lock, _) = transition(
            PhaseLockState::AwaitingApproval,
            GateEvent::Reject {
                reason: "thin".into(),
            },
        )
        .unwrap();
        assert_eq!(lock, PhaseLockState::Open);
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(transition(PhaseLockState::Open, GateEvent::Approve).is_err());
        assert!(transition(PhaseLockState::Locked, GateEvent::Approve).is_err());
        assert!(transition(
            PhaseLockState::Locked,
            GateEvent::Reject { reason: "x".into() }
        )
        .is_err());
        assert!(transition(PhaseLockState::AwaitingApproval, GateEvent::AllTasksSettled).is_err());
    }

    #[test]
    fn test_evaluate_waits_for_all_tasks() {
        let mut wf = workflow();
        let mut tasks = vec![done("s1", "SPEC"), Task::new("s2", "SPEC", "s2")];

        assert_eq!(PhaseGate::new(&mut wf).evaluate(&tasks), None);

        tasks[1].status = TaskStatus::Deferred;
        assert_eq!(
            PhaseGate::new(&mut wf).evaluate(&tasks),
            Some("SPEC".to_string())
        );
        assert_eq!(wf.phases[0].lock, PhaseLockState::AwaitingApproval);

        // Second evaluation is a no-op
        assert_eq!(PhaseGate::new(&mut wf).evaluate(&tasks), None);
    }

    #[test]
    fn test_empty_phase_settles() {
        let mut wf = workflow();
        assert_eq!(PhaseGate::new(&mut wf).evaluate(&[]), Some("SPEC".to_string()));
    }

    #[test]
    fn test_approve_advances_and_completes() {
        let mut wf = workflow();
        let tasks = vec![done("s1", "SPEC"), done("t1", "TEST_IMPL")];
        let now = Utc::now();

        PhaseGate::new(&mut wf).evaluate(&tasks);
        let approval = PhaseGate::new(&mut wf).approve("SPEC", &tasks, now).unwrap();
        assert_eq!(approval.next_phase.as_deref(), Some("TEST_IMPL"));
        assert!(approval.fingerprint.is_none());
        assert_eq!(wf.current_phase_index, 1);

        PhaseGate::new(&mut wf).evaluate(&tasks);
        let approval = PhaseGate::new(&mut wf).approve("TEST_IMPL", &tasks, now).unwrap();
        assert!(approval.workflow_complete());
        assert!(approval.fingerprint.is_some());
        assert_eq!(wf.status, WorkflowStatus::Complete);
        assert!(wf.phases[1].is_frozen());
    }

    #[test]
    fn test_approve_requires_current_phase() {
        let mut wf = workflow();
        PhaseGate::new(&mut wf).evaluate(&[]);

        let err = PhaseGate::new(&mut wf)
            .approve("TEST_IMPL", &[], Utc::now())
            .unwrap_err();
        assert!(matches!(err, PhasegateError::InvalidTransition(_)));

        let err = PhaseGate::new(&mut wf)
            .approve("NOPE", &[], Utc::now())
            .unwrap_err();
        assert!(matches!(err, PhasegateError::NotFound(_)));
    }

    #[test]
    fn test_reject_records_reason_and_reopens() {
        let mut wf = workflow();
        PhaseGate::new(&mut wf).evaluate(&[]);
        PhaseGate::new(&mut wf)
            .reject("SPEC", "missing edge cases", Utc::now())
            .unwrap();

        assert_eq!(wf.phases[0].lock, PhaseLockState::Open);
        assert_eq!(wf.phases[0].rejections.len(), 1);
        assert_eq!(wf.phases[0].rejections[0].reason, "missing edge cases");

        // Rejecting an open phase is not allowed
        assert!(PhaseGate::new(&mut wf)
            .reject("SPEC", "again", Utc::now())
            .is_err());
    }

    #[test]
    fn test_fingerprint_tracks_content_only() {
        let tasks = vec![done("t1", "TEST_IMPL"), done("t2", "TEST_IMPL")];
        let base = fingerprint(&tasks, "TEST_IMPL");

        let mut touched = tasks.clone();
        touched[0].updated_at = touched[0].updated_at + chrono::Duration::hours(1);
        touched.reverse();
        assert_eq!(fingerprint(&touched, "TEST_IMPL"), base);

        let mut edited = tasks.clone();
        edited[0].title = "rewritten".into();
        assert_ne!(fingerprint(&edited, "TEST_IMPL"), base);
    }

    #[test]
    fn test_verify_locks_detects_tampering() {
        let mut wf = workflow();
        let mut tasks = vec![done("s1", "SPEC"), done("t1", "TEST_IMPL")];
        let now = Utc::now();
        PhaseGate::new(&mut wf).evaluate(&tasks);
        PhaseGate::new(&mut wf).approve("SPEC", &tasks, now).unwrap();
        PhaseGate::new(&mut wf).evaluate(&tasks);
        PhaseGate::new(&mut wf).approve("TEST_IMPL", &tasks, now).unwrap();

        assert!(verify_locks(&wf, &tasks).is_ok());

        tasks[1].artifacts.push("tests/sneaky.rs".into());
        assert!(matches!(
            verify_locks(&wf, &tasks),
            Err(PhasegateError::ImmutableArtifact(_))
        ));
    }
}
