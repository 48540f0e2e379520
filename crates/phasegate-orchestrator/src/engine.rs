//! Orchestration engine
//!
//! Ties the ledger store, loop detector, cost breaker, phase gate and scheduler
//! together. Every mutating operation runs under the workflow's own mutex and
//! persists its changes before returning signals; the engine itself keeps no
//! state besides that lock map, so a restart only needs the store.

use chrono::{DateTime, Utc};
use phasegate_core::{
    BudgetLedger, PhaseLockState, PhaseState, PhasegateConfig, PhasegateError, ProgressEntry,
    Result, Task, TaskEdit, TaskStatus, Workflow, WorkflowSpec, WorkflowStatus,
};
use phasegate_store::{LedgerStore, TaskFilter};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::activity_logger::ActivityLogger;
use crate::breaker::{record_cost, CostBreaker};
use crate::detector::{detect_loop, LoopDetector, TaskHealth};
use crate::gate::{verify_locks, PhaseGate};
use crate::graph::validate_dependencies;
use crate::scheduler::{next_actionable, pending_dependencies};
use crate::signals::{ProgressOutcome, Signal, WorkflowStatusView};

/// Statuses a human may set directly
const OVERRIDABLE: [TaskStatus; 4] = [
    TaskStatus::NotStarted,
    TaskStatus::Blocked,
    TaskStatus::PendingReview,
    TaskStatus::Deferred,
];

/// Phase-gated, budget-aware orchestration over a [`LedgerStore`]
pub struct Engine<S: LedgerStore> {
    store: Arc<S>,
    config: PhasegateConfig,
    breaker: CostBreaker,
    detector: LoopDetector,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Serializes task-id allocation across workflows
    creation: Mutex<()>,
    activity: Option<ActivityLogger>,
}

impl<S: LedgerStore> Engine<S> {
    pub fn new(store: Arc<S>, config: PhasegateConfig) -> Self {
        Self {
            breaker: CostBreaker::new(config.pricing.clone()),
            detector: LoopDetector::from_config(&config.detector),
            store,
            config,
            locks: Mutex::new(HashMap::new()),
            creation: Mutex::new(()),
            activity: None,
        }
    }

    /// Mirror signals and decisions into a markdown activity log
    pub fn with_activity_log(mut self, logger: ActivityLogger) -> Self {
        self.activity = Some(logger);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &PhasegateConfig {
        &self.config
    }

    /// Take the workflow's mutex; unknown workflows get `NotFound` and no entry
    async fn lock_workflow(&self, workflow_id: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().await;
            match locks.get(workflow_id) {
                Some(lock) => Arc::clone(lock),
                None => {
                    self.store.get_workflow(workflow_id).await?;
                    Arc::clone(locks.entry(workflow_id.to_string()).or_default())
                }
            }
        };
        Ok(lock.lock_owned().await)
    }

    // ------------------------------------------------------------------
    // Workflow lifecycle
    // ------------------------------------------------------------------

    /// Validate a spec and persist the workflow with its initial tasks.
    ///
    /// Phases and budget fall back to configuration when the `WorkflowSpec`
    /// leaves them out. Immutable phases come from the spec, or from the
    /// configured defaults present in the sequence when it names none.
    ///
    /// Tasks are written before the workflow record, so an interrupted create
    /// leaves no workflow behind; retrying adopts the tasks it already wrote.
    #[instrument(skip(self, spec), fields(workflow_id = %spec.workflow_id))]
    pub async fn create_workflow(&self, spec: WorkflowSpec) -> Result<Workflow> {
        let mut workflow = self.build_workflow(&spec)?;

        let mut tasks = spec.initial_tasks;
        for task in &mut tasks {
            if workflow.phase(&task.phase).is_none() {
                return Err(PhasegateError::InvalidWorkflow(format!(
                    "task {} names unknown phase {}",
                    task.task_id, task.phase
                )));
            }
            task.workflow_id = workflow.workflow_id.clone();
            task.check_invariants()
                .map_err(PhasegateError::InvalidWorkflow)?;
        }
        validate_dependencies(&tasks)?;

        let _creation = self.creation.lock().await;

        match self.store.get_workflow(&workflow.workflow_id).await {
            Ok(_) => {
                return Err(PhasegateError::AlreadyExists(format!(
                    "workflow {}",
                    workflow.workflow_id
                )))
            }
            Err(PhasegateError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut leftovers = HashSet::new();
        for task in &tasks {
            match self.store.get_task(&task.task_id).await {
                Ok(existing) if existing.workflow_id == workflow.workflow_id => {
                    leftovers.insert(task.task_id.clone());
                }
                Ok(_) => {
                    return Err(PhasegateError::AlreadyExists(format!("task {}", task.task_id)))
                }
                Err(PhasegateError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        workflow.task_ids = tasks.iter().map(|t| t.task_id.clone()).collect();
        PhaseGate::new(&mut workflow).evaluate(&tasks);

        for task in tasks {
            if leftovers.contains(&task.task_id) {
                debug!(task_id = %task.task_id, "Adopting task from an interrupted create");
                let task_id = task.task_id.clone();
                self.store
                    .update_task(
                        &task_id,
                        Box::new(move |t: &mut Task| {
                            *t = task;
                            Ok(())
                        }),
                    )
                    .await?;
            } else {
                self.store.create_task(task).await?;
            }
        }
        let workflow = self.store.create_workflow(workflow).await?;

        info!(
            workflow_id = %workflow.workflow_id,
            phases = workflow.phases.len(),
            tasks = workflow.task_ids.len(),
            budget_usd = workflow.budget.budget_usd,
            "Created workflow"
        );
        if let Some(activity) = &self.activity {
            activity.log_workflow_created(&workflow).await;
        }
        Ok(workflow)
    }

    fn build_workflow(&self, spec: &WorkflowSpec) -> Result<Workflow> {
        if spec.workflow_id.trim().is_empty() {
            return Err(PhasegateError::InvalidWorkflow(
                "workflow_id must not be empty".to_string(),
            ));
        }
        let sequence = if spec.phase_sequence.is_empty() {
            &self.config.phases.sequence
        } else {
            &spec.phase_sequence
        };
        if sequence.is_empty() {
            return Err(PhasegateError::InvalidWorkflow(
                "phase sequence must not be empty".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for phase in sequence {
            if !seen.insert(phase.as_str()) {
                return Err(PhasegateError::InvalidWorkflow(format!(
                    "phase {} appears twice in the sequence",
                    phase
                )));
            }
        }
        let budget_usd = spec
            .budget_usd
            .unwrap_or(self.config.budget.default_budget_usd);
        if budget_usd.is_nan() {
            return Err(PhasegateError::InvalidWorkflow(
                "budget must be a number".to_string(),
            ));
        }

        let immutable: Vec<String> = if spec.immutable_phases.is_empty() {
            self.config
                .phases
                .immutable
                .iter()
                .filter(|p| sequence.contains(p))
                .cloned()
                .collect()
        } else {
            for phase in &spec.immutable_phases {
                if !sequence.contains(phase) {
                    return Err(PhasegateError::InvalidWorkflow(format!(
                        "immutable phase {} is not in the sequence",
                        phase
                    )));
                }
            }
            spec.immutable_phases.clone()
        };

        let phases = sequence
            .iter()
            .map(|name| PhaseState::new(name.clone(), immutable.contains(name)))
            .collect();
        let thresholds = spec
            .thresholds
            .clone()
            .unwrap_or_else(|| self.config.budget.thresholds.clone());

        Ok(Workflow::new(
            spec.workflow_id.clone(),
            phases,
            BudgetLedger::with_thresholds(budget_usd, thresholds),
        ))
    }

    /// Stop the workflow for good; tasks stay readable
    pub async fn abort_workflow(&self, workflow_id: &str, reason: &str) -> Result<Workflow> {
        let _guard = self.lock_workflow(workflow_id).await?;
        let mut workflow = self.store.get_workflow(workflow_id).await?;
        ensure_active(&workflow)?;

        workflow.status = WorkflowStatus::Aborted;
        workflow.abort_reason = Some(reason.to_string());
        workflow.touch();
        let workflow = self.store.put_workflow(workflow).await?;

        warn!(workflow_id, reason, "Workflow aborted");
        self.log_transition(workflow_id, &format!("workflow aborted: {}", reason))
            .await;
        Ok(workflow)
    }

    /// Mark a finished workflow archived
    pub async fn archive_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        let _guard = self.lock_workflow(workflow_id).await?;
        let mut workflow = self.store.get_workflow(workflow_id).await?;
        if workflow.status == WorkflowStatus::Active {
            return Err(PhasegateError::InvalidTransition(format!(
                "workflow {} is still active",
                workflow_id
            )));
        }
        if workflow.archived_at.is_some() {
            return Err(PhasegateError::InvalidTransition(format!(
                "workflow {} is already archived",
                workflow_id
            )));
        }

        workflow.archived_at = Some(Utc::now());
        workflow.touch();
        let workflow = self.store.put_workflow(workflow).await?;
        self.locks.lock().await.remove(workflow_id);
        info!(workflow_id, "Workflow archived");
        Ok(workflow)
    }

    // ------------------------------------------------------------------
    // Progress reports
    // ------------------------------------------------------------------

    /// Record one worker report and return what the dispatcher should do next
    #[instrument(skip(self, entry), fields(agent_id = %entry.agent_id, outcome = %entry.outcome))]
    pub async fn submit_progress(
        &self,
        workflow_id: &str,
        task_id: &str,
        entry: ProgressEntry,
    ) -> Result<ProgressOutcome> {
        let _guard = self.lock_workflow(workflow_id).await?;

        let mut workflow = self.store.get_workflow(workflow_id).await?;
        ensure_active(&workflow)?;
        let task = self.member_task(&workflow, task_id).await?;
        ensure_not_frozen(&workflow, &task)?;
        ensure_phase_reached(&workflow, &task)?;

        let tasks = self.workflow_tasks(workflow_id).await?;
        let pending = pending_dependencies(&task, &tasks);
        if !pending.is_empty() {
            return Err(PhasegateError::DependencyUnsatisfied {
                task_id: task_id.to_string(),
                pending,
            });
        }

        let usage = entry.tokens_consumed.clone();
        let status = entry.outcome_kind().implied_status();
        if let Some(activity) = &self.activity {
            activity.log_progress(workflow_id, task_id, &entry).await;
        }
        let mut task = self.store.append_progress(task_id, entry, status).await?;
        debug!(task_id, status = %task.status, entries = task.history.len(), "Progress recorded");

        let mut signals = Vec::new();

        if task.status != TaskStatus::Completed
            && detect_loop(&task.history, self.detector.window()) == TaskHealth::Looping
        {
            warn!(task_id, window = self.detector.window(), "Task is looping, blocking it");
            task = self
                .store
                .update_task(
                    task_id,
                    Box::new(|t: &mut Task| {
                        t.status = TaskStatus::Blocked;
                        t.assignee = None;
                        t.notes
                            .push("blocked: repeated the same action and outcome".to_string());
                        Ok(())
                    }),
                )
                .await?;
            signals.push(Signal::Looping {
                task_id: task.task_id.clone(),
            });
        }

        if let Some(usage) = usage.filter(|u| !u.is_empty()) {
            let events = self.breaker.record_spend(
                &mut workflow.budget,
                &usage.tier,
                usage.input_tokens,
                usage.output_tokens,
            );
            workflow.touch();
            workflow = self.store.put_workflow(workflow).await?;
            signals.extend(events.into_iter().map(Signal::from));
        }

        if workflow.budget.is_suspended() {
            signals.push(Signal::Suspended {
                workflow_id: workflow_id.to_string(),
            });
            self.log_signals(workflow_id, &signals).await;
            return Ok(ProgressOutcome {
                next_task: None,
                signals,
            });
        }

        let tasks = self.workflow_tasks(workflow_id).await?;
        if let Some(phase) = PhaseGate::new(&mut workflow).evaluate(&tasks) {
            workflow = self.store.put_workflow(workflow).await?;
            signals.push(Signal::PhaseAwaitingApproval { phase });
        }

        let next_task = schedulable_phase(&workflow)
            .and_then(|phase| next_actionable(&tasks, phase))
            .cloned();

        // Other workers that went quiet
        signals.extend(
            self.stale_signals(workflow_id, &tasks, Utc::now())
                .into_iter()
                .filter(|s| !matches!(s, Signal::Stale { task_id: id, .. } if id == task_id)),
        );

        self.log_signals(workflow_id, &signals).await;
        Ok(ProgressOutcome { next_task, signals })
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Peek at the next ready task without claiming it.
    ///
    /// `Err(BudgetSuspended)` while the breaker is tripped, so "nothing to do"
    /// and "not allowed to do anything" stay distinguishable.
    pub async fn next_actionable(&self, workflow_id: &str) -> Result<Option<Task>> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        self.peek_next(&workflow).await
    }

    async fn peek_next(&self, workflow: &Workflow) -> Result<Option<Task>> {
        if !workflow.is_active() {
            return Ok(None);
        }
        if workflow.budget.is_suspended() {
            return Err(PhasegateError::BudgetSuspended(workflow.workflow_id.clone()));
        }
        let Some(phase) = schedulable_phase(workflow) else {
            return Ok(None);
        };
        let tasks = self.workflow_tasks(&workflow.workflow_id).await?;
        Ok(next_actionable(&tasks, phase).cloned())
    }

    /// Pick the next ready task and mark it dispatched to `agent_id`
    pub async fn claim_next(&self, workflow_id: &str, agent_id: &str) -> Result<Option<Task>> {
        let _guard = self.lock_workflow(workflow_id).await?;
        let workflow = self.store.get_workflow(workflow_id).await?;

        let Some(task) = self.peek_next(&workflow).await? else {
            return Ok(None);
        };
        let task = self.assign(&task.task_id, agent_id).await?;
        info!(workflow_id, task_id = %task.task_id, agent_id, "Task claimed");
        Ok(Some(task))
    }

    /// Start a specific task, bypassing the scheduler's choice but not its rules
    pub async fn start_task(&self, workflow_id: &str, task_id: &str, agent_id: &str) -> Result<Task> {
        let _guard = self.lock_workflow(workflow_id).await?;
        let workflow = self.store.get_workflow(workflow_id).await?;
        ensure_active(&workflow)?;
        if workflow.budget.is_suspended() {
            return Err(PhasegateError::BudgetSuspended(workflow_id.to_string()));
        }

        let task = self.member_task(&workflow, task_id).await?;
        ensure_not_frozen(&workflow, &task)?;
        if schedulable_phase(&workflow) != Some(task.phase.as_str()) {
            return Err(PhasegateError::InvalidTransition(format!(
                "task {} is in phase {}, which is not open for dispatch",
                task_id, task.phase
            )));
        }
        if !task.status.is_schedulable() {
            return Err(PhasegateError::InvalidTransition(format!(
                "task {} is {} and cannot be started",
                task_id, task.status
            )));
        }
        if let Some(current) = &task.assignee {
            return Err(PhasegateError::InvalidTransition(format!(
                "task {} is already dispatched to {}",
                task_id, current
            )));
        }

        let tasks = self.workflow_tasks(workflow_id).await?;
        let pending = pending_dependencies(&task, &tasks);
        if !pending.is_empty() {
            return Err(PhasegateError::DependencyUnsatisfied {
                task_id: task_id.to_string(),
                pending,
            });
        }

        let task = self.assign(task_id, agent_id).await?;
        info!(workflow_id, task_id, agent_id, "Task started");
        Ok(task)
    }

    async fn assign(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let agent = agent_id.to_string();
        self.store
            .update_task(
                task_id,
                Box::new(move |t: &mut Task| {
                    t.status = TaskStatus::InProgress;
                    t.assignee = Some(agent);
                    Ok(())
                }),
            )
            .await
    }

    /// Report IN_PROGRESS tasks that have gone quiet. Flags only; nothing changes.
    pub async fn sweep_stale(&self, workflow_id: &str, now: DateTime<Utc>) -> Result<Vec<Signal>> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        if !workflow.is_active() {
            return Ok(Vec::new());
        }
        let tasks = self.workflow_tasks(workflow_id).await?;

        let signals = self.stale_signals(workflow_id, &tasks, now);
        self.log_signals(workflow_id, &signals).await;
        Ok(signals)
    }

    fn stale_signals(&self, workflow_id: &str, tasks: &[Task], now: DateTime<Utc>) -> Vec<Signal> {
        tasks
            .iter()
            .filter(|t| self.detector.classify(t, now) == TaskHealth::Stale)
            .map(|t| {
                let idle_secs = self.detector.idle_for(t, now).as_secs();
                warn!(workflow_id, task_id = %t.task_id, idle_secs, "Task is stale");
                Signal::Stale {
                    task_id: t.task_id.clone(),
                    idle_secs,
                }
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Phase gate
    // ------------------------------------------------------------------

    /// Approve the current phase; returns the signals of what follows
    pub async fn approve_phase(&self, workflow_id: &str, phase: &str) -> Result<Vec<Signal>> {
        let _guard = self.lock_workflow(workflow_id).await?;
        let mut workflow = self.store.get_workflow(workflow_id).await?;
        let tasks = self.workflow_tasks(workflow_id).await?;

        let approval = PhaseGate::new(&mut workflow).approve(phase, &tasks, Utc::now())?;
        let mut signals = Vec::new();
        if approval.workflow_complete() {
            signals.push(Signal::WorkflowComplete {
                workflow_id: workflow_id.to_string(),
            });
        } else if let Some(next) = PhaseGate::new(&mut workflow).evaluate(&tasks) {
            signals.push(Signal::PhaseAwaitingApproval { phase: next });
        }
        self.store.put_workflow(workflow).await?;

        self.log_transition(workflow_id, &format!("phase {} approved", phase))
            .await;
        self.log_signals(workflow_id, &signals).await;
        Ok(signals)
    }

    /// Send the current phase back for rework
    pub async fn reject_phase(&self, workflow_id: &str, phase: &str, reason: &str) -> Result<()> {
        let _guard = self.lock_workflow(workflow_id).await?;
        let mut workflow = self.store.get_workflow(workflow_id).await?;

        PhaseGate::new(&mut workflow).reject(phase, reason, Utc::now())?;
        self.store.put_workflow(workflow).await?;

        self.log_transition(workflow_id, &format!("phase {} rejected: {}", phase, reason))
            .await;
        Ok(())
    }

    /// Recompute the fingerprints of locked immutable phases against the ledger
    pub async fn verify_integrity(&self, workflow_id: &str) -> Result<()> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        let tasks = self.workflow_tasks(workflow_id).await?;

        for task in &tasks {
            task.check_invariants()
                .map_err(PhasegateError::InvalidWorkflow)?;
        }
        for task_id in &workflow.task_ids {
            if !tasks.iter().any(|t| &t.task_id == task_id) {
                return Err(PhasegateError::InvalidWorkflow(format!(
                    "workflow {} lists missing task {}",
                    workflow_id, task_id
                )));
            }
        }
        verify_locks(&workflow, &tasks)?;

        debug!(workflow_id, tasks = tasks.len(), "Integrity verified");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Budget
    // ------------------------------------------------------------------

    /// Close a tripped breaker. Spend is kept, so spending while still over
    /// budget trips it again.
    pub async fn reset_breaker(&self, workflow_id: &str) -> Result<Vec<Signal>> {
        let _guard = self.lock_workflow(workflow_id).await?;
        let mut workflow = self.store.get_workflow(workflow_id).await?;
        ensure_active(&workflow)?;

        self.breaker.reset(&mut workflow.budget);
        workflow.touch();

        // A phase may have settled while dispatch was suspended
        let tasks = self.workflow_tasks(workflow_id).await?;
        let mut signals = Vec::new();
        if let Some(phase) = PhaseGate::new(&mut workflow).evaluate(&tasks) {
            signals.push(Signal::PhaseAwaitingApproval { phase });
        }
        self.store.put_workflow(workflow).await?;

        self.log_transition(workflow_id, "breaker reset").await;
        self.log_signals(workflow_id, &signals).await;
        Ok(signals)
    }

    /// Change the budget cap and re-check it against what is already spent.
    ///
    /// Lowering the cap below the spend trips the breaker at once. Raising it
    /// never closes a tripped breaker; reset it to resume.
    pub async fn adjust_budget(&self, workflow_id: &str, budget_usd: f64) -> Result<Vec<Signal>> {
        if !budget_usd.is_finite() {
            return Err(PhasegateError::InvalidWorkflow(
                "budget must be a finite number".to_string(),
            ));
        }
        let _guard = self.lock_workflow(workflow_id).await?;
        let mut workflow = self.store.get_workflow(workflow_id).await?;
        ensure_active(&workflow)?;

        let previous = workflow.budget.budget_usd;
        workflow.budget.budget_usd = budget_usd;
        let mut signals: Vec<Signal> = record_cost(&mut workflow.budget, 0.0)
            .into_iter()
            .map(Signal::from)
            .collect();
        if workflow.budget.is_suspended() {
            signals.push(Signal::Suspended {
                workflow_id: workflow_id.to_string(),
            });
        }
        workflow.touch();
        self.store.put_workflow(workflow).await?;

        info!(workflow_id, previous, budget_usd, "Budget adjusted");
        self.log_transition(
            workflow_id,
            &format!("budget changed from ${:.2} to ${:.2}", previous, budget_usd),
        )
        .await;
        self.log_signals(workflow_id, &signals).await;
        Ok(signals)
    }

    // ------------------------------------------------------------------
    // Task management
    // ------------------------------------------------------------------

    /// Add a task to an open phase of an active workflow
    pub async fn add_task(&self, workflow_id: &str, mut task: Task) -> Result<Task> {
        let _guard = self.lock_workflow(workflow_id).await?;
        let mut workflow = self.store.get_workflow(workflow_id).await?;
        ensure_active(&workflow)?;

        let phase = workflow.phase(&task.phase).ok_or_else(|| {
            PhasegateError::InvalidWorkflow(format!(
                "task {} names unknown phase {}",
                task.task_id, task.phase
            ))
        })?;
        if phase.is_frozen() {
            return Err(PhasegateError::ImmutableArtifact(format!(
                "phase {} is locked; no tasks can be added",
                phase.name
            )));
        }
        if phase.lock != PhaseLockState::Open {
            return Err(PhasegateError::InvalidTransition(format!(
                "phase {} is {}; reject it before adding work",
                phase.name, phase.lock
            )));
        }

        task.workflow_id = workflow_id.to_string();
        let mut tasks = self.workflow_tasks(workflow_id).await?;
        tasks.push(task.clone());
        validate_dependencies(&tasks)?;

        let _creation = self.creation.lock().await;
        let task = self.store.create_task(task).await?;
        workflow.task_ids.push(task.task_id.clone());
        workflow.touch();
        self.store.put_workflow(workflow).await?;

        info!(workflow_id, task_id = %task.task_id, phase = %task.phase, "Task added");
        Ok(task)
    }

    /// Edit task content; refused once the task's phase is frozen
    pub async fn edit_task(&self, workflow_id: &str, task_id: &str, edit: TaskEdit) -> Result<Task> {
        let _guard = self.lock_workflow(workflow_id).await?;
        let workflow = self.store.get_workflow(workflow_id).await?;
        ensure_active(&workflow)?;
        let task = self.member_task(&workflow, task_id).await?;
        ensure_not_frozen(&workflow, &task)?;

        if edit.is_empty() {
            return Ok(task);
        }
        if let Some(deps) = &edit.dependencies {
            let mut tasks = self.workflow_tasks(workflow_id).await?;
            if let Some(slot) = tasks.iter_mut().find(|t| t.task_id == task_id) {
                slot.dependencies = deps.clone();
            }
            validate_dependencies(&tasks)?;

            // Work already under way keeps every dependency COMPLETED
            if task.status == TaskStatus::InProgress || task.assignee.is_some() {
                let mut edited = task.clone();
                edited.dependencies = deps.clone();
                let pending = pending_dependencies(&edited, &tasks);
                if !pending.is_empty() {
                    return Err(PhasegateError::DependencyUnsatisfied {
                        task_id: task_id.to_string(),
                        pending,
                    });
                }
            }
        }

        let task = self
            .store
            .update_task(
                task_id,
                Box::new(move |t: &mut Task| {
                    edit.apply(t);
                    Ok(())
                }),
            )
            .await?;
        debug!(workflow_id, task_id, "Task edited");
        Ok(task)
    }

    /// Human status override (defer, review, block, reset to not started).
    ///
    /// COMPLETED needs a successful report and IN_PROGRESS needs a start, so
    /// neither can be set here.
    pub async fn override_status(
        &self,
        workflow_id: &str,
        task_id: &str,
        status: TaskStatus,
        note: &str,
    ) -> Result<Vec<Signal>> {
        if !OVERRIDABLE.contains(&status) {
            return Err(PhasegateError::InvalidTransition(format!(
                "status {} cannot be set by override",
                status
            )));
        }

        let _guard = self.lock_workflow(workflow_id).await?;
        let mut workflow = self.store.get_workflow(workflow_id).await?;
        ensure_active(&workflow)?;
        let task = self.member_task(&workflow, task_id).await?;
        ensure_phase_open(&workflow, &task)?;
        if task.status == TaskStatus::Completed {
            return Err(PhasegateError::InvalidTransition(format!(
                "task {} is completed; reopen it instead",
                task_id
            )));
        }

        let note = format!("status set to {}: {}", status, note);
        let from = task.status;
        self.store
            .update_task(
                task_id,
                Box::new(move |t: &mut Task| {
                    t.status = status;
                    t.assignee = None;
                    t.notes.push(note);
                    Ok(())
                }),
            )
            .await?;
        info!(workflow_id, task_id, from = %from, to = %status, "Status overridden");

        let tasks = self.workflow_tasks(workflow_id).await?;
        let mut signals = Vec::new();
        if let Some(phase) = PhaseGate::new(&mut workflow).evaluate(&tasks) {
            self.store.put_workflow(workflow).await?;
            signals.push(Signal::PhaseAwaitingApproval { phase });
        }

        self.log_transition(workflow_id, &format!("task {} set {} -> {}", task_id, from, status))
            .await;
        self.log_signals(workflow_id, &signals).await;
        Ok(signals)
    }

    /// Send a finished, deferred or blocked task back to NOT_STARTED; history is kept
    pub async fn reopen_task(&self, workflow_id: &str, task_id: &str, reason: &str) -> Result<Task> {
        let _guard = self.lock_workflow(workflow_id).await?;
        let workflow = self.store.get_workflow(workflow_id).await?;
        ensure_active(&workflow)?;
        let task = self.member_task(&workflow, task_id).await?;
        ensure_phase_open(&workflow, &task)?;

        if !matches!(
            task.status,
            TaskStatus::Completed | TaskStatus::Deferred | TaskStatus::Blocked
        ) {
            return Err(PhasegateError::InvalidTransition(format!(
                "task {} is {} and cannot be reopened",
                task_id, task.status
            )));
        }

        let tasks = self.workflow_tasks(workflow_id).await?;
        let started: Vec<&str> = tasks
            .iter()
            .filter(|t| t.dependencies.contains(task_id))
            .filter(|t| {
                matches!(t.status, TaskStatus::InProgress | TaskStatus::Completed)
                    || t.assignee.is_some()
            })
            .map(|t| t.task_id.as_str())
            .collect();
        if !started.is_empty() {
            return Err(PhasegateError::InvalidTransition(format!(
                "task {} has dependents already under way: {}",
                task_id,
                started.join(", ")
            )));
        }

        let note = format!("reopened: {}", reason);
        let task = self
            .store
            .update_task(
                task_id,
                Box::new(move |t: &mut Task| {
                    t.status = TaskStatus::NotStarted;
                    t.assignee = None;
                    t.notes.push(note);
                    Ok(())
                }),
            )
            .await?;

        info!(workflow_id, task_id, reason, "Task reopened");
        self.log_transition(workflow_id, &format!("task {} reopened: {}", task_id, reason))
            .await;
        Ok(task)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        self.store.get_workflow(workflow_id).await
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        self.store.list_workflows().await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.store.get_task(task_id).await
    }

    /// Every task of the workflow in scheduling order
    pub async fn list_tasks(&self, workflow_id: &str) -> Result<Vec<Task>> {
        self.store.get_workflow(workflow_id).await?;
        self.workflow_tasks(workflow_id).await
    }

    pub async fn get_workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatusView> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        let tasks = self.workflow_tasks(workflow_id).await?;

        let mut task_counts = BTreeMap::new();
        for task in &tasks {
            *task_counts.entry(task.status).or_insert(0) += 1;
        }

        let current = workflow.current_phase();
        Ok(WorkflowStatusView {
            workflow_id: workflow.workflow_id.clone(),
            status: workflow.status,
            phase: current.map(|p| p.name.clone()),
            phase_lock_state: current.map(|p| p.lock),
            breaker_state: workflow.budget.breaker_state,
            spent_usd: workflow.budget.spent_usd,
            budget_usd: workflow.budget.budget_usd,
            task_counts,
            total_tasks: tasks.len(),
        })
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn workflow_tasks(&self, workflow_id: &str) -> Result<Vec<Task>> {
        self.store.list_tasks(&TaskFilter::workflow(workflow_id)).await
    }

    async fn member_task(&self, workflow: &Workflow, task_id: &str) -> Result<Task> {
        let task = self.store.get_task(task_id).await?;
        if task.workflow_id != workflow.workflow_id {
            return Err(PhasegateError::NotFound(format!(
                "task {} in workflow {}",
                task_id, workflow.workflow_id
            )));
        }
        Ok(task)
    }

    async fn log_signals(&self, workflow_id: &str, signals: &[Signal]) {
        if let Some(activity) = &self.activity {
            activity.log_signals(workflow_id, signals).await;
        }
    }

    async fn log_transition(&self, workflow_id: &str, message: &str) {
        if let Some(activity) = &self.activity {
            activity.log_transition(workflow_id, message).await;
        }
    }
}

/// Current phase name if it is open for dispatch
fn schedulable_phase(workflow: &Workflow) -> Option<&str> {
    if !workflow.is_active() {
        return None;
    }
    workflow
        .current_phase()
        .filter(|p| p.lock == PhaseLockState::Open)
        .map(|p| p.name.as_str())
}

fn ensure_active(workflow: &Workflow) -> Result<()> {
    if workflow.is_active() {
        Ok(())
    } else {
        Err(PhasegateError::InvalidTransition(format!(
            "workflow {} is {}",
            workflow.workflow_id, workflow.status
        )))
    }
}

fn ensure_not_frozen(workflow: &Workflow, task: &Task) -> Result<()> {
    match workflow.phase(&task.phase) {
        Some(phase) if phase.is_frozen() => Err(PhasegateError::ImmutableArtifact(format!(
            "task {} belongs to locked phase {}",
            task.task_id, phase.name
        ))),
        _ => Ok(()),
    }
}

/// Reports are only taken for phases the gate has reached
fn ensure_phase_reached(workflow: &Workflow, task: &Task) -> Result<()> {
    match workflow.phase_index(&task.phase) {
        Some(index) if index > workflow.current_phase_index => {
            Err(PhasegateError::InvalidTransition(format!(
                "task {} is in phase {}, which has not been unlocked",
                task.task_id, task.phase
            )))
        }
        _ => Ok(()),
    }
}

/// Status changes that could unsettle a phase need it OPEN
fn ensure_phase_open(workflow: &Workflow, task: &Task) -> Result<()> {
    ensure_not_frozen(workflow, task)?;
    match workflow.phase(&task.phase) {
        Some(phase) if phase.lock != PhaseLockState::Open => {
            Err(PhasegateError::InvalidTransition(format!(
                "phase {} of task {} is {}",
                phase.name, task.task_id, phase.lock
            )))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phasegate_core::{BreakerState, Priority, TokenUsage};
    use phasegate_store::MemoryStore;

    fn engine() -> Engine<MemoryStore> {
        Engine::new(Arc::new(MemoryStore::new()), PhasegateConfig::default())
    }

    fn two_phase_spec() -> WorkflowSpec {
        WorkflowSpec::new("wf", vec!["SPEC".into(), "IMPLEMENT".into()], 10.0).with_tasks(vec![
            Task::new("spec", "SPEC", "Write spec"),
            Task::new("impl", "IMPLEMENT", "Build it").with_dependencies(["spec"]),
        ])
    }

    /// One phase, `b` waits on `a`
    fn chain_spec() -> WorkflowSpec {
        WorkflowSpec::new("wf", vec!["SPEC".into()], 10.0).with_tasks(vec![
            Task::new("a", "SPEC", "a"),
            Task::new("b", "SPEC", "b").with_dependencies(["a"]),
        ])
    }

    fn report(outcome: &str) -> ProgressEntry {
        ProgressEntry::new("agent-1", "work", outcome)
    }

    #[tokio::test]
    async fn test_create_rejects_cycle() {
        let spec = WorkflowSpec::new("wf", vec!["SPEC".into()], 1.0).with_tasks(vec![
            Task::new("a", "SPEC", "a").with_dependencies(["b"]),
            Task::new("b", "SPEC", "b").with_dependencies(["a"]),
        ]);
        assert!(matches!(
            engine().create_workflow(spec).await,
            Err(PhasegateError::CyclicDependency(_))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_phase() {
        let spec = WorkflowSpec::new("wf", vec!["SPEC".into()], 1.0)
            .with_tasks(vec![Task::new("a", "DEPLOY", "a")]);
        assert!(matches!(
            engine().create_workflow(spec).await,
            Err(PhasegateError::InvalidWorkflow(_))
        ));
    }

    #[tokio::test]
    async fn test_create_applies_default_immutable_phases() {
        let spec = WorkflowSpec::new(
            "wf",
            vec!["SPEC".into(), "TEST_IMPL".into(), "IMPLEMENT".into()],
            1.0,
        );
        let wf = engine().create_workflow(spec).await.unwrap();
        assert!(!wf.phases[0].immutable);
        assert!(wf.phases[1].immutable);
        // Empty first phase settles right away
        assert_eq!(wf.phases[0].lock, PhaseLockState::AwaitingApproval);
    }

    #[tokio::test]
    async fn test_duplicate_workflow() {
        let engine = engine();
        engine.create_workflow(two_phase_spec()).await.unwrap();
        assert!(matches!(
            engine.create_workflow(two_phase_spec()).await,
            Err(PhasegateError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_dependency_unsatisfied() {
        let engine = engine();
        engine.create_workflow(chain_spec()).await.unwrap();

        let err = engine
            .submit_progress("wf", "b", report("success"))
            .await
            .unwrap_err();
        match err {
            PhasegateError::DependencyUnsatisfied { task_id, pending } => {
                assert_eq!(task_id, "b");
                assert_eq!(pending, vec!["a".to_string()]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(engine.get_task("b").await.unwrap().history.is_empty());
    }

    #[tokio::test]
    async fn test_report_for_locked_out_phase() {
        let engine = engine();
        let spec = WorkflowSpec::new("wf", vec!["SPEC".into(), "IMPLEMENT".into()], 10.0)
            .with_tasks(vec![
                Task::new("s", "SPEC", "s"),
                Task::new("i", "IMPLEMENT", "i"),
            ]);
        engine.create_workflow(spec).await.unwrap();

        assert!(matches!(
            engine.submit_progress("wf", "i", report("success")).await,
            Err(PhasegateError::InvalidTransition(_))
        ));
        let task = engine.get_task("i").await.unwrap();
        assert_eq!(task.status, TaskStatus::NotStarted);
        assert!(task.history.is_empty());

        // Accepted once the gate opens the phase
        engine.submit_progress("wf", "s", report("success")).await.unwrap();
        engine.approve_phase("wf", "SPEC").await.unwrap();
        engine.submit_progress("wf", "i", report("success")).await.unwrap();
        assert_eq!(
            engine.get_task("i").await.unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_reopen_refused_while_dependents_run() {
        let engine = engine();
        engine.create_workflow(chain_spec()).await.unwrap();

        // Nothing depends on a yet: reopening is fine
        engine.submit_progress("wf", "a", report("success")).await.unwrap();
        let a = engine.reopen_task("wf", "a", "redo").await.unwrap();
        assert_eq!(a.status, TaskStatus::NotStarted);

        engine.submit_progress("wf", "a", report("success")).await.unwrap();
        let b = engine.claim_next("wf", "w2").await.unwrap().unwrap();
        assert_eq!(b.task_id, "b");

        let err = engine.reopen_task("wf", "a", "redo again").await.unwrap_err();
        assert!(matches!(&err, PhasegateError::InvalidTransition(msg) if msg.contains("b")));
        assert_eq!(
            engine.get_task("a").await.unwrap().status,
            TaskStatus::Completed
        );

        // The in-flight worker can still finish
        let b = engine.get_task("b").await.unwrap();
        assert_eq!(b.assignee.as_deref(), Some("w2"));
        engine.submit_progress("wf", "b", report("success")).await.unwrap();
    }

    #[tokio::test]
    async fn test_dependency_edit_on_running_task() {
        let engine = engine();
        let spec = WorkflowSpec::new("wf", vec!["SPEC".into()], 10.0).with_tasks(vec![
            Task::new("a", "SPEC", "a"),
            Task::new("b", "SPEC", "b"),
        ]);
        engine.create_workflow(spec).await.unwrap();
        engine.start_task("wf", "b", "w1").await.unwrap();

        let edit = TaskEdit {
            dependencies: Some(["a".to_string()].into_iter().collect()),
            ..Default::default()
        };
        match engine.edit_task("wf", "b", edit.clone()).await {
            Err(PhasegateError::DependencyUnsatisfied { task_id, pending }) => {
                assert_eq!(task_id, "b");
                assert_eq!(pending, vec!["a".to_string()]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(engine.get_task("b").await.unwrap().dependencies.is_empty());

        // A completed dependency is fine
        engine.submit_progress("wf", "a", report("success")).await.unwrap();
        let b = engine.edit_task("wf", "b", edit).await.unwrap();
        assert!(b.dependencies.contains("a"));
    }

    #[tokio::test]
    async fn test_lowering_budget_below_spend_trips_breaker() {
        let engine = engine();
        let spec = WorkflowSpec::new("wf", vec!["SPEC".into()], 10.0).with_tasks(vec![
            Task::new("a", "SPEC", "a"),
            Task::new("b", "SPEC", "b"),
        ]);
        engine.create_workflow(spec).await.unwrap();

        // 40k opus output tokens = $3.00
        let outcome = engine
            .submit_progress(
                "wf",
                "a",
                report("failed: x").with_tokens(TokenUsage::new("opus", 0, 40_000)),
            )
            .await
            .unwrap();
        assert!(outcome.signals.is_empty());

        let signals = engine.adjust_budget("wf", 1.0).await.unwrap();
        assert!(signals.iter().any(|s| matches!(s, Signal::Break { .. })));
        assert!(matches!(signals.last(), Some(Signal::Suspended { .. })));
        assert_eq!(
            engine.get_workflow("wf").await.unwrap().budget.breaker_state,
            BreakerState::Suspended
        );
        assert!(matches!(
            engine.next_actionable("wf").await,
            Err(PhasegateError::BudgetSuspended(_))
        ));

        // Raising it again does not resume dispatch on its own
        let signals = engine.adjust_budget("wf", 20.0).await.unwrap();
        assert_eq!(
            signals,
            vec![Signal::Suspended {
                workflow_id: "wf".into()
            }]
        );
        engine.reset_breaker("wf").await.unwrap();
        assert!(engine.next_actionable("wf").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_progress_reports_other_stale_tasks() {
        let engine = engine();
        let two_hours_ago = Utc::now() - chrono::Duration::hours(2);
        let mut stuck = Task::new("stuck", "SPEC", "stuck").created(two_hours_ago);
        stuck.status = TaskStatus::InProgress;
        let spec = WorkflowSpec::new("wf", vec!["SPEC".into()], 10.0)
            .with_tasks(vec![stuck, Task::new("fresh", "SPEC", "fresh")]);
        engine.create_workflow(spec).await.unwrap();

        let outcome = engine
            .submit_progress("wf", "fresh", report("failed: flaky"))
            .await
            .unwrap();
        assert_eq!(outcome.signals.len(), 1);
        match &outcome.signals[0] {
            Signal::Stale { task_id, idle_secs } => {
                assert_eq!(task_id, "stuck");
                assert!(*idle_secs >= 7200);
            }
            other => panic!("expected a stale signal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_leaves_nothing_behind_on_conflict() {
        let engine = engine();
        engine.create_workflow(chain_spec()).await.unwrap();

        let spec = WorkflowSpec::new("other", vec!["SPEC".into()], 1.0).with_tasks(vec![
            Task::new("y", "SPEC", "y"),
            Task::new("a", "SPEC", "clashes with wf"),
        ]);
        assert!(matches!(
            engine.create_workflow(spec).await,
            Err(PhasegateError::AlreadyExists(_))
        ));
        assert!(matches!(
            engine.get_workflow("other").await,
            Err(PhasegateError::NotFound(_))
        ));
        assert!(matches!(
            engine.get_task("y").await,
            Err(PhasegateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_adopts_tasks_from_interrupted_create() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(Arc::clone(&store), PhasegateConfig::default());

        // Task written, workflow record never reached
        let mut leftover = Task::new("y", "SPEC", "old title");
        leftover.workflow_id = "retry".to_string();
        store.create_task(leftover).await.unwrap();

        let spec = WorkflowSpec::new("retry", vec!["SPEC".into()], 1.0)
            .with_tasks(vec![Task::new("y", "SPEC", "new title")]);
        let wf = engine.create_workflow(spec).await.unwrap();
        assert!(wf.contains_task("y"));
        assert_eq!(engine.get_task("y").await.unwrap().title, "new title");
    }

    #[tokio::test]
    async fn test_create_from_config_defaults() {
        let engine = engine();
        let spec: WorkflowSpec = serde_json::from_str(r#"{"workflow_id": "wf"}"#).unwrap();
        assert!(spec.phase_sequence.is_empty());
        assert!(spec.budget_usd.is_none());

        let wf = engine.create_workflow(spec).await.unwrap();
        let config = PhasegateConfig::default();
        let names: Vec<&str> = wf.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, config.phases.sequence.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(wf.budget.budget_usd, config.budget.default_budget_usd);
        assert!(wf.phase("TEST_IMPL").unwrap().immutable);

        let wf = engine
            .create_workflow(WorkflowSpec::with_defaults("wf-2"))
            .await
            .unwrap();
        assert_eq!(wf.phases.len(), config.phases.sequence.len());
    }

    #[tokio::test]
    async fn test_lock_map_tracks_live_workflows_only() {
        let engine = engine();
        assert!(matches!(
            engine.submit_progress("ghost", "t", report("success")).await,
            Err(PhasegateError::NotFound(_))
        ));
        assert!(engine.locks.lock().await.is_empty());

        engine.create_workflow(two_phase_spec()).await.unwrap();
        engine.abort_workflow("wf", "done with it").await.unwrap();
        assert!(engine.locks.lock().await.contains_key("wf"));

        engine.archive_workflow("wf").await.unwrap();
        assert!(!engine.locks.lock().await.contains_key("wf"));
    }

    #[tokio::test]
    async fn test_success_settles_phase() {
        let engine = engine();
        engine.create_workflow(two_phase_spec()).await.unwrap();

        let outcome = engine
            .submit_progress("wf", "spec", report("success"))
            .await
            .unwrap();
        assert_eq!(
            outcome.signals,
            vec![Signal::PhaseAwaitingApproval {
                phase: "SPEC".into()
            }]
        );
        assert!(outcome.next_task.is_none());
        assert_eq!(
            engine.get_task("spec").await.unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_looping_blocks_task() {
        let engine = engine();
        engine.create_workflow(two_phase_spec()).await.unwrap();

        for _ in 0..3 {
            let outcome = engine
                .submit_progress("wf", "spec", report("failed: same error"))
                .await
                .unwrap();
            assert!(outcome.signals.is_empty());
        }
        let outcome = engine
            .submit_progress("wf", "spec", report("failed: same error"))
            .await
            .unwrap();
        assert_eq!(
            outcome.signals,
            vec![Signal::Looping {
                task_id: "spec".into()
            }]
        );

        let task = engine.get_task("spec").await.unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.history.len(), 4);
        assert!(outcome.next_task.is_none());
    }

    #[tokio::test]
    async fn test_claim_never_returns_same_task_twice() {
        let engine = engine();
        let spec = WorkflowSpec::new("wf", vec!["SPEC".into()], 10.0).with_tasks(vec![
            Task::new("a", "SPEC", "a").with_priority(Priority::High),
            Task::new("b", "SPEC", "b"),
        ]);
        engine.create_workflow(spec).await.unwrap();

        let first = engine.claim_next("wf", "w1").await.unwrap().unwrap();
        let second = engine.claim_next("wf", "w2").await.unwrap().unwrap();
        assert_eq!(first.task_id, "a");
        assert_eq!(second.task_id, "b");
        assert!(engine.claim_next("wf", "w3").await.unwrap().is_none());

        // A failed report frees the task for another attempt
        engine
            .submit_progress("wf", "a", report("failed: flaky"))
            .await
            .unwrap();
        let retry = engine.claim_next("wf", "w3").await.unwrap().unwrap();
        assert_eq!(retry.task_id, "a");
        assert_eq!(retry.assignee.as_deref(), Some("w3"));
    }

    #[tokio::test]
    async fn test_budget_suspension_blocks_dispatch() {
        let engine = engine();
        let spec = WorkflowSpec::new("wf", vec!["SPEC".into()], 1.0).with_tasks(vec![
            Task::new("a", "SPEC", "a"),
            Task::new("b", "SPEC", "b"),
        ]);
        engine.create_workflow(spec).await.unwrap();

        // 100k opus output tokens = $7.50
        let outcome = engine
            .submit_progress(
                "wf",
                "a",
                report("failed: x").with_tokens(TokenUsage::new("opus", 0, 100_000)),
            )
            .await
            .unwrap();
        assert!(outcome.has_signal(|s| matches!(s, Signal::Break { .. })));
        assert!(outcome.has_signal(|s| matches!(s, Signal::Suspended { .. })));
        assert!(outcome.next_task.is_none());

        assert!(matches!(
            engine.next_actionable("wf").await,
            Err(PhasegateError::BudgetSuspended(_))
        ));
        assert!(matches!(
            engine.start_task("wf", "b", "w").await,
            Err(PhasegateError::BudgetSuspended(_))
        ));

        // In-flight workers may still report
        engine
            .submit_progress("wf", "b", report("failed: y"))
            .await
            .unwrap();

        engine.reset_breaker("wf").await.unwrap();
        assert!(engine.next_actionable("wf").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_override_and_reopen() {
        let engine = engine();
        engine.create_workflow(two_phase_spec()).await.unwrap();

        assert!(matches!(
            engine
                .override_status("wf", "spec", TaskStatus::Completed, "done")
                .await,
            Err(PhasegateError::InvalidTransition(_))
        ));

        let signals = engine
            .override_status("wf", "spec", TaskStatus::Deferred, "not needed")
            .await
            .unwrap();
        assert_eq!(
            signals,
            vec![Signal::PhaseAwaitingApproval {
                phase: "SPEC".into()
            }]
        );

        // Phase is awaiting approval: rework requires a rejection first
        assert!(matches!(
            engine.reopen_task("wf", "spec", "needed after all").await,
            Err(PhasegateError::InvalidTransition(_))
        ));
        engine.reject_phase("wf", "SPEC", "needed after all").await.unwrap();

        let task = engine
            .reopen_task("wf", "spec", "needed after all")
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::NotStarted);
        assert!(task.notes.iter().any(|n| n.contains("needed after all")));
    }

    #[tokio::test]
    async fn test_add_task_rules() {
        let engine = engine();
        engine.create_workflow(two_phase_spec()).await.unwrap();

        engine
            .add_task("wf", Task::new("impl-2", "IMPLEMENT", "More").with_dependencies(["impl"]))
            .await
            .unwrap();
        assert!(engine.get_workflow("wf").await.unwrap().contains_task("impl-2"));

        assert!(matches!(
            engine
                .add_task("wf", Task::new("x", "SPEC", "x").with_dependencies(["ghost"]))
                .await,
            Err(PhasegateError::InvalidWorkflow(_))
        ));

        engine
            .submit_progress("wf", "spec", report("success"))
            .await
            .unwrap();
        assert!(matches!(
            engine.add_task("wf", Task::new("late", "SPEC", "late")).await,
            Err(PhasegateError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_edit_rejects_cycle() {
        let engine = engine();
        engine.create_workflow(two_phase_spec()).await.unwrap();

        let edit = TaskEdit {
            dependencies: Some(["impl".to_string()].into_iter().collect()),
            ..Default::default()
        };
        assert!(matches!(
            engine.edit_task("wf", "spec", edit).await,
            Err(PhasegateError::CyclicDependency(_))
        ));

        let edit = TaskEdit {
            title: Some("Write the spec".into()),
            add_note: Some("clarified scope".into()),
            ..Default::default()
        };
        let task = engine.edit_task("wf", "spec", edit).await.unwrap();
        assert_eq!(task.title, "Write the spec");
        assert_eq!(task.notes, vec!["clarified scope".to_string()]);
    }

    #[tokio::test]
    async fn test_abort_and_archive() {
        let engine = engine();
        engine.create_workflow(two_phase_spec()).await.unwrap();

        assert!(engine.archive_workflow("wf").await.is_err());
        let wf = engine.abort_workflow("wf", "requirements changed").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Aborted);

        assert!(matches!(
            engine.submit_progress("wf", "spec", report("success")).await,
            Err(PhasegateError::InvalidTransition(_))
        ));
        assert!(engine.next_actionable("wf").await.unwrap().is_none());

        let wf = engine.archive_workflow("wf").await.unwrap();
        assert!(wf.archived_at.is_some());
    }

    #[tokio::test]
    async fn test_sweep_ignores_inactive_workflows() {
        let engine = engine();
        engine.create_workflow(two_phase_spec()).await.unwrap();
        engine.start_task("wf", "spec", "w1").await.unwrap();
        engine.abort_workflow("wf", "cancelled").await.unwrap();

        let later = Utc::now() + chrono::Duration::hours(1);
        assert!(engine.sweep_stale("wf", later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_stale() {
        let engine = engine();
        engine.create_workflow(two_phase_spec()).await.unwrap();
        engine.start_task("wf", "spec", "w1").await.unwrap();

        let now = Utc::now();
        assert!(engine.sweep_stale("wf", now).await.unwrap().is_empty());

        let later = now + chrono::Duration::hours(1);
        let signals = engine.sweep_stale("wf", later).await.unwrap();
        assert_eq!(signals.len(), 1);
        assert!(matches!(&signals[0], Signal::Stale { task_id, .. } if task_id == "spec"));
        // Flags only
        assert_eq!(
            engine.get_task("spec").await.unwrap().status,
            TaskStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_status_view() {
        let engine = engine();
        engine.create_workflow(two_phase_spec()).await.unwrap();

        let view = engine.get_workflow_status("wf").await.unwrap();
        assert_eq!(view.phase.as_deref(), Some("SPEC"));
        assert_eq!(view.phase_lock_state, Some(PhaseLockState::Open));
        assert_eq!(view.total_tasks, 2);
        assert_eq!(view.task_counts.get(&TaskStatus::NotStarted), Some(&2));
    }

    #[tokio::test]
    async fn test_task_from_other_workflow() {
        let engine = engine();
        engine.create_workflow(two_phase_spec()).await.unwrap();
        engine
            .create_workflow(WorkflowSpec::new("other", vec!["SPEC".into()], 1.0))
            .await
            .unwrap();

        assert!(matches!(
            engine.submit_progress("other", "spec", report("success")).await,
            Err(PhasegateError::NotFound(_))
        ));
    }
}
