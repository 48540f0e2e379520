//! # phasegate-orchestrator
//!
//! Orchestration engine for Phasegate.
//!
//! This crate provides:
//! - [`Engine`], the serialized per-workflow orchestration loop
//! - Dependency-aware scheduling and construction-time cycle rejection
//! - The approval-gated phase state machine with immutable-phase fingerprints
//! - Loop/staleness detection over progress histories
//! - The cost circuit breaker
//! - A fail-open markdown activity log

mod activity_logger;
mod breaker;
mod detector;
mod engine;
mod gate;
mod graph;
mod scheduler;
mod signals;

pub use activity_logger::ActivityLogger;
pub use breaker::{record_cost, BreakerEvent, CostBreaker};
pub use detector::{detect_loop, LoopDetector, TaskHealth, DEFAULT_WINDOW};
pub use engine::Engine;
pub use gate::{fingerprint, transition, verify_locks, Approval, GateAction, GateEvent, PhaseGate};
pub use graph::{topological_order, validate_dependencies};
pub use scheduler::{next_actionable, pending_dependencies, unsettled};
pub use signals::{ProgressOutcome, Signal, WorkflowStatusView};
