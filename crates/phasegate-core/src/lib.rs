//! # phasegate-core
//!
//! Core types for the Phasegate orchestration engine.
//!
//! Phasegate coordinates multi-step work done by cooperating worker agents:
//! tasks move through an ordered, approval-gated phase sequence
//! (`SPEC -> TEST_DESIGN -> TEST_IMPL -> IMPLEMENT -> VALIDATE -> REVIEW -> DELIVER`),
//! spend is capped by a per-workflow budget, and workers repeating themselves are
//! flagged instead of retried forever.
//!
//! ## Data model
//!
//! - [`Task`] is one unit of work with an append-only [`ProgressEntry`] history
//! - [`Workflow`] owns the phase lock states and the [`BudgetLedger`]
//! - [`PhasegateError`] is the error taxonomy shared by every crate

mod error;
mod types;
mod workflow;

pub mod config;
pub mod fail_open;

pub use config::{PhasegateConfig, TierPrice};
pub use error::{PhasegateError, Result};
pub use types::*;
pub use workflow::*;
