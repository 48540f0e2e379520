//! # phasegate-store
//!
//! Durable task ledger for Phasegate.
//!
//! This crate provides:
//! - The [`LedgerStore`] contract the orchestration engine depends on
//! - [`MemoryStore`], an in-process implementation
//! - [`JournalStore`], an append-only JSON-lines journal that replays on open

mod journal;
mod memory;
mod store;

pub use journal::JournalStore;
pub use memory::MemoryStore;
pub use store::{sort_tasks, LedgerStore, TaskFilter, TaskMutation};
