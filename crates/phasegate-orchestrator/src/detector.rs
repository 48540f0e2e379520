//! Loop and staleness detection over a task's progress history
//!
//! Purely pattern-based: a task whose recent attempts keep producing the same
//! `(action_taken, outcome)` pair is looping; an in-progress task that has not been
//! touched for too long is stale. Neither check ever errors.

use chrono::{DateTime, Utc};
use phasegate_core::config::DetectorConfig;
use phasegate_core::{ProgressEntry, Task, TaskStatus};
use std::collections::HashSet;
use std::time::Duration;

/// Classification of a task's recent activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskHealth {
    Healthy,
    Looping,
    Stale,
}

/// Default number of entries inspected
pub const DEFAULT_WINDOW: usize = 4;

/// Classify the most recent `window` entries of a history.
///
/// Fewer entries than the window is not enough evidence and stays healthy.
/// Looping means fewer than half of the window's `(action, outcome)` pairs are
/// distinct: four identical failures loop, three failures and a success do not.
pub fn detect_loop(history: &[ProgressEntry], window: usize) -> TaskHealth {
    if window == 0 || history.len() < window {
        return TaskHealth::Healthy;
    }

    let recent = &history[history.len() - window..];
    let distinct: HashSet<(&str, &str)> = recent
        .iter()
        .map(|e| (e.action_taken.trim(), e.outcome.trim()))
        .collect();

    if distinct.len() * 2 < window {
        TaskHealth::Looping
    } else {
        TaskHealth::Healthy
    }
}

/// Detector with configurable window and staleness threshold
#[derive(Debug, Clone)]
pub struct LoopDetector {
    window: usize,
    stale_after: Duration,
}

impl LoopDetector {
    pub fn new(window: usize, stale_after: Duration) -> Self {
        Self {
            window: window.max(1),
            stale_after,
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(config.window, Duration::from_secs(config.stale_after_secs))
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Stale wins over the pair check: a silent worker is reported regardless of
    /// what its last attempts looked like.
    pub fn classify(&self, task: &Task, now: DateTime<Utc>) -> TaskHealth {
        if self.is_stale(task, now) {
            return TaskHealth::Stale;
        }
        detect_loop(&task.history, self.window)
    }

    pub fn is_stale(&self, task: &Task, now: DateTime<Utc>) -> bool {
        if task.status != TaskStatus::InProgress {
            return false;
        }
        self.idle_for(task, now) > self.stale_after
    }

    /// Time since the task was last updated (zero if the clock went backwards)
    pub fn idle_for(&self, task: &Task, now: DateTime<Utc>) -> Duration {
        (now - task.updated_at).to_std().unwrap_or(Duration::ZERO)
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, Duration::from_secs(30 * 60))
    }
}
