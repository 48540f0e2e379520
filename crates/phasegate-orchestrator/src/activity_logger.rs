//! Activity Logger - Human-readable workflow log in `.phasegate/activity.md`
//!
//! Records what happened to each workflow for the humans watching it:
//! - Workflow creation
//! - Progress reports (outcome and spend)
//! - Signals (warnings, breaks, loops, stale tasks, approvals needed)
//! - Phase approvals, rejections and manual overrides

use chrono::Utc;
use phasegate_core::fail_open::fail_open;
use phasegate_core::{ProgressEntry, Result, Workflow};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::signals::Signal;

/// Maximum characters of an action/outcome kept in a log line
const ACTIVITY_LOG_PREVIEW_CHARS: usize = 200;

/// Append-only markdown activity log
pub struct ActivityLogger {
    output_path: PathBuf,
}

impl ActivityLogger {
    /// Create a logger writing to `activity.md` inside `state_dir`
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            output_path: state_dir.as_ref().join("activity.md"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.output_path
    }

    /// Log a new workflow
    ///
    /// This operation is fail-open - logging failures never fail the engine
    pub async fn log_workflow_created(&self, workflow: &Workflow) {
        fail_open("activity_logger::log_workflow_created", || async {
            let phases: Vec<&str> = workflow.phases.iter().map(|p| p.name.as_str()).collect();
            let content = format!(
                "## Workflow {}\n**Created**: {}\n**Phases**: {}\n**Budget**: ${:.2}\n**Tasks**: {}\n\n",
                workflow.workflow_id,
                timestamp(),
                phases.join(" -> "),
                workflow.budget.budget_usd,
                workflow.task_ids.len()
            );
            self.append_internal(&content).await
        })
        .await;
    }

    /// Log one progress report
    ///
    /// This operation is fail-open - logging failures never fail the engine
    pub async fn log_progress(&self, workflow_id: &str, task_id: &str, entry: &ProgressEntry) {
        fail_open("activity_logger::log_progress", || async {
            let mut content = format!(
                "- {} `{}` / `{}` by {}: {} -> **{}**",
                timestamp(),
                workflow_id,
                task_id,
                entry.agent_id,
                preview(&entry.action_taken),
                preview(&entry.outcome)
            );
            if let Some(usage) = &entry.tokens_consumed {
                content.push_str(&format!(
                    " ({} in / {} out, {})",
                    usage.input_tokens, usage.output_tokens, usage.tier
                ));
            }
            content.push('\n');
            self.append_internal(&content).await
        })
        .await;
    }

    /// Log the signals produced by an operation
    ///
    /// This operation is fail-open - logging failures never fail the engine
    pub async fn log_signals(&self, workflow_id: &str, signals: &[Signal]) {
        if signals.is_empty() {
            return;
        }
        fail_open("activity_logger::log_signals", || async {
            let mut content = String::new();
            for signal in signals {
                content.push_str(&format!(
                    "- {} `{}` **SIGNAL** {}\n",
                    timestamp(),
                    workflow_id,
                    signal
                ));
            }
            self.append_internal(&content).await
        })
        .await;
    }

    /// Log a human decision or manual change (approval, rejection, override)
    ///
    /// This operation is fail-open - logging failures never fail the engine
    pub async fn log_transition(&self, workflow_id: &str, message: &str) {
        fail_open("activity_logger::log_transition", || async {
            let content = format!("- {} `{}` {}\n", timestamp(), workflow_id, message);
            self.append_internal(&content).await
        })
        .await;
    }

    /// Append content to the activity log (internal, returns Result for fail_open)
    async fn append_internal(&self, content: &str) -> Result<()> {
        if let Some(parent) = self.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_path)
            .await?;

        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

fn timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn preview(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("");
    if first_line.chars().count() > ACTIVITY_LOG_PREVIEW_CHARS {
        let truncated: String = first_line.chars().take(ACTIVITY_LOG_PREVIEW_CHARS).collect();
        format!("{truncated}...")
    } else {
        first_line.to_string()
    }
}
