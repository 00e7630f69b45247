//! Run model: one execution of a workflow

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::RunStatus;
use crate::ids::{RunId, TaskId, UserId, WorkflowId};

/// Context mapping grown by merging `KEY: value` lines from agent output.
///
/// Keys are stored lowercased; lookup is case-insensitive at the template
/// layer. BTreeMap keeps serialization deterministic.
pub type RunContext = BTreeMap<String, String>;

/// One execution of a workflow bound to a free-form task prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    /// External task reference, when the run was triggered from a task
    #[serde(default)]
    pub task_id: Option<TaskId>,
    /// The prompt substituted for `{{task}}`
    pub task: String,
    pub status: RunStatus,
    pub context: RunContext,
    /// Webhook invoked when the run reaches a terminal state
    #[serde(default)]
    pub notify_url: Option<String>,
    pub awaiting_approval: bool,
    #[serde(default)]
    pub awaiting_approval_since: Option<DateTime<Utc>>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Seed the context for a new run: caller-supplied entries with the
    /// task prompt merged over them.
    #[must_use]
    pub fn seed_context(task: &str, extra: Option<&RunContext>) -> RunContext {
        let mut context = extra.cloned().unwrap_or_default();
        context.insert("task".to_string(), task.to_string());
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_context_inserts_task() {
        let context = Run::seed_context("build auth", None);
        assert_eq!(context.get("task").map(String::as_str), Some("build auth"));
    }

    #[test]
    fn test_seed_context_task_wins_over_caller() {
        let mut extra = RunContext::new();
        extra.insert("task".to_string(), "stale".to_string());
        extra.insert("repo".to_string(), "foreman".to_string());

        let context = Run::seed_context("build auth", Some(&extra));
        assert_eq!(context.get("task").map(String::as_str), Some("build auth"));
        assert_eq!(context.get("repo").map(String::as_str), Some("foreman"));
    }
}
