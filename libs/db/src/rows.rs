//! SQLx row types and conversions into the domain model
//!
//! Shared between the repositories and the engine's transactional queries so
//! the column lists and decode rules live in one place.

use std::str::FromStr;

use foreman_domain::{
    LoopConfig, Run, RunContext, RunId, RunStatus, Step, StepConfig, StepId, StepStatus, StepType,
    Story, StoryId, StoryStatus, TaskId, UserId, Workflow, WorkflowId,
};

use crate::repo::errors::RowDecodeError;

/// Column list for workflow selects
pub const WORKFLOW_COLUMNS: &str =
    "id, name, description, steps, created_by, created_at, updated_at";

/// Column list for run selects
pub const RUN_COLUMNS: &str = "id, workflow_id, task_id, task, status, context, notify_url, \
     awaiting_approval, awaiting_approval_since, created_by, created_at, updated_at, completed_at";

/// Column list for step selects
pub const STEP_COLUMNS: &str = "id, run_id, step_id, agent_id, step_index, input_template, \
     expects, step_type, loop_config, status, output, retry_count, max_retries, \
     current_story_id, created_at, updated_at";

/// Column list for story selects
pub const STORY_COLUMNS: &str = "id, run_id, story_index, story_id, title, description, \
     acceptance_criteria, status, output, retry_count, max_retries, created_at, updated_at";

#[derive(sqlx::FromRow)]
pub struct WorkflowRow {
    pub id: uuid::Uuid,
    pub name: String,
    pub description: Option<String>,
    pub steps: serde_json::Value,
    pub created_by: uuid::Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = RowDecodeError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        let steps: Vec<StepConfig> = serde_json::from_value(row.steps)
            .map_err(|e| RowDecodeError(format!("workflow steps: {e}")))?;

        Ok(Workflow {
            id: WorkflowId::from_uuid(row.id),
            name: row.name,
            description: row.description,
            steps,
            created_by: UserId::from_uuid(row.created_by),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct RunRow {
    pub id: uuid::Uuid,
    pub workflow_id: uuid::Uuid,
    pub task_id: Option<uuid::Uuid>,
    pub task: String,
    pub status: String,
    pub context: serde_json::Value,
    pub notify_url: Option<String>,
    pub awaiting_approval: bool,
    pub awaiting_approval_since: Option<chrono::DateTime<chrono::Utc>>,
    pub created_by: uuid::Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl TryFrom<RunRow> for Run {
    type Error = RowDecodeError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status = RunStatus::from_str(&row.status)
            .map_err(|e| RowDecodeError(format!("run status: {e}")))?;
        let context: RunContext = serde_json::from_value(row.context)
            .map_err(|e| RowDecodeError(format!("run context: {e}")))?;

        Ok(Run {
            id: RunId::from_uuid(row.id),
            workflow_id: WorkflowId::from_uuid(row.workflow_id),
            task_id: row.task_id.map(TaskId::from_uuid),
            task: row.task,
            status,
            context,
            notify_url: row.notify_url,
            awaiting_approval: row.awaiting_approval,
            awaiting_approval_since: row.awaiting_approval_since,
            created_by: UserId::from_uuid(row.created_by),
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct StepRow {
    pub id: uuid::Uuid,
    pub run_id: uuid::Uuid,
    pub step_id: String,
    pub agent_id: String,
    pub step_index: i32,
    pub input_template: String,
    pub expects: String,
    pub step_type: String,
    pub loop_config: Option<serde_json::Value>,
    pub status: String,
    pub output: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub current_story_id: Option<uuid::Uuid>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<StepRow> for Step {
    type Error = RowDecodeError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        let status = StepStatus::from_str(&row.status)
            .map_err(|e| RowDecodeError(format!("step status: {e}")))?;
        let step_type = StepType::from_str(&row.step_type)
            .map_err(|e| RowDecodeError(format!("step type: {e}")))?;
        let loop_config: Option<LoopConfig> = row
            .loop_config
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| RowDecodeError(format!("loop config: {e}")))?;

        Ok(Step {
            id: StepId::from_uuid(row.id),
            run_id: RunId::from_uuid(row.run_id),
            step_id: row.step_id,
            agent_id: row.agent_id,
            step_index: row.step_index,
            input_template: row.input_template,
            expects: row.expects,
            step_type,
            loop_config,
            status,
            output: row.output,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            current_story_id: row.current_story_id.map(StoryId::from_uuid),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct StoryRow {
    pub id: uuid::Uuid,
    pub run_id: uuid::Uuid,
    pub story_index: i32,
    pub story_id: String,
    pub title: String,
    pub description: Option<String>,
    pub acceptance_criteria: Option<String>,
    pub status: String,
    pub output: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<StoryRow> for Story {
    type Error = RowDecodeError;

    fn try_from(row: StoryRow) -> Result<Self, Self::Error> {
        let status = StoryStatus::from_str(&row.status)
            .map_err(|e| RowDecodeError(format!("story status: {e}")))?;

        Ok(Story {
            id: StoryId::from_uuid(row.id),
            run_id: RunId::from_uuid(row.run_id),
            story_index: row.story_index,
            story_id: row.story_id,
            title: row.title,
            description: row.description,
            acceptance_criteria: row.acceptance_criteria,
            status,
            output: row.output,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Serialize a run context for a JSONB bind
#[must_use]
pub fn context_to_json(context: &RunContext) -> serde_json::Value {
    serde_json::to_value(context).unwrap_or_else(|_| serde_json::json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_step_row_decodes() {
        let row = StepRow {
            id: uuid::Uuid::now_v7(),
            run_id: uuid::Uuid::now_v7(),
            step_id: "plan".to_string(),
            agent_id: "planner".to_string(),
            step_index: 0,
            input_template: "Plan: {{task}}".to_string(),
            expects: "done".to_string(),
            step_type: "loop".to_string(),
            loop_config: Some(serde_json::json!({
                "over": "stories",
                "completion": "all_done",
                "verify_each": true,
                "verify_step": "verify"
            })),
            status: "pending".to_string(),
            output: None,
            retry_count: 0,
            max_retries: 3,
            current_story_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let step: Step = row.try_into().unwrap();
        assert_eq!(step.step_type, StepType::Loop);
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.verifies_each_story());
    }

    #[test]
    fn test_step_row_rejects_unknown_status() {
        let row = StepRow {
            id: uuid::Uuid::now_v7(),
            run_id: uuid::Uuid::now_v7(),
            step_id: "plan".to_string(),
            agent_id: "planner".to_string(),
            step_index: 0,
            input_template: String::new(),
            expects: String::new(),
            step_type: "single".to_string(),
            loop_config: None,
            status: "bogus".to_string(),
            output: None,
            retry_count: 0,
            max_retries: 3,
            current_story_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let result: Result<Step, _> = row.try_into();
        assert!(result.is_err());
    }

    #[test]
    fn test_run_row_decodes_context() {
        let row = RunRow {
            id: uuid::Uuid::now_v7(),
            workflow_id: uuid::Uuid::now_v7(),
            task_id: None,
            task: "auth".to_string(),
            status: "running".to_string(),
            context: serde_json::json!({"task": "auth"}),
            notify_url: None,
            awaiting_approval: false,
            awaiting_approval_since: None,
            created_by: uuid::Uuid::now_v7(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        };

        let run: Run = row.try_into().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.context.get("task").map(String::as_str), Some("auth"));
    }
}
