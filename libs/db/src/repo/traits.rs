//! Repository trait definitions
//!
//! These traits define the interface for data access operations.
//! Implementations are provided for PostgreSQL in separate modules.
//! `#[automock]` gives store-free mocks for engine and API tests.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use foreman_domain::{
    Run, RunContext, RunId, RunStatus, Step, StepConfig, Story, TaskId, UserId, Workflow,
    WorkflowId,
};

use crate::repo::errors::{
    CreateRunError, CreateWorkflowError, DeleteWorkflowError, FindRunError, FindStepError,
    FindStoryError, FindWorkflowError, UpdateRunError, UpdateWorkflowError,
};

// =============================================================================
// Input Types
// =============================================================================

/// Input for creating a new workflow
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<StepConfig>,
    pub created_by: UserId,
}

/// Input for updating a workflow
#[derive(Debug, Clone, Default)]
pub struct WorkflowUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub steps: Option<Vec<StepConfig>>,
}

/// Input for creating a new run
#[derive(Debug, Clone)]
pub struct NewRun {
    pub workflow_id: WorkflowId,
    pub task: String,
    pub task_id: Option<TaskId>,
    pub context: Option<RunContext>,
    pub notify_url: Option<String>,
    pub created_by: UserId,
}

/// Filter for run listings
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub task_id: Option<TaskId>,
    pub status: Option<RunStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// A run together with its materialized steps and stories
#[derive(Debug, Clone)]
pub struct RunDetail {
    pub run: Run,
    pub steps: Vec<Step>,
    pub stories: Vec<Story>,
}

// =============================================================================
// Repository Traits
// =============================================================================

/// Repository for workflow definitions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Create a workflow after validating its step configs
    async fn create(&self, new: &NewWorkflow) -> Result<Workflow, CreateWorkflowError>;

    /// Find a workflow by ID
    async fn find_by_id(&self, id: &WorkflowId) -> Result<Option<Workflow>, FindWorkflowError>;

    /// Find a workflow by its unique name
    async fn find_by_name(&self, name: &str) -> Result<Option<Workflow>, FindWorkflowError>;

    /// List workflows, optionally filtered by name
    async fn list<'a>(&self, name: Option<&'a str>) -> Result<Vec<Workflow>, FindWorkflowError>;

    /// Update a workflow definition; does not reshape materialized runs
    async fn update(
        &self,
        id: &WorkflowId,
        update: &WorkflowUpdate,
    ) -> Result<Workflow, UpdateWorkflowError>;

    /// Delete a workflow; fails while any referencing run is running
    async fn delete(&self, id: &WorkflowId) -> Result<(), DeleteWorkflowError>;

    /// Count runs of this workflow currently in `running`
    async fn active_run_count(&self, id: &WorkflowId) -> Result<i64, FindWorkflowError>;
}

/// Repository for runs and their materialized rows
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Create a run and materialize one step row per config, atomically
    async fn create(&self, workflow: &Workflow, new: &NewRun) -> Result<RunDetail, CreateRunError>;

    /// Find a run by ID
    async fn find_by_id(&self, id: &RunId) -> Result<Option<Run>, FindRunError>;

    /// Find a run with embedded steps and stories
    async fn find_detail(&self, id: &RunId) -> Result<Option<RunDetail>, FindRunError>;

    /// List runs matching the filter
    async fn list(&self, filter: &RunFilter) -> Result<Vec<Run>, FindRunError>;

    /// Update run status; target must be a valid `RunStatus`
    async fn update_status(&self, id: &RunId, status: RunStatus) -> Result<Run, UpdateRunError>;
}

/// Read access to step rows (mutations go through the scheduler)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StepRepository: Send + Sync {
    async fn find_by_id(&self, id: &foreman_domain::StepId) -> Result<Option<Step>, FindStepError>;

    async fn list_by_run(&self, run_id: &RunId) -> Result<Vec<Step>, FindStepError>;

    async fn list_pending_by_run(&self, run_id: &RunId) -> Result<Vec<Step>, FindStepError>;
}

/// Read access to story rows (mutations go through the scheduler)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StoryRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &foreman_domain::StoryId,
    ) -> Result<Option<Story>, FindStoryError>;

    async fn list_by_run(&self, run_id: &RunId) -> Result<Vec<Story>, FindStoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_workflow() -> Workflow {
        Workflow {
            id: WorkflowId::new(),
            name: "feature-delivery".to_string(),
            description: None,
            steps: vec![StepConfig {
                step_id: "plan".to_string(),
                name: None,
                agent_id: "planner".to_string(),
                input_template: "Plan: {{task}}".to_string(),
                expects: "done".to_string(),
                step_type: foreman_domain::StepType::Single,
                loop_config: None,
                position: 0,
            }],
            created_by: UserId::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_workflow_repository_is_mockable_as_trait_object() {
        let workflow = sample_workflow();
        let name = workflow.name.clone();

        let mut mock = MockWorkflowRepository::new();
        mock.expect_find_by_name()
            .withf(move |n| n == name)
            .returning(move |_| Ok(Some(sample_workflow())));

        let repo: Box<dyn WorkflowRepository> = Box::new(mock);
        let found = repo.find_by_name("feature-delivery").await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().steps.len(), 1);
    }

    #[tokio::test]
    async fn test_run_repository_mock_not_found() {
        let mut mock = MockRunRepository::new();
        mock.expect_find_by_id().returning(|_| Ok(None));

        let repo: Box<dyn RunRepository> = Box::new(mock);
        assert!(repo.find_by_id(&RunId::new()).await.unwrap().is_none());
    }
}
