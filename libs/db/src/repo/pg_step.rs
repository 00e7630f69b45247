//! PostgreSQL read access for step rows

use async_trait::async_trait;
use sqlx::PgPool;

use foreman_domain::{RunId, Step, StepId};

use crate::repo::errors::FindStepError;
use crate::repo::traits::StepRepository;
use crate::rows::StepRow;

/// PostgreSQL step repository
pub struct PgStepRepository {
    pool: PgPool,
}

impl PgStepRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StepRepository for PgStepRepository {
    async fn find_by_id(&self, id: &StepId) -> Result<Option<Step>, FindStepError> {
        let row = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, run_id, step_id, agent_id, step_index, input_template, expects,
                   step_type, loop_config, status, output, retry_count, max_retries,
                   current_story_id, created_at, updated_at
            FROM workflow_steps
            WHERE id = $1
            "#,
        )
        .bind(id.uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(FindStepError::Database)?;

        row.map(TryInto::try_into).transpose().map_err(Into::into)
    }

    async fn list_by_run(&self, run_id: &RunId) -> Result<Vec<Step>, FindStepError> {
        let rows = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, run_id, step_id, agent_id, step_index, input_template, expects,
                   step_type, loop_config, status, output, retry_count, max_retries,
                   current_story_id, created_at, updated_at
            FROM workflow_steps
            WHERE run_id = $1
            ORDER BY step_index
            "#,
        )
        .bind(run_id.uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(FindStepError::Database)?;

        rows.into_iter()
            .map(|r| r.try_into().map_err(Into::into))
            .collect()
    }

    async fn list_pending_by_run(&self, run_id: &RunId) -> Result<Vec<Step>, FindStepError> {
        let rows = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, run_id, step_id, agent_id, step_index, input_template, expects,
                   step_type, loop_config, status, output, retry_count, max_retries,
                   current_story_id, created_at, updated_at
            FROM workflow_steps
            WHERE run_id = $1 AND status = 'pending'
            ORDER BY step_index
            "#,
        )
        .bind(run_id.uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(FindStepError::Database)?;

        rows.into_iter()
            .map(|r| r.try_into().map_err(Into::into))
            .collect()
    }
}
