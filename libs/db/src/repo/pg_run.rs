//! PostgreSQL implementation of RunRepository
//!
//! Run creation materializes the run row plus one step row per config in a
//! single transaction: either all rows exist or none.

use async_trait::async_trait;
use sqlx::PgPool;

use foreman_domain::{Run, RunId, RunStatus, Step, Story, TaskId, Workflow};

use crate::repo::errors::{CreateRunError, FindRunError, UpdateRunError};
use crate::repo::traits::{NewRun, RunDetail, RunFilter, RunRepository};
use crate::rows::{context_to_json, RunRow, StepRow, StoryRow};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 200;

/// PostgreSQL run repository
pub struct PgRunRepository {
    pool: PgPool,
}

impl PgRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRepository for PgRunRepository {
    async fn create(&self, workflow: &Workflow, new: &NewRun) -> Result<RunDetail, CreateRunError> {
        let run_id = RunId::new();
        let context = Run::seed_context(&new.task, new.context.as_ref());

        let mut tx = self.pool.begin().await.map_err(CreateRunError::Database)?;

        let run_row = sqlx::query_as::<_, RunRow>(
            r#"
            INSERT INTO workflow_runs (id, workflow_id, task_id, task, status, context,
                                       notify_url, created_by)
            VALUES ($1, $2, $3, $4, 'running', $5, $6, $7)
            RETURNING id, workflow_id, task_id, task, status, context, notify_url,
                      awaiting_approval, awaiting_approval_since, created_by,
                      created_at, updated_at, completed_at
            "#,
        )
        .bind(run_id.uuid())
        .bind(workflow.id.uuid())
        .bind(new.task_id.map(TaskId::uuid))
        .bind(&new.task)
        .bind(context_to_json(&context))
        .bind(&new.notify_url)
        .bind(new.created_by.uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .is_some_and(|db| db.constraint() == Some("workflow_runs_workflow_id_fkey"))
            {
                CreateRunError::WorkflowNotFound(workflow.id)
            } else {
                CreateRunError::Database(e)
            }
        })?;

        let mut steps = Vec::with_capacity(workflow.steps.len());
        for (index, config) in workflow.steps.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let step = Step::materialize(run_id, config, index as i32);
            let loop_config = step
                .loop_config
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| {
                    CreateRunError::Decode(crate::repo::errors::RowDecodeError(format!(
                        "loop config: {e}"
                    )))
                })?;

            let row = sqlx::query_as::<_, StepRow>(
                r#"
                INSERT INTO workflow_steps (id, run_id, step_id, agent_id, step_index,
                                            input_template, expects, step_type, loop_config,
                                            status, max_retries)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                RETURNING id, run_id, step_id, agent_id, step_index, input_template, expects,
                          step_type, loop_config, status, output, retry_count, max_retries,
                          current_story_id, created_at, updated_at
                "#,
            )
            .bind(step.id.uuid())
            .bind(run_id.uuid())
            .bind(&step.step_id)
            .bind(&step.agent_id)
            .bind(step.step_index)
            .bind(&step.input_template)
            .bind(&step.expects)
            .bind(step.step_type.as_str())
            .bind(loop_config)
            .bind(step.status.as_str())
            .bind(step.max_retries)
            .fetch_one(&mut *tx)
            .await
            .map_err(CreateRunError::Database)?;

            steps.push(row.try_into()?);
        }

        tx.commit().await.map_err(CreateRunError::Database)?;

        Ok(RunDetail {
            run: run_row.try_into()?,
            steps,
            stories: Vec::new(),
        })
    }

    async fn find_by_id(&self, id: &RunId) -> Result<Option<Run>, FindRunError> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, workflow_id, task_id, task, status, context, notify_url,
                   awaiting_approval, awaiting_approval_since, created_by,
                   created_at, updated_at, completed_at
            FROM workflow_runs
            WHERE id = $1
            "#,
        )
        .bind(id.uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(FindRunError::Database)?;

        row.map(TryInto::try_into).transpose().map_err(Into::into)
    }

    async fn find_detail(&self, id: &RunId) -> Result<Option<RunDetail>, FindRunError> {
        let Some(run) = self.find_by_id(id).await? else {
            return Ok(None);
        };

        let step_rows = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, run_id, step_id, agent_id, step_index, input_template, expects,
                   step_type, loop_config, status, output, retry_count, max_retries,
                   current_story_id, created_at, updated_at
            FROM workflow_steps
            WHERE run_id = $1
            ORDER BY step_index
            "#,
        )
        .bind(id.uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(FindRunError::Database)?;

        let story_rows = sqlx::query_as::<_, StoryRow>(
            r#"
            SELECT id, run_id, story_index, story_id, title, description, acceptance_criteria,
                   status, output, retry_count, max_retries, created_at, updated_at
            FROM run_stories
            WHERE run_id = $1
            ORDER BY story_index
            "#,
        )
        .bind(id.uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(FindRunError::Database)?;

        let steps: Vec<Step> = step_rows
            .into_iter()
            .map(|r| r.try_into().map_err(FindRunError::Decode))
            .collect::<Result<_, _>>()?;
        let stories: Vec<Story> = story_rows
            .into_iter()
            .map(|r| r.try_into().map_err(FindRunError::Decode))
            .collect::<Result<_, _>>()?;

        Ok(Some(RunDetail { run, steps, stories }))
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<Run>, FindRunError> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        let offset = filter.offset.unwrap_or(0).max(0);

        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, workflow_id, task_id, task, status, context, notify_url,
                   awaiting_approval, awaiting_approval_since, created_by,
                   created_at, updated_at, completed_at
            FROM workflow_runs
            WHERE ($1::uuid IS NULL OR task_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.task_id.map(TaskId::uuid))
        .bind(filter.status.map(|s| s.as_str().to_string()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(FindRunError::Database)?;

        rows.into_iter()
            .map(|r| r.try_into().map_err(Into::into))
            .collect()
    }

    async fn update_status(&self, id: &RunId, status: RunStatus) -> Result<Run, UpdateRunError> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            UPDATE workflow_runs
            SET status = $2,
                updated_at = NOW(),
                completed_at = CASE WHEN $2 IN ('completed', 'failed') THEN NOW()
                                    ELSE completed_at END
            WHERE id = $1
            RETURNING id, workflow_id, task_id, task, status, context, notify_url,
                      awaiting_approval, awaiting_approval_since, created_by,
                      created_at, updated_at, completed_at
            "#,
        )
        .bind(id.uuid())
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(UpdateRunError::Database)?
        .ok_or(UpdateRunError::NotFound(*id))?;

        Ok(row.try_into()?)
    }
}
