//! PostgreSQL implementation of WorkflowRepository

use async_trait::async_trait;
use sqlx::PgPool;

use foreman_domain::{validate_step_configs, Workflow, WorkflowId};

use crate::repo::errors::{
    CreateWorkflowError, DeleteWorkflowError, FindWorkflowError, RowDecodeError,
    UpdateWorkflowError,
};
use crate::repo::traits::{NewWorkflow, WorkflowRepository, WorkflowUpdate};
use crate::rows::WorkflowRow;

/// PostgreSQL workflow repository
pub struct PgWorkflowRepository {
    pool: PgPool,
}

impl PgWorkflowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowRepository for PgWorkflowRepository {
    async fn create(&self, new: &NewWorkflow) -> Result<Workflow, CreateWorkflowError> {
        validate_step_configs(&new.steps)?;

        let id = WorkflowId::new();
        let steps = serde_json::to_value(&new.steps)
            .map_err(|e| RowDecodeError(format!("workflow steps: {e}")))?;

        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            INSERT INTO workflows (id, name, description, steps, created_by)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, description, steps, created_by, created_at, updated_at
            "#,
        )
        .bind(id.uuid())
        .bind(&new.name)
        .bind(&new.description)
        .bind(steps)
        .bind(new.created_by.uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e, "workflows_name_key") {
                CreateWorkflowError::NameExists(new.name.clone())
            } else {
                CreateWorkflowError::Database(e)
            }
        })?;

        Ok(row.try_into()?)
    }

    async fn find_by_id(&self, id: &WorkflowId) -> Result<Option<Workflow>, FindWorkflowError> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, name, description, steps, created_by, created_at, updated_at
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(id.uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(FindWorkflowError::Database)?;

        row.map(TryInto::try_into).transpose().map_err(Into::into)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Workflow>, FindWorkflowError> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, name, description, steps, created_by, created_at, updated_at
            FROM workflows
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(FindWorkflowError::Database)?;

        row.map(TryInto::try_into).transpose().map_err(Into::into)
    }

    async fn list<'a>(&self, name: Option<&'a str>) -> Result<Vec<Workflow>, FindWorkflowError> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, name, description, steps, created_by, created_at, updated_at
            FROM workflows
            WHERE $1::text IS NULL OR name = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(FindWorkflowError::Database)?;

        rows.into_iter()
            .map(|r| r.try_into().map_err(Into::into))
            .collect()
    }

    async fn update(
        &self,
        id: &WorkflowId,
        update: &WorkflowUpdate,
    ) -> Result<Workflow, UpdateWorkflowError> {
        if let Some(steps) = &update.steps {
            validate_step_configs(steps)?;
        }

        let steps = update
            .steps
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| RowDecodeError(format!("workflow steps: {e}")))?;

        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            UPDATE workflows
            SET name = COALESCE($2, name),
                description = COALESCE($3, description),
                steps = COALESCE($4, steps),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, description, steps, created_by, created_at, updated_at
            "#,
        )
        .bind(id.uuid())
        .bind(&update.name)
        .bind(&update.description)
        .bind(steps)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e, "workflows_name_key") {
                UpdateWorkflowError::NameExists(update.name.clone().unwrap_or_default())
            } else {
                UpdateWorkflowError::Database(e)
            }
        })?
        .ok_or(UpdateWorkflowError::NotFound(*id))?;

        Ok(row.try_into()?)
    }

    async fn delete(&self, id: &WorkflowId) -> Result<(), DeleteWorkflowError> {
        let active = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM workflow_runs WHERE workflow_id = $1 AND status = 'running'",
        )
        .bind(id.uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(DeleteWorkflowError::Database)?;

        if active > 0 {
            return Err(DeleteWorkflowError::ActiveRuns(active));
        }

        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id.uuid())
            .execute(&self.pool)
            .await
            .map_err(DeleteWorkflowError::Database)?;

        if result.rows_affected() == 0 {
            return Err(DeleteWorkflowError::NotFound(*id));
        }

        Ok(())
    }

    async fn active_run_count(&self, id: &WorkflowId) -> Result<i64, FindWorkflowError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM workflow_runs WHERE workflow_id = $1 AND status = 'running'",
        )
        .bind(id.uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(FindWorkflowError::Database)
    }
}

/// Check whether a sqlx error is a unique violation on the named constraint
fn is_unique_violation(e: &sqlx::Error, constraint: &str) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.constraint() == Some(constraint))
}
