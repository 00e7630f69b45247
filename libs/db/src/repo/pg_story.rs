//! PostgreSQL read access for story rows

use async_trait::async_trait;
use sqlx::PgPool;

use foreman_domain::{RunId, Story, StoryId};

use crate::repo::errors::FindStoryError;
use crate::repo::traits::StoryRepository;
use crate::rows::StoryRow;

/// PostgreSQL story repository
pub struct PgStoryRepository {
    pool: PgPool,
}

impl PgStoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StoryRepository for PgStoryRepository {
    async fn find_by_id(&self, id: &StoryId) -> Result<Option<Story>, FindStoryError> {
        let row = sqlx::query_as::<_, StoryRow>(
            r#"
            SELECT id, run_id, story_index, story_id, title, description, acceptance_criteria,
                   status, output, retry_count, max_retries, created_at, updated_at
            FROM run_stories
            WHERE id = $1
            "#,
        )
        .bind(id.uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(FindStoryError::Database)?;

        row.map(TryInto::try_into).transpose().map_err(Into::into)
    }

    async fn list_by_run(&self, run_id: &RunId) -> Result<Vec<Story>, FindStoryError> {
        let rows = sqlx::query_as::<_, StoryRow>(
            r#"
            SELECT id, run_id, story_index, story_id, title, description, acceptance_criteria,
                   status, output, retry_count, max_retries, created_at, updated_at
            FROM run_stories
            WHERE run_id = $1
            ORDER BY story_index
            "#,
        )
        .bind(run_id.uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(FindStoryError::Database)?;

        rows.into_iter()
            .map(|r| r.try_into().map_err(Into::into))
            .collect()
    }
}
