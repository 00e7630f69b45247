//! Loop controller
//!
//! Handles `type = loop` steps iterating over stories, the optional
//! verify-each sub-pass, and story-level lifecycle verbs.
//!
//! A loop iteration never completes the loop step itself: the step drops
//! back to `pending` (or `waiting` while a verify pass runs) so the agent's
//! next poll picks up the next story. The step completes eagerly inside a
//! claim attempt that finds the story set exhausted (see the scheduler).

use sqlx::Postgres;

use foreman_domain::{Run, RunId, Step, StepStatus, Story, StoryId, StorySeed, StoryStatus};

use crate::error::EngineError;
use crate::events::{names, EventEnvelope};
use crate::scheduler::{
    cas_step_update, cas_story_update, fail_run, fetch_run, fetch_story, insert_stories, lock_run,
    run_payload, step_payload, story_payload, ClearStory, CompletionOutcome, Outbox, Scheduler,
};

/// Result of reporting a story failure
#[derive(Debug, Clone)]
pub struct StoryFailOutcome {
    pub story: Story,
    pub will_retry: bool,
}

/// Find the loop step whose verify partner is `step`, if any.
pub(crate) async fn find_verify_parent(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    step: &Step,
) -> Result<Option<Step>, EngineError> {
    let rows = sqlx::query_as::<_, foreman_db::rows::StepRow>(
        r#"
        SELECT id, run_id, step_id, agent_id, step_index, input_template, expects,
               step_type, loop_config, status, output, retry_count, max_retries,
               current_story_id, created_at, updated_at
        FROM workflow_steps
        WHERE run_id = $1 AND step_type = 'loop'
        ORDER BY step_index
        "#,
    )
    .bind(step.run_id.uuid())
    .fetch_all(&mut **tx)
    .await?;

    for row in rows {
        let candidate: Step = row.try_into()?;
        let is_partner = candidate
            .loop_config
            .as_ref()
            .and_then(|c| c.verify_step.as_deref())
            .is_some_and(|verify| verify == step.step_id);
        if is_partner {
            return Ok(Some(candidate));
        }
    }

    Ok(None)
}

/// Find the loop step responsible for a story: the one currently bound to
/// it, or failing that the run's first loop step.
async fn find_loop_step_for_story(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    run_id: RunId,
    story_id: StoryId,
) -> Result<Option<Step>, EngineError> {
    let rows = sqlx::query_as::<_, foreman_db::rows::StepRow>(
        r#"
        SELECT id, run_id, step_id, agent_id, step_index, input_template, expects,
               step_type, loop_config, status, output, retry_count, max_retries,
               current_story_id, created_at, updated_at
        FROM workflow_steps
        WHERE run_id = $1 AND step_type = 'loop'
        ORDER BY step_index
        "#,
    )
    .bind(run_id.uuid())
    .fetch_all(&mut **tx)
    .await?;

    let mut steps = Vec::with_capacity(rows.len());
    for row in rows {
        steps.push(TryInto::<Step>::try_into(row)?);
    }

    Ok(steps
        .iter()
        .find(|s| s.current_story_id == Some(story_id))
        .cloned()
        .or_else(|| steps.into_iter().next()))
}

impl Scheduler {
    /// A loop step finished one story iteration.
    ///
    /// With verify-each the story parks in `verifying` and the verify
    /// partner is activated; otherwise the story completes and the loop
    /// step returns to `pending` for the next poll.
    pub(crate) async fn finish_loop_iteration(
        &self,
        mut tx: sqlx::Transaction<'_, Postgres>,
        step: Step,
        run: Run,
        output: &str,
    ) -> Result<CompletionOutcome, EngineError> {
        let story_id = step
            .current_story_id
            .ok_or_else(|| EngineError::conflict("loop step has no current story", None))?;
        let story = fetch_story(&mut tx, story_id)
            .await?
            .ok_or(EngineError::NotFound("story"))?;

        let mut outbox = Outbox::for_run(&run);

        if step.verifies_each_story() {
            if !cas_story_update(
                &mut tx,
                story.id,
                StoryStatus::Running,
                StoryStatus::Verifying,
                Some(output),
            )
            .await?
            {
                return Err(EngineError::conflict(
                    "story is not running",
                    Some(story.status.as_str().to_string()),
                ));
            }

            let verify_step_id = step
                .loop_config
                .as_ref()
                .and_then(|c| c.verify_step.clone())
                .ok_or_else(|| EngineError::conflict("loop step has no verify step", None))?;
            let verify_step = fetch_step_by_slug(&mut tx, run.id, &verify_step_id)
                .await?
                .ok_or(EngineError::NotFound("verify step"))?;

            verify_step.status.check_transition(StepStatus::Pending)?;
            sqlx::query(
                r#"
                UPDATE workflow_steps
                SET status = 'pending', current_story_id = $2, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(verify_step.id.uuid())
            .bind(story.id.uuid())
            .execute(&mut *tx)
            .await?;

            // Park the loop step until the verify pass resolves
            cas_step_update(
                &mut tx,
                step.id,
                StepStatus::Running,
                StepStatus::Waiting,
                Some(output),
                ClearStory::Clear,
            )
            .await?;

            tx.commit().await?;
        } else {
            if !cas_story_update(
                &mut tx,
                story.id,
                StoryStatus::Running,
                StoryStatus::Completed,
                Some(output),
            )
            .await?
            {
                return Err(EngineError::conflict(
                    "story is not running",
                    Some(story.status.as_str().to_string()),
                ));
            }

            // Back to pending: the agent re-polls for the next story
            cas_step_update(
                &mut tx,
                step.id,
                StepStatus::Running,
                StepStatus::Pending,
                Some(output),
                ClearStory::Clear,
            )
            .await?;

            outbox.push(EventEnvelope::workflow(
                names::STORY_COMPLETED,
                story_payload(&story, StoryStatus::Completed),
            ));

            tx.commit().await?;
        }

        let step = self.reload_step(step.id).await?;
        self.flush(outbox).await;

        Ok(CompletionOutcome {
            step,
            step_completed: false,
            run_completed: false,
        })
    }

    /// A verify partner finished its pass over a story.
    ///
    /// The story completes with the verify output attached, the verify step
    /// parks back in `waiting`, and the loop step returns to `pending`.
    pub(crate) async fn finish_verify_pass(
        &self,
        mut tx: sqlx::Transaction<'_, Postgres>,
        verify_step: Step,
        loop_step: Step,
        run: Run,
        output: &str,
    ) -> Result<CompletionOutcome, EngineError> {
        let story_id = verify_step
            .current_story_id
            .ok_or_else(|| EngineError::conflict("verify step has no current story", None))?;
        let story = fetch_story(&mut tx, story_id)
            .await?
            .ok_or(EngineError::NotFound("story"))?;

        if !cas_story_update(
            &mut tx,
            story.id,
            StoryStatus::Verifying,
            StoryStatus::Completed,
            Some(output),
        )
        .await?
        {
            return Err(EngineError::conflict(
                "story is not verifying",
                Some(story.status.as_str().to_string()),
            ));
        }

        verify_step.status.check_transition(StepStatus::Waiting)?;
        cas_step_update(
            &mut tx,
            verify_step.id,
            verify_step.status,
            StepStatus::Waiting,
            None,
            ClearStory::Clear,
        )
        .await?;

        // Wake the loop step for the next story
        cas_step_update(
            &mut tx,
            loop_step.id,
            StepStatus::Waiting,
            StepStatus::Pending,
            None,
            ClearStory::Clear,
        )
        .await?;

        let mut outbox = Outbox::for_run(&run);
        outbox.push(EventEnvelope::workflow(
            names::STORY_COMPLETED,
            story_payload(&story, StoryStatus::Completed),
        ));

        tx.commit().await?;

        let step = self.reload_step(verify_step.id).await?;
        self.flush(outbox).await;

        Ok(CompletionOutcome {
            step,
            step_completed: false,
            run_completed: false,
        })
    }

    // =========================================================================
    // Story verbs
    // =========================================================================

    /// Manually move a story from pending to running
    pub async fn start_story(&self, story_id: StoryId) -> Result<Story, EngineError> {
        let mut tx = self.pool().begin().await?;

        let story = fetch_story(&mut tx, story_id)
            .await?
            .ok_or(EngineError::NotFound("story"))?;
        story.status.check_transition(StoryStatus::Running)?;

        if !cas_story_update(&mut tx, story.id, StoryStatus::Pending, StoryStatus::Running, None)
            .await?
        {
            return Err(EngineError::ConcurrencyLoss {
                current_status: story.status.as_str().to_string(),
            });
        }

        tx.commit().await?;
        self.reload_story(story_id).await
    }

    /// Complete a story directly (test harnesses and manual recovery)
    pub async fn complete_story(
        &self,
        story_id: StoryId,
        output: Option<&str>,
    ) -> Result<Story, EngineError> {
        let mut tx = self.pool().begin().await?;

        let story = fetch_story(&mut tx, story_id)
            .await?
            .ok_or(EngineError::NotFound("story"))?;
        let run = fetch_run(&mut tx, story.run_id)
            .await?
            .ok_or(EngineError::NotFound("run"))?;
        story.status.check_transition(StoryStatus::Completed)?;

        if !cas_story_update(&mut tx, story.id, story.status, StoryStatus::Completed, output)
            .await?
        {
            return Err(EngineError::ConcurrencyLoss {
                current_status: story.status.as_str().to_string(),
            });
        }

        let mut outbox = Outbox::for_run(&run);
        outbox.push(EventEnvelope::workflow(
            names::STORY_COMPLETED,
            story_payload(&story, StoryStatus::Completed),
        ));

        tx.commit().await?;
        self.flush(outbox).await;
        self.reload_story(story_id).await
    }

    /// Report a story failure.
    ///
    /// Retries while the budget allows; once exhausted the story fails, the
    /// parent loop step fails with the story's reason, and the run fails.
    pub async fn fail_story(
        &self,
        story_id: StoryId,
        error: &str,
        output: Option<&str>,
    ) -> Result<StoryFailOutcome, EngineError> {
        let mut tx = self.pool().begin().await?;

        let story = fetch_story(&mut tx, story_id)
            .await?
            .ok_or(EngineError::NotFound("story"))?;
        lock_run(&mut tx, story.run_id).await?;
        let story = fetch_story(&mut tx, story_id)
            .await?
            .ok_or(EngineError::NotFound("story"))?;
        let run = fetch_run(&mut tx, story.run_id)
            .await?
            .ok_or(EngineError::NotFound("run"))?;

        if story.status.is_terminal() {
            return Err(EngineError::conflict(
                "story already finished",
                Some(story.status.as_str().to_string()),
            ));
        }

        let loop_step = find_loop_step_for_story(&mut tx, story.run_id, story.id).await?;

        if story.can_retry() {
            let retry = story.retry_count + 1;
            let synthetic = serde_json::json!({
                "error": error,
                "output": output,
                "retry": retry,
            })
            .to_string();

            sqlx::query(
                r#"
                UPDATE run_stories
                SET status = 'pending', retry_count = $2, output = $3, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(story.id.uuid())
            .bind(retry)
            .bind(&synthetic)
            .execute(&mut *tx)
            .await?;

            // Release the loop step if it was bound to this story
            if let Some(loop_step) = &loop_step {
                if loop_step.current_story_id == Some(story.id) {
                    cas_step_update(
                        &mut tx,
                        loop_step.id,
                        StepStatus::Running,
                        StepStatus::Pending,
                        None,
                        ClearStory::Clear,
                    )
                    .await?;
                }
            }

            tx.commit().await?;
            return Ok(StoryFailOutcome {
                story: self.reload_story(story_id).await?,
                will_retry: true,
            });
        }

        let synthetic = serde_json::json!({
            "error": error,
            "output": output,
            "retries_exceeded": true,
        })
        .to_string();

        sqlx::query(
            r#"
            UPDATE run_stories
            SET status = 'failed', output = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(story.id.uuid())
        .bind(&synthetic)
        .execute(&mut *tx)
        .await?;

        let mut outbox = Outbox::for_run(&run);

        // Story exhaustion fails the parent loop step regardless of the
        // step's current phase, which in turn fails the run.
        if let Some(loop_step) = &loop_step {
            let reason = serde_json::json!({
                "error": "story failed",
                "story": story.story_id,
                "reason": error,
            })
            .to_string();

            sqlx::query(
                r#"
                UPDATE workflow_steps
                SET status = 'failed', output = $2, current_story_id = NULL, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(loop_step.id.uuid())
            .bind(&reason)
            .execute(&mut *tx)
            .await?;

            outbox.push(EventEnvelope::workflow(
                names::STEP_FAILED,
                step_payload(loop_step, StepStatus::Failed),
            ));
        }

        fail_run(&mut tx, run.id).await?;
        outbox.push_terminal(EventEnvelope::workflow(
            names::RUN_FAILED,
            run_payload(&run, foreman_domain::RunStatus::Failed),
        ));

        tx.commit().await?;
        let story = self.reload_story(story_id).await?;
        self.flush(outbox).await;

        Ok(StoryFailOutcome {
            story,
            will_retry: false,
        })
    }

    /// Append a story to a run manually (mirrors the planner path)
    pub async fn add_story(&self, run_id: RunId, seed: &StorySeed) -> Result<Story, EngineError> {
        let mut tx = self.pool().begin().await?;

        lock_run(&mut tx, run_id).await?;
        let run = fetch_run(&mut tx, run_id)
            .await?
            .ok_or(EngineError::NotFound("run"))?;
        if run.status != foreman_domain::RunStatus::Running {
            return Err(EngineError::conflict(
                "run is not running",
                Some(run.status.as_str().to_string()),
            ));
        }

        insert_stories(&mut tx, run_id, std::slice::from_ref(seed)).await?;

        let story = sqlx::query_as::<_, foreman_db::rows::StoryRow>(
            r#"
            SELECT id, run_id, story_index, story_id, title, description, acceptance_criteria,
                   status, output, retry_count, max_retries, created_at, updated_at
            FROM run_stories
            WHERE run_id = $1 AND story_id = $2
            "#,
        )
        .bind(run_id.uuid())
        .bind(&seed.id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(story.try_into()?)
    }

    /// Generic story patch: status (matrix-checked) and output
    pub async fn patch_story(
        &self,
        story_id: StoryId,
        status: Option<StoryStatus>,
        output: Option<&str>,
    ) -> Result<Story, EngineError> {
        let mut tx = self.pool().begin().await?;

        let story = fetch_story(&mut tx, story_id)
            .await?
            .ok_or(EngineError::NotFound("story"))?;

        if let Some(status) = status {
            story.status.check_transition(status)?;
            sqlx::query("UPDATE run_stories SET status = $2, updated_at = NOW() WHERE id = $1")
                .bind(story.id.uuid())
                .bind(status.as_str())
                .execute(&mut *tx)
                .await?;
        }

        if let Some(output) = output {
            sqlx::query("UPDATE run_stories SET output = $2, updated_at = NOW() WHERE id = $1")
                .bind(story.id.uuid())
                .bind(output)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        self.reload_story(story_id).await
    }

    pub(crate) async fn reload_story(&self, story_id: StoryId) -> Result<Story, EngineError> {
        let mut conn = self.pool().acquire().await?;
        fetch_story(&mut conn, story_id)
            .await?
            .ok_or(EngineError::NotFound("story"))
    }
}

/// Fetch a step by its config slug within a run
pub(crate) async fn fetch_step_by_slug(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    run_id: RunId,
    step_slug: &str,
) -> Result<Option<Step>, EngineError> {
    let row = sqlx::query_as::<_, foreman_db::rows::StepRow>(
        r#"
        SELECT id, run_id, step_id, agent_id, step_index, input_template, expects,
               step_type, loop_config, status, output, retry_count, max_retries,
               current_story_id, created_at, updated_at
        FROM workflow_steps
        WHERE run_id = $1 AND step_id = $2
        "#,
    )
    .bind(run_id.uuid())
    .bind(step_slug)
    .fetch_optional(&mut **tx)
    .await?;

    row.map(TryInto::try_into).transpose().map_err(Into::into)
}
