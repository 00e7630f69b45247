//! Approval controller
//!
//! `type = approval` steps park in `awaiting_approval` (via a generic status
//! patch from their agent) until a human verdict arrives. Approval completes
//! the step and advances the pipeline; rejection fails the step and the run
//! with no retry.

use sqlx::Postgres;

use foreman_domain::{RunStatus, Step, StepId, StepStatus, StoryId};

use crate::error::EngineError;
use crate::events::{names, EventEnvelope};
use crate::scheduler::{
    advance_pipeline, cas_step_update, fail_run, fetch_run, fetch_step, lock_run, run_payload,
    step_payload, CompletionOutcome, ClearStory, Outbox, Scheduler, StepPatch,
};

impl Scheduler {
    /// Approve a step awaiting approval.
    ///
    /// Only valid from `awaiting_approval`. The synthetic output records the
    /// note, the run's awaiting flags clear when no sibling step is still
    /// parked, and the pipeline advances as on normal completion.
    pub async fn approve_step(
        &self,
        step_id: StepId,
        note: &str,
    ) -> Result<CompletionOutcome, EngineError> {
        let mut tx = self.pool().begin().await?;

        let step = fetch_step(&mut tx, step_id)
            .await?
            .ok_or(EngineError::NotFound("step"))?;
        lock_run(&mut tx, step.run_id).await?;
        let step = fetch_step(&mut tx, step_id)
            .await?
            .ok_or(EngineError::NotFound("step"))?;
        let run = fetch_run(&mut tx, step.run_id)
            .await?
            .ok_or(EngineError::NotFound("run"))?;

        if step.status != StepStatus::AwaitingApproval {
            return Err(EngineError::conflict(
                "step is not awaiting approval",
                Some(step.status.as_str().to_string()),
            ));
        }

        let output = format!("APPROVED: {note}");
        cas_step_update(
            &mut tx,
            step.id,
            StepStatus::AwaitingApproval,
            StepStatus::Completed,
            Some(&output),
            ClearStory::Keep,
        )
        .await?;

        refresh_awaiting_flags(&mut tx, &step).await?;

        let mut outbox = Outbox::for_run(&run);
        outbox.push(EventEnvelope::workflow(
            names::STEP_COMPLETED,
            step_payload(&step, StepStatus::Completed),
        ));
        let run_completed = advance_pipeline(&mut tx, &run, &mut outbox).await?;

        tx.commit().await?;
        let step = self.reload_step(step_id).await?;
        self.flush(outbox).await;

        Ok(CompletionOutcome {
            step,
            step_completed: true,
            run_completed,
        })
    }

    /// Reject a step awaiting approval. Fails the step and the run; approval
    /// rejections are never retried.
    pub async fn reject_step(
        &self,
        step_id: StepId,
        reason: &str,
    ) -> Result<CompletionOutcome, EngineError> {
        let mut tx = self.pool().begin().await?;

        let step = fetch_step(&mut tx, step_id)
            .await?
            .ok_or(EngineError::NotFound("step"))?;
        lock_run(&mut tx, step.run_id).await?;
        let step = fetch_step(&mut tx, step_id)
            .await?
            .ok_or(EngineError::NotFound("step"))?;
        let run = fetch_run(&mut tx, step.run_id)
            .await?
            .ok_or(EngineError::NotFound("run"))?;

        if step.status != StepStatus::AwaitingApproval {
            return Err(EngineError::conflict(
                "step is not awaiting approval",
                Some(step.status.as_str().to_string()),
            ));
        }

        let output = format!("REJECTED: {reason}");
        cas_step_update(
            &mut tx,
            step.id,
            StepStatus::AwaitingApproval,
            StepStatus::Failed,
            Some(&output),
            ClearStory::Keep,
        )
        .await?;

        refresh_awaiting_flags(&mut tx, &step).await?;
        fail_run(&mut tx, run.id).await?;

        let mut outbox = Outbox::for_run(&run);
        outbox.push(EventEnvelope::workflow(
            names::STEP_FAILED,
            step_payload(&step, StepStatus::Failed),
        ));
        outbox.push_terminal(EventEnvelope::workflow(
            names::RUN_FAILED,
            run_payload(&run, RunStatus::Failed),
        ));

        tx.commit().await?;
        let step = self.reload_step(step_id).await?;
        self.flush(outbox).await;

        Ok(CompletionOutcome {
            step,
            step_completed: false,
            run_completed: false,
        })
    }

    /// Generic step patch: status (matrix-checked), output, current story.
    ///
    /// Entering `awaiting_approval` raises the run's awaiting flags and
    /// publishes the matching event; leaving it recomputes them.
    pub async fn patch_step(
        &self,
        step_id: StepId,
        patch: StepPatch,
    ) -> Result<Step, EngineError> {
        let mut tx = self.pool().begin().await?;

        let step = fetch_step(&mut tx, step_id)
            .await?
            .ok_or(EngineError::NotFound("step"))?;
        lock_run(&mut tx, step.run_id).await?;
        let step = fetch_step(&mut tx, step_id)
            .await?
            .ok_or(EngineError::NotFound("step"))?;
        let run = fetch_run(&mut tx, step.run_id)
            .await?
            .ok_or(EngineError::NotFound("run"))?;

        let mut outbox = Outbox::for_run(&run);

        if let Some(status) = patch.status {
            step.status.check_transition(status)?;

            sqlx::query(
                "UPDATE workflow_steps SET status = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(step.id.uuid())
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?;

            if status == StepStatus::AwaitingApproval {
                sqlx::query(
                    r#"
                    UPDATE workflow_runs
                    SET awaiting_approval = TRUE,
                        awaiting_approval_since = COALESCE(awaiting_approval_since, NOW()),
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(run.id.uuid())
                .execute(&mut *tx)
                .await?;

                outbox.push(EventEnvelope::workflow(
                    names::STEP_AWAITING_APPROVAL,
                    step_payload(&step, StepStatus::AwaitingApproval),
                ));
            } else if step.status == StepStatus::AwaitingApproval {
                refresh_awaiting_flags(&mut tx, &step).await?;
            }
        }

        if let Some(output) = &patch.output {
            sqlx::query(
                "UPDATE workflow_steps SET output = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(step.id.uuid())
            .bind(output)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(story) = patch.current_story_id {
            sqlx::query(
                "UPDATE workflow_steps SET current_story_id = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(step.id.uuid())
            .bind(story.map(StoryId::uuid))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        let step = self.reload_step(step_id).await?;
        self.flush(outbox).await;

        Ok(step)
    }
}

/// Recompute the run's awaiting flags after `step` left `awaiting_approval`
async fn refresh_awaiting_flags(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    step: &Step,
) -> Result<(), EngineError> {
    let still_awaiting: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM workflow_steps
        WHERE run_id = $1 AND id != $2 AND status = 'awaiting_approval'
        "#,
    )
    .bind(step.run_id.uuid())
    .bind(step.id.uuid())
    .fetch_one(&mut **tx)
    .await?;

    if still_awaiting == 0 {
        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET awaiting_approval = FALSE, awaiting_approval_since = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(step.run_id.uuid())
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}
