//! Background maintenance task
//!
//! Three passes on a fixed interval, each transactional per row:
//! abandoned running steps reset to pending, failed steps with remaining
//! retry budget re-queued after a cooldown, and long-running runs timed out.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use foreman_db::rows::{RunRow, StepRow};
use foreman_domain::{Run, RunStatus, Step, StepStatus};

use crate::error::EngineError;
use crate::events::{names, EventEnvelope, EventHub};
use crate::notify::Notifier;
use crate::scheduler::{run_payload, step_payload};

/// Reaper thresholds; all defaults match the reference deployment
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub abandoned_step_age_minutes: i64,
    pub retry_cooldown_minutes: i64,
    pub run_timeout_minutes: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            abandoned_step_age_minutes: 15,
            retry_cooldown_minutes: 5,
            run_timeout_minutes: 60,
        }
    }
}

/// What one reaper pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperReport {
    pub abandoned_reset: u64,
    pub failed_retried: u64,
    pub runs_timed_out: u64,
}

/// The periodic maintenance task
pub struct Reaper {
    pool: PgPool,
    hub: Arc<EventHub>,
    notifier: Notifier,
    config: ReaperConfig,
}

impl Reaper {
    #[must_use]
    pub fn new(pool: PgPool, hub: Arc<EventHub>, config: ReaperConfig) -> Self {
        Self {
            pool,
            hub,
            notifier: Notifier::new(),
            config,
        }
    }

    /// Run forever on the configured interval. Intended for `tokio::spawn`.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match self.run_once().await {
                Ok(report) if report != ReaperReport::default() => {
                    tracing::info!(
                        abandoned = report.abandoned_reset,
                        retried = report.failed_retried,
                        timed_out = report.runs_timed_out,
                        "reaper pass finished"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "reaper pass failed");
                }
            }
        }
    }

    /// One full maintenance pass
    pub async fn run_once(&self) -> Result<ReaperReport, EngineError> {
        let abandoned_reset = self
            .cleanup_abandoned(self.config.abandoned_step_age_minutes)
            .await?;
        let failed_retried = self.retry_failed_steps().await?;
        let runs_timed_out = self.timeout_runs().await?;

        Ok(ReaperReport {
            abandoned_reset,
            failed_retried,
            runs_timed_out,
        })
    }

    /// Reset running steps nobody has touched within the age threshold.
    ///
    /// Relies on `updated_at` being touched on every claim and status
    /// change. Also releases any story the step was iterating.
    pub async fn cleanup_abandoned(&self, max_age_minutes: i64) -> Result<u64, EngineError> {
        let candidates = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            SELECT {cols}
            FROM workflow_steps
            WHERE status = 'running'
              AND updated_at < NOW() - make_interval(mins => $1::int)
            "#,
            cols = foreman_db::rows::STEP_COLUMNS,
        ))
        .bind(max_age_minutes)
        .fetch_all(&self.pool)
        .await?;

        let mut reset = 0u64;
        for row in candidates {
            let step: Step = row.try_into()?;
            let mut tx = self.pool.begin().await?;

            let output = format!("RESET: abandoned >{max_age_minutes} min");
            let result = sqlx::query(
                r#"
                UPDATE workflow_steps
                SET status = 'pending', output = $2, current_story_id = NULL, updated_at = NOW()
                WHERE id = $1 AND status = 'running'
                  AND updated_at < NOW() - make_interval(mins => $3::int)
                "#,
            )
            .bind(step.id.uuid())
            .bind(&output)
            .bind(max_age_minutes)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                if let Some(story_id) = step.current_story_id {
                    sqlx::query(
                        r#"
                        UPDATE run_stories
                        SET status = 'pending', updated_at = NOW()
                        WHERE id = $1 AND status = 'running'
                        "#,
                    )
                    .bind(story_id.uuid())
                    .execute(&mut *tx)
                    .await?;
                }
                reset += 1;
            }

            tx.commit().await?;
        }

        if reset > 0 {
            tracing::info!(count = reset, "reset abandoned steps");
        }
        Ok(reset)
    }

    /// Re-queue failed steps that still have retry budget after the cooldown
    async fn retry_failed_steps(&self) -> Result<u64, EngineError> {
        let candidates = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            SELECT {cols}
            FROM workflow_steps
            WHERE status = 'failed'
              AND retry_count < max_retries
              AND updated_at < NOW() - make_interval(mins => $1::int)
            "#,
            cols = foreman_db::rows::STEP_COLUMNS,
        ))
        .bind(self.config.retry_cooldown_minutes)
        .fetch_all(&self.pool)
        .await?;

        let mut retried = 0u64;
        for row in candidates {
            let step: Step = row.try_into()?;
            let mut tx = self.pool.begin().await?;

            let result = sqlx::query(
                r#"
                UPDATE workflow_steps
                SET status = 'pending', retry_count = retry_count + 1, updated_at = NOW()
                WHERE id = $1 AND status = 'failed' AND retry_count < max_retries
                "#,
            )
            .bind(step.id.uuid())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            retried += result.rows_affected();
        }

        if retried > 0 {
            tracing::info!(count = retried, "re-queued failed steps after cooldown");
        }
        Ok(retried)
    }

    /// Fail runs that have been running past the timeout, with their steps
    async fn timeout_runs(&self) -> Result<u64, EngineError> {
        let candidates = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            SELECT {cols}
            FROM workflow_runs
            WHERE status = 'running'
              AND updated_at < NOW() - make_interval(mins => $1::int)
            "#,
            cols = foreman_db::rows::RUN_COLUMNS,
        ))
        .bind(self.config.run_timeout_minutes)
        .fetch_all(&self.pool)
        .await?;

        let mut timed_out = 0u64;
        for row in candidates {
            let run: Run = row.try_into()?;
            let mut tx = self.pool.begin().await?;

            let result = sqlx::query(
                r#"
                UPDATE workflow_runs
                SET status = 'failed', completed_at = NOW(), updated_at = NOW()
                WHERE id = $1 AND status = 'running'
                  AND updated_at < NOW() - make_interval(mins => $2::int)
                "#,
            )
            .bind(run.id.uuid())
            .bind(self.config.run_timeout_minutes)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                tx.commit().await?;
                continue;
            }

            let running_steps = sqlx::query_as::<_, StepRow>(&format!(
                r#"
                SELECT {cols}
                FROM workflow_steps
                WHERE run_id = $1 AND status = 'running'
                "#,
                cols = foreman_db::rows::STEP_COLUMNS,
            ))
            .bind(run.id.uuid())
            .fetch_all(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE workflow_steps
                SET status = 'failed', output = 'RUN_TIMEOUT', updated_at = NOW()
                WHERE run_id = $1 AND status = 'running'
                "#,
            )
            .bind(run.id.uuid())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            timed_out += 1;

            // Publish what the normal failure path would have
            for step_row in running_steps {
                let step: Step = step_row.try_into()?;
                self.hub
                    .publish(
                        run.created_by,
                        EventEnvelope::workflow(
                            names::STEP_FAILED,
                            step_payload(&step, StepStatus::Failed),
                        ),
                    )
                    .await;
            }
            let failed = EventEnvelope::workflow(names::RUN_FAILED, run_payload(&run, RunStatus::Failed));
            if let Some(url) = &run.notify_url {
                self.notifier.notify(url, &failed);
            }
            self.hub.publish(run.created_by, failed).await;

            tracing::warn!(run_id = %run.id, "run timed out");
        }

        Ok(timed_out)
    }
}
