//! Step scheduler
//!
//! The central state machine: atomic step claiming under concurrent pollers,
//! completion with pipeline advancement, and retry bookkeeping.
//!
//! Claiming never takes a pessimistic lock on the step row. The conditional
//! `UPDATE ... WHERE id = $1 AND status = 'pending'` is the sole admission
//! mechanism; a racing poller sees zero affected rows and retries or walks
//! away. Loop claims additionally lock the run row to serialize story
//! bookkeeping.

use std::sync::Arc;

use sqlx::{PgConnection, PgPool};

use foreman_db::rows::{context_to_json, RunRow, StepRow, StoryRow};
use foreman_domain::{
    Run, RunId, RunStatus, Step, StepId, StepStatus, StepType, Story, StoryId, StorySeed,
    StoryStatus,
};

use crate::error::EngineError;
use crate::events::{names, EventEnvelope, EventHub};
use crate::notify::Notifier;
use crate::template::{self, DEFAULT_MAX_STORIES};

/// How many times a claim retries after losing the conditional update
const CLAIM_ATTEMPTS: usize = 3;

/// Work handed to an agent by a successful claim
#[derive(Debug, Clone)]
pub struct ClaimedWork {
    pub step_id: StepId,
    pub run_id: RunId,
    pub resolved_input: String,
    pub story_id: Option<StoryId>,
}

/// Result of completing a step through the pipeline
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub step: Step,
    pub step_completed: bool,
    pub run_completed: bool,
}

/// Result of reporting a step failure
#[derive(Debug, Clone)]
pub struct FailOutcome {
    pub step: Step,
    pub will_retry: bool,
}

/// Generic step patch used by the approval workflow and test harnesses
#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub status: Option<StepStatus>,
    pub output: Option<String>,
    /// `Some(None)` clears the field
    pub current_story_id: Option<Option<StoryId>>,
}

/// Events held until the surrounding transaction commits
pub(crate) struct Outbox {
    owner: foreman_domain::UserId,
    notify_url: Option<String>,
    events: Vec<EventEnvelope>,
    /// Indexes of events that should also hit the run's webhook
    webhook: Vec<usize>,
}

impl Outbox {
    pub(crate) fn for_run(run: &Run) -> Self {
        Self {
            owner: run.created_by,
            notify_url: run.notify_url.clone(),
            events: Vec::new(),
            webhook: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, event: EventEnvelope) {
        self.events.push(event);
    }

    /// Push an event that is also delivered to the run's notify URL
    pub(crate) fn push_terminal(&mut self, event: EventEnvelope) {
        self.webhook.push(self.events.len());
        self.events.push(event);
    }
}

/// The scheduler hands work to agents and applies their results
pub struct Scheduler {
    pool: PgPool,
    hub: Arc<EventHub>,
    notifier: Notifier,
    max_stories: usize,
}

enum ClaimAttempt {
    Claimed(ClaimedWork, Outbox),
    /// A loop step ran out of stories and completed eagerly; look again
    LoopExhausted(Outbox),
    /// Lost the conditional update to a racing poller
    Lost,
    NoWork,
}

impl Scheduler {
    #[must_use]
    pub fn new(pool: PgPool, hub: Arc<EventHub>) -> Self {
        Self {
            pool,
            hub,
            notifier: Notifier::new(),
            max_stories: DEFAULT_MAX_STORIES,
        }
    }

    #[must_use]
    pub fn with_max_stories(mut self, max_stories: usize) -> Self {
        self.max_stories = max_stories;
        self
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn max_stories(&self) -> usize {
        self.max_stories
    }

    /// Publish held events now that their transaction has committed
    pub(crate) async fn flush(&self, outbox: Outbox) {
        for (index, event) in outbox.events.iter().enumerate() {
            if outbox.webhook.contains(&index) {
                if let Some(url) = &outbox.notify_url {
                    self.notifier.notify(url, event);
                }
            }
            self.hub.publish(outbox.owner, event.clone()).await;
        }
    }

    // =========================================================================
    // Claiming
    // =========================================================================

    /// Find and claim the next pending step for an agent.
    ///
    /// Returns `None` when no work is available. Under concurrent pollers at
    /// most one caller wins any given step; losers retry internally and then
    /// report no work.
    pub async fn claim_by_agent(
        &self,
        agent_id: &str,
    ) -> Result<Option<ClaimedWork>, EngineError> {
        for _ in 0..CLAIM_ATTEMPTS {
            match self.try_claim_by_agent(agent_id).await? {
                ClaimAttempt::Claimed(work, outbox) => {
                    self.flush(outbox).await;
                    return Ok(Some(work));
                }
                ClaimAttempt::LoopExhausted(outbox) => {
                    self.flush(outbox).await;
                    // the exhausted loop step left the queue; look again
                }
                ClaimAttempt::Lost => {}
                ClaimAttempt::NoWork => return Ok(None),
            }
        }
        Ok(None)
    }

    async fn try_claim_by_agent(&self, agent_id: &str) -> Result<ClaimAttempt, EngineError> {
        let mut tx = self.pool.begin().await?;

        let candidate = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT s.id, s.run_id, s.step_id, s.agent_id, s.step_index, s.input_template,
                   s.expects, s.step_type, s.loop_config, s.status, s.output, s.retry_count,
                   s.max_retries, s.current_story_id, s.created_at, s.updated_at
            FROM workflow_steps s
            JOIN workflow_runs r ON r.id = s.run_id
            WHERE s.status = 'pending' AND s.agent_id = $1 AND r.status = 'running'
            ORDER BY s.created_at, s.step_index
            LIMIT 1
            "#,
        )
        .bind(agent_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = candidate else {
            return Ok(ClaimAttempt::NoWork);
        };
        let step: Step = row.try_into()?;

        let run = fetch_run(&mut tx, step.run_id)
            .await?
            .ok_or(EngineError::NotFound("run"))?;

        if step.step_type == StepType::Loop {
            return self.claim_loop_story(tx, step, run).await;
        }

        if !cas_step_to_running(&mut tx, step.id, None).await? {
            return Ok(ClaimAttempt::Lost);
        }

        let resolved_input = template::resolve(&step.input_template, &run.context);
        tx.commit().await?;

        let mut outbox = Outbox::for_run(&run);
        outbox.push(EventEnvelope::workflow(
            names::STEP_CLAIMED,
            step_payload(&step, StepStatus::Running),
        ));

        Ok(ClaimAttempt::Claimed(
            ClaimedWork {
                step_id: step.id,
                run_id: step.run_id,
                resolved_input,
                story_id: None,
            },
            outbox,
        ))
    }

    /// Claim the next pending story for a loop step, taking over the
    /// caller's transaction. Locks the run row so story bookkeeping is
    /// serialized.
    async fn claim_loop_story(
        &self,
        mut tx: sqlx::Transaction<'_, sqlx::Postgres>,
        step: Step,
        run: Run,
    ) -> Result<ClaimAttempt, EngineError> {
        lock_run(&mut tx, run.id).await?;

        let story_row = sqlx::query_as::<_, StoryRow>(
            r#"
            SELECT id, run_id, story_index, story_id, title, description, acceptance_criteria,
                   status, output, retry_count, max_retries, created_at, updated_at
            FROM run_stories
            WHERE run_id = $1 AND status = 'pending'
            ORDER BY story_index
            LIMIT 1
            "#,
        )
        .bind(run.id.uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(story_row) = story_row else {
            // No pending stories. If the planner produced some and all are
            // done, the loop step completes eagerly under the run lock;
            // otherwise the step stays pending until stories appear.
            let (total, open) = story_counts(&mut tx, run.id).await?;
            if total > 0 && open == 0 {
                if !cas_step_update(
                    &mut tx,
                    step.id,
                    StepStatus::Pending,
                    StepStatus::Completed,
                    None,
                    ClearStory::Clear,
                )
                .await?
                {
                    return Ok(ClaimAttempt::Lost);
                }

                let mut outbox = Outbox::for_run(&run);
                outbox.push(EventEnvelope::workflow(
                    names::STEP_COMPLETED,
                    step_payload(&step, StepStatus::Completed),
                ));
                advance_pipeline(&mut tx, &run, &mut outbox).await?;
                tx.commit().await?;
                return Ok(ClaimAttempt::LoopExhausted(outbox));
            }
            return Ok(ClaimAttempt::NoWork);
        };
        let story: Story = story_row.try_into()?;

        if !cas_story_update(&mut tx, story.id, StoryStatus::Pending, StoryStatus::Running, None)
            .await?
        {
            return Ok(ClaimAttempt::Lost);
        }
        if !cas_step_to_running(&mut tx, step.id, Some(story.id)).await? {
            return Ok(ClaimAttempt::Lost);
        }

        // Augment the context with the story being iterated
        let mut ctx = run.context.clone();
        ctx.insert("current_story".to_string(), template::format_story(&story));
        ctx.insert("current_story_id".to_string(), story.story_id.clone());
        let resolved_input = template::resolve(&step.input_template, &ctx);

        tx.commit().await?;

        let mut outbox = Outbox::for_run(&run);
        outbox.push(EventEnvelope::workflow(
            names::STEP_CLAIMED,
            step_payload(&step, StepStatus::Running),
        ));

        Ok(ClaimAttempt::Claimed(
            ClaimedWork {
                step_id: step.id,
                run_id: step.run_id,
                resolved_input,
                story_id: Some(story.id),
            },
            outbox,
        ))
    }

    /// Run-scoped claim with full precondition reporting.
    ///
    /// Unlike `claim_by_agent`, the caller names the step, so every
    /// precondition failure is surfaced instead of skipping to other work.
    pub async fn claim_step(
        &self,
        run_id: RunId,
        step_id: StepId,
        agent_id: Option<&str>,
    ) -> Result<ClaimedWork, EngineError> {
        let mut tx = self.pool.begin().await?;

        let step = fetch_step(&mut tx, step_id)
            .await?
            .filter(|s| s.run_id == run_id)
            .ok_or(EngineError::NotFound("step"))?;
        let run = fetch_run(&mut tx, run_id)
            .await?
            .ok_or(EngineError::NotFound("run"))?;

        if run.status != RunStatus::Running {
            return Err(EngineError::conflict(
                "run is not running",
                Some(run.status.as_str().to_string()),
            ));
        }

        if let Some(agent) = agent_id {
            if agent != step.agent_id {
                return Err(EngineError::ForbiddenAgent {
                    expected: step.agent_id.clone(),
                    got: agent.to_string(),
                });
            }
        }

        match step.status {
            StepStatus::Pending => {}
            StepStatus::Waiting => {
                return Err(EngineError::conflict(
                    "previous steps are not complete",
                    Some("waiting".to_string()),
                ));
            }
            other => {
                return Err(EngineError::ConcurrencyLoss {
                    current_status: other.as_str().to_string(),
                });
            }
        }

        if step.step_type == StepType::Loop {
            return match self.claim_loop_story(tx, step, run).await? {
                ClaimAttempt::Claimed(work, outbox) => {
                    self.flush(outbox).await;
                    Ok(work)
                }
                ClaimAttempt::LoopExhausted(outbox) => {
                    self.flush(outbox).await;
                    Err(EngineError::conflict(
                        "loop step has no pending stories",
                        Some("completed".to_string()),
                    ))
                }
                ClaimAttempt::Lost => Err(EngineError::ConcurrencyLoss {
                    current_status: "running".to_string(),
                }),
                ClaimAttempt::NoWork => Err(EngineError::conflict(
                    "loop step has no pending stories",
                    Some("pending".to_string()),
                )),
            };
        }

        if !cas_step_to_running(&mut tx, step.id, None).await? {
            let current = fetch_step(&mut tx, step.id)
                .await?
                .map_or_else(|| "unknown".to_string(), |s| s.status.as_str().to_string());
            return Err(EngineError::ConcurrencyLoss {
                current_status: current,
            });
        }

        let resolved_input = template::resolve(&step.input_template, &run.context);
        tx.commit().await?;

        let mut outbox = Outbox::for_run(&run);
        outbox.push(EventEnvelope::workflow(
            names::STEP_CLAIMED,
            step_payload(&step, StepStatus::Running),
        ));
        self.flush(outbox).await;

        Ok(ClaimedWork {
            step_id: step.id,
            run_id,
            resolved_input,
            story_id: None,
        })
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Apply an agent's output: merge context, persist stories, complete the
    /// step, and advance the pipeline. Loop steps and verify partners route
    /// through the loop controller instead of completing outright.
    pub async fn complete_with_pipeline(
        &self,
        step_id: StepId,
        output: &str,
    ) -> Result<CompletionOutcome, EngineError> {
        let mut tx = self.pool.begin().await?;

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

        // A non-loop step carrying a story is a verify partner finishing its
        // pass; a loop step carrying a story finished one iteration.
        if step.step_type != StepType::Loop && step.current_story_id.is_some() {
            if let Some(loop_step) = crate::loops::find_verify_parent(&mut tx, &step).await? {
                return self
                    .finish_verify_pass(tx, step, loop_step, run, output)
                    .await;
            }
        }
        if step.step_type == StepType::Loop && step.current_story_id.is_some() {
            return self.finish_loop_iteration(tx, step, run, output).await;
        }

        step.status.check_transition(StepStatus::Completed)?;

        // Merge KEY: value lines into the run context
        let merged = template::merge_context(output, &run.context);
        sqlx::query("UPDATE workflow_runs SET context = $2, updated_at = NOW() WHERE id = $1")
            .bind(run.id.uuid())
            .bind(context_to_json(&merged))
            .execute(&mut *tx)
            .await?;

        // Planner outputs may carry a story block for a downstream loop step
        if let Some(seeds) = template::parse_stories_json(output, self.max_stories)? {
            insert_stories(&mut tx, run.id, &seeds).await?;
        }

        if !cas_step_update(
            &mut tx,
            step.id,
            step.status,
            StepStatus::Completed,
            Some(output),
            ClearStory::Keep,
        )
        .await?
        {
            let current = fetch_step(&mut tx, step.id)
                .await?
                .map_or_else(|| "unknown".to_string(), |s| s.status.as_str().to_string());
            return Err(EngineError::ConcurrencyLoss {
                current_status: current,
            });
        }

        let mut outbox = Outbox::for_run(&run);
        outbox.push(EventEnvelope::workflow(
            names::STEP_COMPLETED,
            step_payload(&step, StepStatus::Completed),
        ));
        let run_completed = advance_pipeline(&mut tx, &run, &mut outbox).await?;

        tx.commit().await?;

        let completed_step = self.reload_step(step.id).await?;
        self.flush(outbox).await;

        Ok(CompletionOutcome {
            step: completed_step,
            step_completed: true,
            run_completed,
        })
    }

    // =========================================================================
    // Failure
    // =========================================================================

    /// Record a step failure, retrying while the budget allows.
    pub async fn fail_step(
        &self,
        step_id: StepId,
        error: &str,
        output: Option<&str>,
    ) -> Result<FailOutcome, EngineError> {
        let mut tx = self.pool.begin().await?;

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

        if step.status.is_terminal() {
            return Err(EngineError::conflict(
                "step already finished",
                Some(step.status.as_str().to_string()),
            ));
        }

        let outcome = if step.can_retry() {
            step.status.check_transition(StepStatus::Pending)?;
            let retry = step.retry_count + 1;
            let synthetic = serde_json::json!({
                "error": error,
                "output": output,
                "retry": retry,
            })
            .to_string();

            sqlx::query(
                r#"
                UPDATE workflow_steps
                SET status = 'pending', retry_count = $2, output = $3,
                    current_story_id = NULL, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(step.id.uuid())
            .bind(retry)
            .bind(&synthetic)
            .execute(&mut *tx)
            .await?;

            // Release the story the step was iterating, if any
            if let Some(story_id) = step.current_story_id {
                cas_story_update(
                    &mut tx,
                    story_id,
                    StoryStatus::Running,
                    StoryStatus::Pending,
                    None,
                )
                .await?;
            }

            tx.commit().await?;
            FailOutcome {
                step: self.reload_step(step.id).await?,
                will_retry: true,
            }
        } else {
            step.status.check_transition(StepStatus::Failed)?;
            let synthetic = serde_json::json!({
                "error": error,
                "output": output,
                "retries_exceeded": true,
            })
            .to_string();

            sqlx::query(
                r#"
                UPDATE workflow_steps
                SET status = 'failed', output = $2, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(step.id.uuid())
            .bind(&synthetic)
            .execute(&mut *tx)
            .await?;

            if let Some(story_id) = step.current_story_id {
                cas_story_update(
                    &mut tx,
                    story_id,
                    StoryStatus::Running,
                    StoryStatus::Failed,
                    None,
                )
                .await?;
            }

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
            let failed_step = self.reload_step(step.id).await?;
            self.flush(outbox).await;

            FailOutcome {
                step: failed_step,
                will_retry: false,
            }
        };

        Ok(outcome)
    }

    pub(crate) async fn reload_step(&self, step_id: StepId) -> Result<Step, EngineError> {
        let mut conn = self.pool.acquire().await?;
        fetch_step(&mut conn, step_id)
            .await?
            .ok_or(EngineError::NotFound("step"))
    }
}

// =============================================================================
// Shared query helpers
// =============================================================================

pub(crate) enum ClearStory {
    Clear,
    Keep,
}

pub(crate) async fn fetch_step(
    conn: &mut PgConnection,
    id: StepId,
) -> Result<Option<Step>, EngineError> {
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
    .fetch_optional(conn)
    .await?;

    row.map(TryInto::try_into).transpose().map_err(Into::into)
}

pub(crate) async fn fetch_run(
    conn: &mut PgConnection,
    id: RunId,
) -> Result<Option<Run>, EngineError> {
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
    .fetch_optional(conn)
    .await?;

    row.map(TryInto::try_into).transpose().map_err(Into::into)
}

pub(crate) async fn fetch_story(
    conn: &mut PgConnection,
    id: StoryId,
) -> Result<Option<Story>, EngineError> {
    let row = sqlx::query_as::<_, StoryRow>(
        r#"
        SELECT id, run_id, story_index, story_id, title, description, acceptance_criteria,
               status, output, retry_count, max_retries, created_at, updated_at
        FROM run_stories
        WHERE id = $1
        "#,
    )
    .bind(id.uuid())
    .fetch_optional(conn)
    .await?;

    row.map(TryInto::try_into).transpose().map_err(Into::into)
}

/// Lock the run row to serialize multi-row bookkeeping
pub(crate) async fn lock_run(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: RunId,
) -> Result<(), EngineError> {
    sqlx::query("SELECT id FROM workflow_runs WHERE id = $1 FOR UPDATE")
        .bind(id.uuid())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// The claim CAS: pending -> running, optionally binding a story
pub(crate) async fn cas_step_to_running(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: StepId,
    story: Option<StoryId>,
) -> Result<bool, EngineError> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_steps
        SET status = 'running',
            current_story_id = COALESCE($2, current_story_id),
            updated_at = NOW()
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(id.uuid())
    .bind(story.map(StoryId::uuid))
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Conditional step update scoped on the expected current status
pub(crate) async fn cas_step_update(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: StepId,
    from: StepStatus,
    to: StepStatus,
    output: Option<&str>,
    story: ClearStory,
) -> Result<bool, EngineError> {
    let clear_story = matches!(story, ClearStory::Clear);
    let result = sqlx::query(
        r#"
        UPDATE workflow_steps
        SET status = $3,
            output = COALESCE($4, output),
            current_story_id = CASE WHEN $5 THEN NULL ELSE current_story_id END,
            updated_at = NOW()
        WHERE id = $1 AND status = $2
        "#,
    )
    .bind(id.uuid())
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(output)
    .bind(clear_story)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Conditional story update scoped on the expected current status
pub(crate) async fn cas_story_update(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: StoryId,
    from: StoryStatus,
    to: StoryStatus,
    output: Option<&str>,
) -> Result<bool, EngineError> {
    let result = sqlx::query(
        r#"
        UPDATE run_stories
        SET status = $3,
            output = COALESCE($4, output),
            updated_at = NOW()
        WHERE id = $1 AND status = $2
        "#,
    )
    .bind(id.uuid())
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(output)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Counts of (total, not-yet-terminal) stories for a run
pub(crate) async fn story_counts(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    run_id: RunId,
) -> Result<(i64, i64), EngineError> {
    let row: (i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*),
               COUNT(*) FILTER (WHERE status IN ('pending', 'running', 'verifying'))
        FROM run_stories
        WHERE run_id = $1
        "#,
    )
    .bind(run_id.uuid())
    .fetch_one(&mut **tx)
    .await?;

    Ok(row)
}

/// Insert parsed story seeds, continuing the run's story index sequence
pub(crate) async fn insert_stories(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    run_id: RunId,
    seeds: &[StorySeed],
) -> Result<(), EngineError> {
    let base: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM run_stories WHERE run_id = $1")
            .bind(run_id.uuid())
            .fetch_one(&mut **tx)
            .await?;

    for (offset, seed) in seeds.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let story = Story::from_seed(run_id, seed, (base as i32) + (offset as i32));

        sqlx::query(
            r#"
            INSERT INTO run_stories (id, run_id, story_index, story_id, title, description,
                                     acceptance_criteria, status, max_retries)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8)
            "#,
        )
        .bind(story.id.uuid())
        .bind(run_id.uuid())
        .bind(story.story_index)
        .bind(&story.story_id)
        .bind(&story.title)
        .bind(&story.description)
        .bind(&story.acceptance_criteria)
        .bind(story.max_retries)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .is_some_and(|db| db.constraint() == Some("run_stories_run_id_story_id_key"))
            {
                EngineError::Validation(format!(
                    "story id '{}' already exists in this run",
                    story.story_id
                ))
            } else {
                EngineError::Database(e)
            }
        })?;
    }

    Ok(())
}

/// Flip the lowest waiting step to pending, or complete the run.
///
/// Returns true when the run completed. Appends the matching events to the
/// outbox.
pub(crate) async fn advance_pipeline(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    run: &Run,
    outbox: &mut Outbox,
) -> Result<bool, EngineError> {
    let next = sqlx::query_as::<_, StepRow>(
        r#"
        SELECT id, run_id, step_id, agent_id, step_index, input_template, expects,
               step_type, loop_config, status, output, retry_count, max_retries,
               current_story_id, created_at, updated_at
        FROM workflow_steps
        WHERE run_id = $1 AND status = 'waiting'
        ORDER BY step_index
        LIMIT 1
        "#,
    )
    .bind(run.id.uuid())
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(row) = next {
        let next_step: Step = row.try_into()?;
        cas_step_update(
            tx,
            next_step.id,
            StepStatus::Waiting,
            StepStatus::Pending,
            None,
            ClearStory::Keep,
        )
        .await?;
        return Ok(false);
    }

    sqlx::query(
        r#"
        UPDATE workflow_runs
        SET status = 'completed', completed_at = NOW(), updated_at = NOW()
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(run.id.uuid())
    .execute(&mut **tx)
    .await?;

    outbox.push_terminal(EventEnvelope::workflow(
        names::RUN_COMPLETED,
        run_payload(run, RunStatus::Completed),
    ));

    Ok(true)
}

/// Mark a run failed
pub(crate) async fn fail_run(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    run_id: RunId,
) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        UPDATE workflow_runs
        SET status = 'failed', completed_at = NOW(), updated_at = NOW()
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(run_id.uuid())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(crate) fn step_payload(step: &Step, status: StepStatus) -> serde_json::Value {
    serde_json::json!({
        "run_id": step.run_id,
        "step_id": step.id,
        "step": step.step_id,
        "agent_id": step.agent_id,
        "status": status.as_str(),
    })
}

pub(crate) fn run_payload(run: &Run, status: RunStatus) -> serde_json::Value {
    serde_json::json!({
        "run_id": run.id,
        "workflow_id": run.workflow_id,
        "task_id": run.task_id,
        "status": status.as_str(),
    })
}

pub(crate) fn story_payload(story: &Story, status: StoryStatus) -> serde_json::Value {
    serde_json::json!({
        "run_id": story.run_id,
        "story_id": story.id,
        "story": story.story_id,
        "status": status.as_str(),
    })
}
