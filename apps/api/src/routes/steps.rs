//! Per-run step endpoints

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use foreman_db::StepRepository;
use foreman_domain::{RunId, Step, StepId, StepStatus, StoryId};
use foreman_engine::StepPatch;

use crate::extractors::CurrentUser;
use crate::{ApiError, AppState};

pub const AGENT_HEADER: &str = "x-agent-name";

#[derive(Debug, Default, Deserialize)]
pub struct ClaimRequest {
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    output: String,
}

#[derive(Debug, Deserialize)]
struct FailRequest {
    error: String,
    #[serde(default)]
    output: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApproveRequest {
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RejectRequest {
    reason: String,
}

#[derive(Debug, Deserialize)]
struct PatchStepRequest {
    #[serde(default)]
    status: Option<StepStatus>,
    #[serde(default)]
    output: Option<String>,
    /// `null` clears the binding, absence leaves it alone
    #[serde(default)]
    current_story_id: Option<Option<StoryId>>,
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_id: Option<StoryId>,
}

#[derive(Debug, Serialize)]
struct CompleteResponse {
    data: Step,
    run_completed: bool,
}

#[derive(Debug, Serialize)]
struct FailResponse {
    will_retry: bool,
    data: Step,
}

/// Agent identity from the request body or the `X-Agent-Name` header
pub fn agent_from_request(headers: &HeaderMap, body: Option<&ClaimRequest>) -> Option<String> {
    body.and_then(|b| b.agent_id.clone()).or_else(|| {
        headers
            .get(AGENT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
    })
}

/// Load a step and confirm it belongs to the run in the path
async fn step_in_run(state: &AppState, run_id: RunId, step_id: StepId) -> Result<Step, ApiError> {
    state
        .steps
        .find_by_id(&step_id)
        .await?
        .filter(|s| s.run_id == run_id)
        .ok_or_else(|| ApiError::NotFound("step".to_string()))
}

async fn list_steps(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(run_id): Path<RunId>,
) -> Result<Json<Vec<Step>>, ApiError> {
    Ok(Json(state.steps.list_by_run(&run_id).await?))
}

async fn list_pending_steps(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(run_id): Path<RunId>,
) -> Result<Json<Vec<Step>>, ApiError> {
    Ok(Json(state.steps.list_pending_by_run(&run_id).await?))
}

async fn get_step(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path((run_id, step_id)): Path<(RunId, StepId)>,
) -> Result<Json<Step>, ApiError> {
    Ok(Json(step_in_run(&state, run_id, step_id).await?))
}

async fn claim_step(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path((run_id, step_id)): Path<(RunId, StepId)>,
    headers: HeaderMap,
    body: Option<Json<ClaimRequest>>,
) -> Result<Json<ClaimResponse>, ApiError> {
    let agent = agent_from_request(&headers, body.as_deref());

    let work = state
        .scheduler
        .claim_step(run_id, step_id, agent.as_deref())
        .await?;

    Ok(Json(ClaimResponse {
        found: true,
        step_id: Some(work.step_id),
        run_id: Some(work.run_id),
        resolved_input: Some(work.resolved_input),
        story_id: work.story_id,
    }))
}

async fn complete_step(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path((run_id, step_id)): Path<(RunId, StepId)>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, ApiError> {
    step_in_run(&state, run_id, step_id).await?;

    let outcome = state
        .scheduler
        .complete_with_pipeline(step_id, &request.output)
        .await?;

    Ok(Json(CompleteResponse {
        data: outcome.step,
        run_completed: outcome.run_completed,
    }))
}

async fn fail_step(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path((run_id, step_id)): Path<(RunId, StepId)>,
    Json(request): Json<FailRequest>,
) -> Result<Json<FailResponse>, ApiError> {
    step_in_run(&state, run_id, step_id).await?;

    let outcome = state
        .scheduler
        .fail_step(step_id, &request.error, request.output.as_deref())
        .await?;

    Ok(Json(FailResponse {
        will_retry: outcome.will_retry,
        data: outcome.step,
    }))
}

async fn approve_step(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path((run_id, step_id)): Path<(RunId, StepId)>,
    body: Option<Json<ApproveRequest>>,
) -> Result<Json<CompleteResponse>, ApiError> {
    step_in_run(&state, run_id, step_id).await?;

    let note = body
        .and_then(|b| b.note.clone())
        .unwrap_or_default();
    let outcome = state.scheduler.approve_step(step_id, &note).await?;

    Ok(Json(CompleteResponse {
        data: outcome.step,
        run_completed: outcome.run_completed,
    }))
}

async fn reject_step(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path((run_id, step_id)): Path<(RunId, StepId)>,
    Json(request): Json<RejectRequest>,
) -> Result<Json<CompleteResponse>, ApiError> {
    step_in_run(&state, run_id, step_id).await?;

    let outcome = state.scheduler.reject_step(step_id, &request.reason).await?;

    Ok(Json(CompleteResponse {
        data: outcome.step,
        run_completed: outcome.run_completed,
    }))
}

async fn patch_step(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path((run_id, step_id)): Path<(RunId, StepId)>,
    Json(request): Json<PatchStepRequest>,
) -> Result<Json<Step>, ApiError> {
    step_in_run(&state, run_id, step_id).await?;

    let step = state
        .scheduler
        .patch_step(
            step_id,
            StepPatch {
                status: request.status,
                output: request.output,
                current_story_id: request.current_story_id,
            },
        )
        .await?;

    Ok(Json(step))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_steps))
        .route("/pending", get(list_pending_steps))
        .route("/{step_id}", get(get_step).patch(patch_step))
        .route("/{step_id}/claim", post(claim_step))
        .route("/{step_id}/complete", post(complete_step))
        .route("/{step_id}/fail", post(fail_step))
        .route("/{step_id}/approve", post(approve_step))
        .route("/{step_id}/reject", post(reject_step))
}
