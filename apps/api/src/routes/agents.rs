//! Agent polling endpoints
//!
//! The verbs agents use without any run knowledge: poll for work anywhere,
//! report results, and trigger abandoned-step cleanup.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use foreman_domain::StepId;

use super::steps::{agent_from_request, ClaimRequest, ClaimResponse};
use crate::extractors::CurrentUser;
use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
struct CompleteWithPipelineRequest {
    output: String,
}

#[derive(Debug, Serialize)]
struct CompleteWithPipelineResponse {
    step_completed: bool,
    run_completed: bool,
}

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    #[serde(default)]
    max_age_minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    cleaned_count: u64,
}

async fn claim_by_agent(
    State(state): State<AppState>,
    _user: CurrentUser,
    headers: HeaderMap,
    body: Option<Json<ClaimRequest>>,
) -> Result<Json<ClaimResponse>, ApiError> {
    let agent = agent_from_request(&headers, body.as_deref())
        .ok_or_else(|| ApiError::bad_request("agent_id is required"))?;

    let claimed = state.scheduler.claim_by_agent(&agent).await?;

    Ok(Json(claimed.map_or(
        ClaimResponse {
            found: false,
            step_id: None,
            run_id: None,
            resolved_input: None,
            story_id: None,
        },
        |work| ClaimResponse {
            found: true,
            step_id: Some(work.step_id),
            run_id: Some(work.run_id),
            resolved_input: Some(work.resolved_input),
            story_id: work.story_id,
        },
    )))
}

async fn complete_with_pipeline(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(step_id): Path<StepId>,
    Json(request): Json<CompleteWithPipelineRequest>,
) -> Result<Json<CompleteWithPipelineResponse>, ApiError> {
    let outcome = state
        .scheduler
        .complete_with_pipeline(step_id, &request.output)
        .await?;

    Ok(Json(CompleteWithPipelineResponse {
        step_completed: outcome.step_completed,
        run_completed: outcome.run_completed,
    }))
}

async fn cleanup_abandoned(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<CleanupQuery>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let max_age = query
        .max_age_minutes
        .unwrap_or(state.settings.abandoned_step_age_minutes);
    if max_age <= 0 {
        return Err(ApiError::bad_request("max_age_minutes must be positive"));
    }

    let cleaned_count = state.reaper().cleanup_abandoned(max_age).await?;

    Ok(Json(CleanupResponse { cleaned_count }))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/claim-by-agent", post(claim_by_agent))
        .route("/{step_id}/complete-with-pipeline", post(complete_with_pipeline))
        .route("/cleanup-abandoned", post(cleanup_abandoned))
}
