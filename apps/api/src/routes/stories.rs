//! Per-run story endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use foreman_db::StoryRepository;
use foreman_domain::{RunId, Story, StoryId, StorySeed, StoryStatus};

use crate::extractors::CurrentUser;
use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
struct CreateStoryRequest {
    id: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "acceptanceCriteria")]
    acceptance_criteria: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PatchStoryRequest {
    #[serde(default)]
    status: Option<StoryStatus>,
    #[serde(default)]
    output: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompleteStoryRequest {
    #[serde(default)]
    output: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FailStoryRequest {
    error: String,
    #[serde(default)]
    output: Option<String>,
}

#[derive(Debug, Serialize)]
struct StoryFailResponse {
    will_retry: bool,
    data: Story,
}

/// Load a story and confirm it belongs to the run in the path
async fn story_in_run(
    state: &AppState,
    run_id: RunId,
    story_id: StoryId,
) -> Result<Story, ApiError> {
    state
        .stories
        .find_by_id(&story_id)
        .await?
        .filter(|s| s.run_id == run_id)
        .ok_or_else(|| ApiError::NotFound("story".to_string()))
}

async fn list_stories(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(run_id): Path<RunId>,
) -> Result<Json<Vec<Story>>, ApiError> {
    Ok(Json(state.stories.list_by_run(&run_id).await?))
}

async fn get_story(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path((run_id, story_id)): Path<(RunId, StoryId)>,
) -> Result<Json<Story>, ApiError> {
    Ok(Json(story_in_run(&state, run_id, story_id).await?))
}

async fn create_story(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(run_id): Path<RunId>,
    Json(request): Json<CreateStoryRequest>,
) -> Result<(StatusCode, Json<Story>), ApiError> {
    if request.id.trim().is_empty() || request.title.trim().is_empty() {
        return Err(ApiError::bad_request("story id and title are required"));
    }

    let story = state
        .scheduler
        .add_story(
            run_id,
            &StorySeed {
                id: request.id,
                title: request.title,
                description: request.description,
                acceptance_criteria: request.acceptance_criteria,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(story)))
}

async fn patch_story(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path((run_id, story_id)): Path<(RunId, StoryId)>,
    Json(request): Json<PatchStoryRequest>,
) -> Result<Json<Story>, ApiError> {
    story_in_run(&state, run_id, story_id).await?;

    let story = state
        .scheduler
        .patch_story(story_id, request.status, request.output.as_deref())
        .await?;

    Ok(Json(story))
}

async fn start_story(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path((run_id, story_id)): Path<(RunId, StoryId)>,
) -> Result<Json<Story>, ApiError> {
    story_in_run(&state, run_id, story_id).await?;
    Ok(Json(state.scheduler.start_story(story_id).await?))
}

async fn complete_story(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path((run_id, story_id)): Path<(RunId, StoryId)>,
    Json(request): Json<CompleteStoryRequest>,
) -> Result<Json<Story>, ApiError> {
    story_in_run(&state, run_id, story_id).await?;
    Ok(Json(
        state
            .scheduler
            .complete_story(story_id, request.output.as_deref())
            .await?,
    ))
}

async fn fail_story(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path((run_id, story_id)): Path<(RunId, StoryId)>,
    Json(request): Json<FailStoryRequest>,
) -> Result<Json<StoryFailResponse>, ApiError> {
    story_in_run(&state, run_id, story_id).await?;

    let outcome = state
        .scheduler
        .fail_story(story_id, &request.error, request.output.as_deref())
        .await?;

    Ok(Json(StoryFailResponse {
        will_retry: outcome.will_retry,
        data: outcome.story,
    }))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_stories).post(create_story))
        .route("/{story_id}", get(get_story).patch(patch_story))
        .route("/{story_id}/start", post(start_story))
        .route("/{story_id}/complete", post(complete_story))
        .route("/{story_id}/fail", post(fail_story))
}
