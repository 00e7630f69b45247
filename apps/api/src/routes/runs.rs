//! Run endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use foreman_db::{NewRun, RunFilter, RunRepository, WorkflowRepository};
use foreman_domain::{Run, RunContext, RunId, RunStatus, Step, Story, TaskId, WorkflowId};
use foreman_engine::events::{names, EventEnvelope};

use crate::extractors::CurrentUser;
use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    task_id: Option<TaskId>,
    #[serde(default)]
    status: Option<RunStatus>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CreateRunRequest {
    workflow_id: WorkflowId,
    task: String,
    #[serde(default)]
    task_id: Option<TaskId>,
    #[serde(default)]
    context: Option<RunContext>,
    #[serde(default)]
    notify_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateRunStatusRequest {
    status: RunStatus,
}

/// A run with its materialized steps and stories embedded
#[derive(Debug, Serialize)]
struct RunDetailBody {
    #[serde(flatten)]
    run: Run,
    steps: Vec<Step>,
    stories: Vec<Story>,
}

async fn list_runs(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Run>>, ApiError> {
    let runs = state
        .runs
        .list(&RunFilter {
            task_id: query.task_id,
            status: query.status,
            limit: query.limit,
            offset: query.offset,
        })
        .await?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(run_id): Path<RunId>,
) -> Result<Json<RunDetailBody>, ApiError> {
    let detail = state
        .runs
        .find_detail(&run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("run".to_string()))?;

    Ok(Json(RunDetailBody {
        run: detail.run,
        steps: detail.steps,
        stories: detail.stories,
    }))
}

async fn create_run(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<RunDetailBody>), ApiError> {
    if request.task.trim().is_empty() {
        return Err(ApiError::bad_request("task must not be empty"));
    }

    let workflow = state
        .workflows
        .find_by_id(&request.workflow_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("workflow".to_string()))?;

    let detail = state
        .runs
        .create(
            &workflow,
            &NewRun {
                workflow_id: workflow.id,
                task: request.task,
                task_id: request.task_id,
                context: request.context,
                notify_url: request.notify_url,
                created_by: user.user_id(),
            },
        )
        .await?;

    state
        .hub
        .publish(
            detail.run.created_by,
            EventEnvelope::workflow(
                names::RUN_CREATED,
                serde_json::json!({
                    "run_id": detail.run.id,
                    "workflow_id": detail.run.workflow_id,
                    "task_id": detail.run.task_id,
                    "status": detail.run.status,
                }),
            ),
        )
        .await;

    Ok((
        StatusCode::CREATED,
        Json(RunDetailBody {
            run: detail.run,
            steps: detail.steps,
            stories: detail.stories,
        }),
    ))
}

async fn update_run_status(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(run_id): Path<RunId>,
    Json(request): Json<UpdateRunStatusRequest>,
) -> Result<Json<Run>, ApiError> {
    let run = state.runs.update_status(&run_id, request.status).await?;
    Ok(Json(run))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_runs).post(create_run))
        .route("/{run_id}", get(get_run))
        .route("/{run_id}/status", patch(update_run_status))
        .nest("/{run_id}/steps", super::steps::routes())
        .nest("/{run_id}/stories", super::stories::routes())
}
