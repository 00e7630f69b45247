//! Workflow definition endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use foreman_db::{NewWorkflow, WorkflowRepository, WorkflowUpdate};
use foreman_domain::{StepConfig, Workflow, WorkflowId};
use foreman_engine::import_yaml;

use crate::extractors::CurrentUser;
use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
struct ListQuery {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateWorkflowRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    steps: Vec<StepConfig>,
}

#[derive(Debug, Deserialize)]
struct UpdateWorkflowRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    steps: Option<Vec<StepConfig>>,
}

#[derive(Debug, Deserialize)]
struct ImportYamlRequest {
    yaml: String,
}

async fn list_workflows(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Workflow>>, ApiError> {
    let workflows = state.workflows.list(query.name.as_deref()).await?;
    Ok(Json(workflows))
}

async fn get_workflow(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(workflow_id): Path<WorkflowId>,
) -> Result<Json<Workflow>, ApiError> {
    state
        .workflows
        .find_by_id(&workflow_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("workflow".to_string()))
}

async fn create_workflow(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateWorkflowRequest>,
) -> Result<(StatusCode, Json<Workflow>), ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("workflow name must not be empty"));
    }

    let workflow = state
        .workflows
        .create(&NewWorkflow {
            name: request.name,
            description: request.description,
            steps: request.steps,
            created_by: user.user_id(),
        })
        .await?;

    Ok((StatusCode::CREATED, Json(workflow)))
}

async fn update_workflow(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(workflow_id): Path<WorkflowId>,
    Json(request): Json<UpdateWorkflowRequest>,
) -> Result<Json<Workflow>, ApiError> {
    let workflow = state
        .workflows
        .update(
            &workflow_id,
            &WorkflowUpdate {
                name: request.name,
                description: request.description,
                steps: request.steps,
            },
        )
        .await?;

    Ok(Json(workflow))
}

async fn delete_workflow(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(workflow_id): Path<WorkflowId>,
) -> Result<StatusCode, ApiError> {
    state.workflows.delete(&workflow_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn import_workflow_yaml(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<ImportYamlRequest>,
) -> Result<(StatusCode, Json<Workflow>), ApiError> {
    let imported = import_yaml(&request.yaml)?;

    let workflow = state
        .workflows
        .create(&NewWorkflow {
            name: imported.name,
            description: imported.description,
            steps: imported.steps,
            created_by: user.user_id(),
        })
        .await?;

    Ok((StatusCode::CREATED, Json(workflow)))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workflows).post(create_workflow))
        .route(
            "/{workflow_id}",
            get(get_workflow)
                .patch(update_workflow)
                .delete(delete_workflow),
        )
        .route("/import-yaml", post(import_workflow_yaml))
}
