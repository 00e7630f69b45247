//! API error handling
//!
//! Maps engine and repository errors onto the wire contract: JSON bodies of
//! `{error, current_status?}` with the status code per error kind.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use foreman_db::repo::errors::{
    CreateRunError, CreateWorkflowError, DeleteWorkflowError, FindRunError, FindStepError,
    FindStoryError, FindWorkflowError, UpdateRunError, UpdateWorkflowError,
};
use foreman_engine::{EngineError, ImportError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{message}")]
    BadRequest {
        message: String,
        current_status: Option<String>,
    },

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{message}")]
    Conflict {
        message: String,
        current_status: Option<String>,
    },

    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
            current_status: None,
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            current_status: None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_status: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, current_status) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            ApiError::BadRequest { current_status, .. } => {
                (StatusCode::BAD_REQUEST, current_status.clone())
            }
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, None),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, None),
            ApiError::Conflict { current_status, .. } => {
                (StatusCode::CONFLICT, current_status.clone())
            }
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };

        let body = Json(ErrorBody {
            error: self.to_string(),
            current_status,
        });

        (status, body).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(entity) => Self::NotFound(entity.to_string()),
            EngineError::Validation(message) => Self::bad_request(message),
            EngineError::StateConflict {
                message,
                current_status,
            } => Self::BadRequest {
                message,
                current_status,
            },
            EngineError::ConcurrencyLoss { current_status } => Self::Conflict {
                message: "step is not claimable".to_string(),
                current_status: Some(current_status),
            },
            EngineError::InvalidTransition(t) => Self::bad_request(t.to_string()),
            EngineError::ForbiddenAgent { expected, got } => {
                Self::Forbidden(format!("step is assigned to '{expected}', not '{got}'"))
            }
            EngineError::Stories(e) => Self::bad_request(e.to_string()),
            EngineError::Decode(e) => Self::Internal(e.to_string()),
            EngineError::Database(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<ImportError> for ApiError {
    fn from(e: ImportError) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl From<CreateWorkflowError> for ApiError {
    fn from(e: CreateWorkflowError) -> Self {
        match e {
            CreateWorkflowError::NameExists(name) => {
                Self::conflict(format!("workflow name already exists: {name}"))
            }
            CreateWorkflowError::Validation(v) => Self::bad_request(v.to_string()),
            CreateWorkflowError::Decode(d) => Self::Internal(d.to_string()),
            CreateWorkflowError::Database(d) => Self::Internal(d.to_string()),
        }
    }
}

impl From<FindWorkflowError> for ApiError {
    fn from(e: FindWorkflowError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<UpdateWorkflowError> for ApiError {
    fn from(e: UpdateWorkflowError) -> Self {
        match e {
            UpdateWorkflowError::NotFound(_) => Self::NotFound("workflow".to_string()),
            UpdateWorkflowError::NameExists(name) => {
                Self::conflict(format!("workflow name already exists: {name}"))
            }
            UpdateWorkflowError::Validation(v) => Self::bad_request(v.to_string()),
            UpdateWorkflowError::Decode(d) => Self::Internal(d.to_string()),
            UpdateWorkflowError::Database(d) => Self::Internal(d.to_string()),
        }
    }
}

impl From<DeleteWorkflowError> for ApiError {
    fn from(e: DeleteWorkflowError) -> Self {
        match e {
            DeleteWorkflowError::NotFound(_) => Self::NotFound("workflow".to_string()),
            DeleteWorkflowError::ActiveRuns(count) => {
                Self::bad_request(format!("workflow has {count} active run(s)"))
            }
            DeleteWorkflowError::Database(d) => Self::Internal(d.to_string()),
        }
    }
}

impl From<CreateRunError> for ApiError {
    fn from(e: CreateRunError) -> Self {
        match e {
            CreateRunError::WorkflowNotFound(_) => Self::NotFound("workflow".to_string()),
            CreateRunError::Decode(d) => Self::Internal(d.to_string()),
            CreateRunError::Database(d) => Self::Internal(d.to_string()),
        }
    }
}

impl From<FindRunError> for ApiError {
    fn from(e: FindRunError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<UpdateRunError> for ApiError {
    fn from(e: UpdateRunError) -> Self {
        match e {
            UpdateRunError::NotFound(_) => Self::NotFound("run".to_string()),
            UpdateRunError::Decode(d) => Self::Internal(d.to_string()),
            UpdateRunError::Database(d) => Self::Internal(d.to_string()),
        }
    }
}

impl From<FindStepError> for ApiError {
    fn from(e: FindStepError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<FindStoryError> for ApiError {
    fn from(e: FindStoryError) -> Self {
        Self::Internal(e.to_string())
    }
}
