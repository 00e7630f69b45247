//! Per-operation repository errors
//!
//! Each repository operation has its own error type for precise error handling.

use foreman_domain::{RunId, WorkflowId, WorkflowValidationError};
use thiserror::Error;

/// A persisted row failed to decode into the domain model
#[derive(Debug, Error)]
#[error("corrupt row: {0}")]
pub struct RowDecodeError(pub String);

// =============================================================================
// Workflow Repository Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum CreateWorkflowError {
    #[error("workflow name already exists: {0}")]
    NameExists(String),
    #[error(transparent)]
    Validation(#[from] WorkflowValidationError),
    #[error(transparent)]
    Decode(#[from] RowDecodeError),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum FindWorkflowError {
    #[error(transparent)]
    Decode(#[from] RowDecodeError),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum UpdateWorkflowError {
    #[error("workflow not found: {0}")]
    NotFound(WorkflowId),
    #[error("workflow name already exists: {0}")]
    NameExists(String),
    #[error(transparent)]
    Validation(#[from] WorkflowValidationError),
    #[error(transparent)]
    Decode(#[from] RowDecodeError),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum DeleteWorkflowError {
    #[error("workflow not found: {0}")]
    NotFound(WorkflowId),
    #[error("workflow has {0} active run(s)")]
    ActiveRuns(i64),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

// =============================================================================
// Run Repository Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum CreateRunError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),
    #[error(transparent)]
    Decode(#[from] RowDecodeError),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum FindRunError {
    #[error(transparent)]
    Decode(#[from] RowDecodeError),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum UpdateRunError {
    #[error("run not found: {0}")]
    NotFound(RunId),
    #[error(transparent)]
    Decode(#[from] RowDecodeError),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

// =============================================================================
// Step / Story Repository Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum FindStepError {
    #[error(transparent)]
    Decode(#[from] RowDecodeError),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum FindStoryError {
    #[error(transparent)]
    Decode(#[from] RowDecodeError),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}
