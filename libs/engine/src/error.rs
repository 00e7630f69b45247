//! Engine errors
//!
//! One error enum for the scheduler verbs; the API layer maps variants onto
//! HTTP statuses.

use foreman_domain::InvalidTransition;
use foreman_db::repo::errors::RowDecodeError;
use thiserror::Error;

use crate::template::StoriesError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Entity missing
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Missing/invalid field, bad enum
    #[error("validation error: {0}")]
    Validation(String),

    /// Entity exists but is in the wrong state for the operation
    #[error("{message}")]
    StateConflict {
        message: String,
        current_status: Option<String>,
    },

    /// Conditional update affected zero rows on claim
    #[error("claim lost: step already taken")]
    ConcurrencyLoss { current_status: String },

    /// Status transition outside the matrix
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Claim by the wrong agent
    #[error("step is assigned to agent '{expected}', not '{got}'")]
    ForbiddenAgent { expected: String, got: String },

    /// Planner output carried a malformed STORIES_JSON block
    #[error(transparent)]
    Stories(#[from] StoriesError),

    #[error(transparent)]
    Decode(#[from] RowDecodeError),

    #[error("database error")]
    Database(#[source] sqlx::Error),
}

impl EngineError {
    /// Shorthand for state-conflict errors with a current status attached
    pub fn conflict(message: impl Into<String>, current_status: Option<String>) -> Self {
        Self::StateConflict {
            message: message.into(),
            current_status,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e)
    }
}
