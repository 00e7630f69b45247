//! Core domain model for the Foreman orchestrator
//!
//! Pure data types shared by every other crate: prefixed IDs, status enums
//! with transition matrices, and the Workflow/Run/Step/Story models.

pub mod enums;
pub mod ids;
pub mod run;
pub mod step;
pub mod story;
pub mod workflow;

pub use enums::{
    InvalidTransition, ParseEnumError, RunStatus, StepStatus, StepType, StoryStatus,
};
pub use ids::{InvalidId, RunId, StepId, StoryId, TaskId, UserId, WorkflowId};
pub use run::{Run, RunContext};
pub use step::{Step, DEFAULT_MAX_RETRIES};
pub use story::{Story, StorySeed};
pub use workflow::{
    validate_step_configs, LoopConfig, StepConfig, Workflow, WorkflowValidationError,
};
