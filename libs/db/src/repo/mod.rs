//! Repository layer

pub mod errors;
pub mod pg_run;
pub mod pg_step;
pub mod pg_story;
pub mod pg_workflow;
pub mod traits;

pub use pg_run::PgRunRepository;
pub use pg_step::PgStepRepository;
pub use pg_story::PgStoryRepository;
pub use pg_workflow::PgWorkflowRepository;
pub use traits::{
    NewRun, NewWorkflow, RunDetail, RunFilter, RunRepository, StepRepository, StoryRepository,
    WorkflowRepository, WorkflowUpdate,
};
