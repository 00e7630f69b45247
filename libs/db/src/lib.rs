//! Database layer for Foreman
//!
//! Provides PostgreSQL connection pooling, embedded migrations, row types,
//! and repository implementations.

pub mod pool;
pub mod repo;
pub mod rows;

pub use pool::{create_pool, run_migrations, DatabaseConfig, DatabaseError};
pub use repo::{
    NewRun, NewWorkflow, PgRunRepository, PgStepRepository, PgStoryRepository,
    PgWorkflowRepository, RunDetail, RunFilter, RunRepository, StepRepository, StoryRepository,
    WorkflowRepository, WorkflowUpdate,
};
