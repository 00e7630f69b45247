//! Workflow execution engine for Foreman
//!
//! The scheduler hands steps to polling agents with an atomic compare-and-set
//! claim, applies their results (context merge, story materialization,
//! pipeline advancement), and drives the loop and approval sub-machines.
//! The reaper recovers abandoned work; the event hub fans lifecycle events
//! out to connected clients.

pub mod approval;
pub mod error;
pub mod events;
pub mod importer;
pub mod loops;
pub mod notify;
pub mod reaper;
pub mod scheduler;
pub mod template;

pub use error::EngineError;
pub use events::{EventChannel, EventEnvelope, EventHub};
pub use importer::{import_yaml, ImportError, ImportedWorkflow};
pub use loops::StoryFailOutcome;
pub use notify::Notifier;
pub use reaper::{Reaper, ReaperConfig, ReaperReport};
pub use scheduler::{ClaimedWork, CompletionOutcome, FailOutcome, Scheduler, StepPatch};
pub use template::{
    format_story, merge_context, parse_stories_json, resolve, safe_json_parse, StoriesError,
    DEFAULT_MAX_STORIES,
};
