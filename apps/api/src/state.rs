//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;

use foreman_common::Settings;
use foreman_db::{PgRunRepository, PgStepRepository, PgStoryRepository, PgWorkflowRepository};
use foreman_engine::{EventHub, Reaper, ReaperConfig, Scheduler};

/// Everything the handlers need, cloned per request
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub settings: Arc<Settings>,
    pub hub: Arc<EventHub>,
    pub scheduler: Arc<Scheduler>,
    pub workflows: Arc<PgWorkflowRepository>,
    pub runs: Arc<PgRunRepository>,
    pub steps: Arc<PgStepRepository>,
    pub stories: Arc<PgStoryRepository>,
}

impl AppState {
    /// Wire up the singletons from a pool and settings
    #[must_use]
    pub fn new(pool: PgPool, settings: Settings) -> Self {
        let hub = Arc::new(EventHub::new());
        let scheduler = Arc::new(
            Scheduler::new(pool.clone(), Arc::clone(&hub))
                .with_max_stories(settings.max_stories_per_run),
        );

        Self {
            workflows: Arc::new(PgWorkflowRepository::new(pool.clone())),
            runs: Arc::new(PgRunRepository::new(pool.clone())),
            steps: Arc::new(PgStepRepository::new(pool.clone())),
            stories: Arc::new(PgStoryRepository::new(pool.clone())),
            settings: Arc::new(settings),
            hub,
            scheduler,
            pool,
        }
    }

    /// Build the reaper matching this state's settings
    #[must_use]
    pub fn reaper(&self) -> Reaper {
        let config = ReaperConfig {
            interval: std::time::Duration::from_secs(self.settings.reaper_interval_seconds),
            abandoned_step_age_minutes: self.settings.abandoned_step_age_minutes,
            retry_cooldown_minutes: self.settings.retry_cooldown_minutes,
            run_timeout_minutes: self.settings.run_timeout_minutes,
        };
        Reaper::new(self.pool.clone(), Arc::clone(&self.hub), config)
    }
}
