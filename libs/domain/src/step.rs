//! Step model: a materialized instance of a step config bound to a run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{StepStatus, StepType};
use crate::ids::{RunId, StepId, StoryId};
use crate::workflow::{LoopConfig, StepConfig};

/// Default retry budget for steps and stories
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// A materialized step row owned by a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub run_id: RunId,
    /// Config identifier, unique within the run (e.g. "plan")
    pub step_id: String,
    pub agent_id: String,
    pub step_index: i32,
    pub input_template: String,
    pub expects: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub loop_config: Option<LoopConfig>,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Set while a loop step (or its verify partner) is iterating a story
    #[serde(default)]
    pub current_story_id: Option<StoryId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Step {
    /// Materialize a step row from a workflow step config.
    ///
    /// Step 0 starts pending, every later step starts waiting.
    #[must_use]
    pub fn materialize(run_id: RunId, config: &StepConfig, step_index: i32) -> Self {
        let now = Utc::now();
        Self {
            id: StepId::new(),
            run_id,
            step_id: config.step_id.clone(),
            agent_id: config.agent_id.clone(),
            step_index,
            input_template: config.input_template.clone(),
            expects: config.expects.clone(),
            step_type: config.step_type,
            loop_config: config.loop_config.clone(),
            status: if step_index == 0 {
                StepStatus::Pending
            } else {
                StepStatus::Waiting
            },
            output: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            current_story_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when this step's loop config runs a verify pass per story
    #[must_use]
    pub fn verifies_each_story(&self) -> bool {
        self.step_type == StepType::Loop
            && self
                .loop_config
                .as_ref()
                .is_some_and(|c| c.verify_each && c.verify_step.is_some())
    }

    /// Whether the retry budget still allows another attempt
    #[must_use]
    pub const fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::StepType;

    fn config(step_id: &str) -> StepConfig {
        StepConfig {
            step_id: step_id.to_string(),
            name: None,
            agent_id: "dev".to_string(),
            input_template: "Do: {{task}}".to_string(),
            expects: "done".to_string(),
            step_type: StepType::Single,
            loop_config: None,
            position: 0,
        }
    }

    #[test]
    fn test_first_step_materializes_pending() {
        let run_id = RunId::new();
        let step = Step::materialize(run_id, &config("plan"), 0);
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.retry_count, 0);
        assert_eq!(step.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_later_steps_materialize_waiting() {
        let run_id = RunId::new();
        let step = Step::materialize(run_id, &config("dev"), 1);
        assert_eq!(step.status, StepStatus::Waiting);
    }

    #[test]
    fn test_verifies_each_story() {
        let mut step = Step::materialize(RunId::new(), &config("stories"), 1);
        assert!(!step.verifies_each_story());

        step.step_type = StepType::Loop;
        step.loop_config = Some(LoopConfig {
            over: "stories".to_string(),
            completion: "all_done".to_string(),
            verify_each: true,
            verify_step: Some("verify".to_string()),
        });
        assert!(step.verifies_each_story());

        // verify_each without a partner step does not count
        step.loop_config.as_mut().unwrap().verify_step = None;
        assert!(!step.verifies_each_story());
    }

    #[test]
    fn test_can_retry_respects_budget() {
        let mut step = Step::materialize(RunId::new(), &config("plan"), 0);
        assert!(step.can_retry());
        step.retry_count = step.max_retries;
        assert!(!step.can_retry());
    }
}
