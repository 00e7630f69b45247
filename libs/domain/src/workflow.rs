//! Workflow definitions and step configuration
//!
//! A workflow is a named, ordered list of step configs. Step configs are
//! validated on create/update and again by the YAML importer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::enums::StepType;
use crate::ids::{UserId, WorkflowId};

/// Errors raised by step-config validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowValidationError {
    #[error("workflow must have at least one step")]
    NoSteps,
    #[error("step {index}: missing required field '{field}'")]
    MissingField { index: usize, field: &'static str },
    #[error("duplicate step_id '{0}' within workflow")]
    DuplicateStepId(String),
    #[error("step '{step_id}': loop steps require loop_config")]
    MissingLoopConfig { step_id: String },
    #[error("step '{step_id}': loop_config.over must be \"stories\", got '{over}'")]
    UnsupportedLoopTarget { step_id: String, over: String },
    #[error("step '{step_id}': verify_step '{verify_step}' does not name a step in this workflow")]
    UnknownVerifyStep {
        step_id: String,
        verify_step: String,
    },
}

/// Loop configuration carried by `type = loop` steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// What the loop iterates over; only "stories" is supported
    pub over: String,
    /// Completion policy; informational, only "all_done" is produced
    #[serde(default = "default_completion")]
    pub completion: String,
    /// Run the verify step after each story
    #[serde(default)]
    pub verify_each: bool,
    /// step_id of the verify partner, required when verify_each is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_step: Option<String>,
}

fn default_completion() -> String {
    "all_done".to_string()
}

impl LoopConfig {
    /// Default iteration target
    pub const OVER_STORIES: &'static str = "stories";
}

/// One step of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Identifier unique within the workflow (e.g. "plan", "dev")
    pub step_id: String,
    /// Optional human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Slug of the agent that executes this step
    pub agent_id: String,
    /// Input template with `{{var}}` placeholders
    pub input_template: String,
    /// Expected output marker, informational
    pub expects: String,
    /// Step kind; defaults to single
    #[serde(default, rename = "type")]
    pub step_type: StepType,
    /// Present only when step_type is Loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_config: Option<LoopConfig>,
    /// 0-based position in the sequence
    #[serde(default)]
    pub position: usize,
}

/// A named, ordered workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<StepConfig>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validate an ordered list of step configs.
///
/// Checks required fields, step_id uniqueness, and loop config shape.
pub fn validate_step_configs(steps: &[StepConfig]) -> Result<(), WorkflowValidationError> {
    if steps.is_empty() {
        return Err(WorkflowValidationError::NoSteps);
    }

    let mut seen = std::collections::HashSet::new();
    for (index, step) in steps.iter().enumerate() {
        for (field, value) in [
            ("step_id", &step.step_id),
            ("agent_id", &step.agent_id),
            ("input_template", &step.input_template),
            ("expects", &step.expects),
        ] {
            if value.trim().is_empty() {
                return Err(WorkflowValidationError::MissingField { index, field });
            }
        }

        if !seen.insert(step.step_id.as_str()) {
            return Err(WorkflowValidationError::DuplicateStepId(
                step.step_id.clone(),
            ));
        }

        if step.step_type == StepType::Loop {
            let config = step.loop_config.as_ref().ok_or_else(|| {
                WorkflowValidationError::MissingLoopConfig {
                    step_id: step.step_id.clone(),
                }
            })?;
            if config.over != LoopConfig::OVER_STORIES {
                return Err(WorkflowValidationError::UnsupportedLoopTarget {
                    step_id: step.step_id.clone(),
                    over: config.over.clone(),
                });
            }
        }
    }

    // verify_step must name a real step
    for step in steps {
        if let Some(config) = &step.loop_config {
            if let Some(verify_step) = &config.verify_step {
                if !steps.iter().any(|s| &s.step_id == verify_step) {
                    return Err(WorkflowValidationError::UnknownVerifyStep {
                        step_id: step.step_id.clone(),
                        verify_step: verify_step.clone(),
                    });
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(step_id: &str) -> StepConfig {
        StepConfig {
            step_id: step_id.to_string(),
            name: None,
            agent_id: "planner".to_string(),
            input_template: "Plan: {{task}}".to_string(),
            expects: "done".to_string(),
            step_type: StepType::Single,
            loop_config: None,
            position: 0,
        }
    }

    #[test]
    fn test_valid_steps_pass() {
        let steps = vec![step("plan"), step("dev")];
        assert!(validate_step_configs(&steps).is_ok());
    }

    #[test]
    fn test_empty_workflow_rejected() {
        assert_eq!(
            validate_step_configs(&[]),
            Err(WorkflowValidationError::NoSteps)
        );
    }

    #[test]
    fn test_missing_agent_id_rejected() {
        let mut s = step("plan");
        s.agent_id = "  ".to_string();
        let err = validate_step_configs(&[s]).unwrap_err();
        assert!(matches!(
            err,
            WorkflowValidationError::MissingField {
                field: "agent_id",
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_step_id_rejected() {
        let steps = vec![step("plan"), step("plan")];
        assert_eq!(
            validate_step_configs(&steps),
            Err(WorkflowValidationError::DuplicateStepId("plan".to_string()))
        );
    }

    #[test]
    fn test_loop_without_config_rejected() {
        let mut s = step("stories");
        s.step_type = StepType::Loop;
        let err = validate_step_configs(&[s]).unwrap_err();
        assert!(matches!(
            err,
            WorkflowValidationError::MissingLoopConfig { .. }
        ));
    }

    #[test]
    fn test_loop_over_must_be_stories() {
        let mut s = step("stories");
        s.step_type = StepType::Loop;
        s.loop_config = Some(LoopConfig {
            over: "tickets".to_string(),
            completion: "all_done".to_string(),
            verify_each: false,
            verify_step: None,
        });
        let err = validate_step_configs(&[s]).unwrap_err();
        assert!(matches!(
            err,
            WorkflowValidationError::UnsupportedLoopTarget { .. }
        ));
    }

    #[test]
    fn test_verify_step_must_exist() {
        let mut looped = step("stories");
        looped.step_type = StepType::Loop;
        looped.loop_config = Some(LoopConfig {
            over: "stories".to_string(),
            completion: "all_done".to_string(),
            verify_each: true,
            verify_step: Some("missing".to_string()),
        });
        let err = validate_step_configs(&[step("plan"), looped]).unwrap_err();
        assert!(matches!(
            err,
            WorkflowValidationError::UnknownVerifyStep { .. }
        ));
    }

    #[test]
    fn test_step_config_type_defaults_to_single() {
        let json = r#"{
            "step_id": "plan",
            "agent_id": "planner",
            "input_template": "Plan: {{task}}",
            "expects": "done"
        }"#;
        let config: StepConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.step_type, StepType::Single);
        assert_eq!(config.position, 0);
    }
}
