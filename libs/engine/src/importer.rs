//! YAML workflow importer
//!
//! Parses a workflow specification document into the internal model,
//! applying defaults and the same step-config validation the workflow
//! store uses.

use serde::Deserialize;
use thiserror::Error;

use foreman_domain::{
    validate_step_configs, LoopConfig, StepConfig, StepType, WorkflowValidationError,
};

/// Errors that can occur during workflow import
#[derive(Debug, Error)]
pub enum ImportError {
    /// YAML parsing failed
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yml::Error),

    /// Step configs failed validation
    #[error(transparent)]
    Validation(#[from] WorkflowValidationError),

    #[error("workflow name must not be empty")]
    EmptyName,
}

/// A parsed-and-validated workflow definition, ready for the store
#[derive(Debug, Clone)]
pub struct ImportedWorkflow {
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Deserialize)]
struct YamlWorkflow {
    name: String,
    #[serde(default)]
    description: Option<String>,
    steps: Vec<YamlStep>,
}

#[derive(Debug, Deserialize)]
struct YamlStep {
    step_id: String,
    #[serde(default)]
    name: Option<String>,
    agent_id: String,
    input_template: String,
    expects: String,
    #[serde(default, rename = "type")]
    step_type: StepType,
    #[serde(default)]
    loop_config: Option<LoopConfig>,
    #[serde(default)]
    position: Option<usize>,
}

/// Parse a YAML workflow document.
///
/// `position` defaults to the array index; `type` defaults to `single`.
pub fn import_yaml(yaml: &str) -> Result<ImportedWorkflow, ImportError> {
    let parsed: YamlWorkflow = serde_yml::from_str(yaml)?;

    if parsed.name.trim().is_empty() {
        return Err(ImportError::EmptyName);
    }

    let steps: Vec<StepConfig> = parsed
        .steps
        .into_iter()
        .enumerate()
        .map(|(index, step)| StepConfig {
            step_id: step.step_id,
            name: step.name,
            agent_id: step.agent_id,
            input_template: step.input_template,
            expects: step.expects,
            step_type: step.step_type,
            loop_config: step.loop_config,
            position: step.position.unwrap_or(index),
        })
        .collect();

    validate_step_configs(&steps)?;

    Ok(ImportedWorkflow {
        name: parsed.name,
        description: parsed.description,
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_simple_workflow() {
        let yaml = r#"
name: feature-delivery
description: plan then build
steps:
  - step_id: plan
    agent_id: planner
    input_template: "Plan: {{task}}"
    expects: STORIES_JSON
  - step_id: dev
    agent_id: developer
    input_template: "Build: {{current_story}}"
    expects: STATUS
"#;

        let imported = import_yaml(yaml).unwrap();
        assert_eq!(imported.name, "feature-delivery");
        assert_eq!(imported.description.as_deref(), Some("plan then build"));
        assert_eq!(imported.steps.len(), 2);
        assert_eq!(imported.steps[0].step_type, StepType::Single);
        assert_eq!(imported.steps[0].position, 0);
        assert_eq!(imported.steps[1].position, 1);
    }

    #[test]
    fn test_import_loop_step_with_config() {
        let yaml = r#"
name: story-loop
steps:
  - step_id: plan
    agent_id: planner
    input_template: "Plan: {{task}}"
    expects: STORIES_JSON
  - step_id: build
    agent_id: developer
    input_template: "Build: {{current_story}}"
    expects: STATUS
    type: loop
    loop_config:
      over: stories
      completion: all_done
      verify_each: true
      verify_step: verify
  - step_id: verify
    agent_id: reviewer
    input_template: "Verify: {{current_story}}"
    expects: VERDICT
"#;

        let imported = import_yaml(yaml).unwrap();
        let build = &imported.steps[1];
        assert_eq!(build.step_type, StepType::Loop);
        let config = build.loop_config.as_ref().unwrap();
        assert_eq!(config.over, "stories");
        assert!(config.verify_each);
        assert_eq!(config.verify_step.as_deref(), Some("verify"));
    }

    #[test]
    fn test_import_explicit_position_wins() {
        let yaml = r#"
name: positions
steps:
  - step_id: second
    agent_id: a
    input_template: "x"
    expects: y
    position: 1
  - step_id: first
    agent_id: a
    input_template: "x"
    expects: y
    position: 0
"#;
        let imported = import_yaml(yaml).unwrap();
        assert_eq!(imported.steps[0].position, 1);
        assert_eq!(imported.steps[1].position, 0);
    }

    #[test]
    fn test_import_missing_required_field_fails() {
        let yaml = r#"
name: broken
steps:
  - step_id: plan
    agent_id: planner
    expects: done
"#;
        assert!(matches!(import_yaml(yaml), Err(ImportError::Yaml(_))));
    }

    #[test]
    fn test_import_duplicate_step_id_fails() {
        let yaml = r#"
name: dupes
steps:
  - step_id: plan
    agent_id: a
    input_template: "x"
    expects: y
  - step_id: plan
    agent_id: b
    input_template: "x"
    expects: y
"#;
        assert!(matches!(import_yaml(yaml), Err(ImportError::Validation(_))));
    }

    #[test]
    fn test_import_empty_name_fails() {
        let yaml = r#"
name: "  "
steps:
  - step_id: plan
    agent_id: a
    input_template: "x"
    expects: y
"#;
        assert!(matches!(import_yaml(yaml), Err(ImportError::EmptyName)));
    }

    #[test]
    fn test_import_loop_over_tasks_rejected() {
        let yaml = r#"
name: bad-loop
steps:
  - step_id: build
    agent_id: dev
    input_template: "x"
    expects: y
    type: loop
    loop_config:
      over: tasks
"#;
        assert!(matches!(import_yaml(yaml), Err(ImportError::Validation(_))));
    }

    #[test]
    fn test_yaml_round_trips_field_by_field() {
        let yaml = r#"
name: round-trip
description: fields survive
steps:
  - step_id: approve
    name: Sign-off
    agent_id: approver
    input_template: "Approve: {{task}}"
    expects: APPROVED
    type: approval
"#;
        let imported = import_yaml(yaml).unwrap();
        let step = &imported.steps[0];
        assert_eq!(step.step_id, "approve");
        assert_eq!(step.name.as_deref(), Some("Sign-off"));
        assert_eq!(step.agent_id, "approver");
        assert_eq!(step.input_template, "Approve: {{task}}");
        assert_eq!(step.expects, "APPROVED");
        assert_eq!(step.step_type, StepType::Approval);
    }
}
