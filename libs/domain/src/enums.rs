//! Status and type enums for the orchestrator
//!
//! These enums are the source of truth for all lifecycle states and must
//! match the values stored in the database exactly (snake_case text columns).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a string does not name a known enum variant
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Error returned when a status transition falls outside the matrix
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: String,
    pub to: String,
}

// =============================================================================
// Run Status
// =============================================================================

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal runs never change status again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError {
                kind: "run status",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Step Status
// =============================================================================

/// Status of a materialized step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Waiting,
    Pending,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
}

impl StepStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed steps never transition again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check whether a transition to `target` is inside the matrix.
    ///
    /// Self-transitions are no-ops and always allowed. `Running` may fall
    /// back to `Pending` or `Waiting` on retry.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        use StepStatus::{AwaitingApproval, Completed, Failed, Pending, Running, Waiting};

        if self == target {
            return true;
        }

        matches!(
            (self, target),
            (Waiting, Pending)
                | (Waiting, Running)
                | (Waiting, AwaitingApproval)
                | (Pending, Running)
                | (Pending, AwaitingApproval)
                | (Running, Pending)
                | (Running, Waiting)
                | (Running, AwaitingApproval)
                | (Running, Completed)
                | (Running, Failed)
                | (AwaitingApproval, Running)
                | (AwaitingApproval, Completed)
                | (AwaitingApproval, Failed)
        )
    }

    /// Validate a transition, returning the matrix error on violation
    pub fn check_transition(self, target: Self) -> Result<(), InvalidTransition> {
        if self.can_transition_to(target) {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError {
                kind: "step status",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Story Status
// =============================================================================

/// Status of a story consumed by a loop step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    Running,
    Verifying,
    Completed,
    Failed,
}

impl StoryStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Story transitions: claimed pending→running, then verifying or a
    /// terminal state; running drops back to pending on retry.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        use StoryStatus::{Completed, Failed, Pending, Running, Verifying};

        if self == target {
            return true;
        }

        matches!(
            (self, target),
            (Pending, Running)
                | (Running, Verifying)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
                | (Verifying, Completed)
                | (Verifying, Failed)
        )
    }

    pub fn check_transition(self, target: Self) -> Result<(), InvalidTransition> {
        if self.can_transition_to(target) {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoryStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "verifying" => Ok(Self::Verifying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError {
                kind: "story status",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Step Type
// =============================================================================

/// Kind of step: a plain agent invocation, a story loop, or a human approval
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[default]
    Single,
    Loop,
    Approval,
}

impl StepType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Loop => "loop",
            Self::Approval => "approval",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "loop" => Ok(Self::Loop),
            "approval" => Ok(Self::Approval),
            other => Err(ParseEnumError {
                kind: "step type",
                value: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_transitions_from_waiting() {
        assert!(StepStatus::Waiting.can_transition_to(StepStatus::Pending));
        assert!(StepStatus::Waiting.can_transition_to(StepStatus::Running));
        assert!(StepStatus::Waiting.can_transition_to(StepStatus::AwaitingApproval));
        assert!(!StepStatus::Waiting.can_transition_to(StepStatus::Completed));
        assert!(!StepStatus::Waiting.can_transition_to(StepStatus::Failed));
    }

    #[test]
    fn test_step_transitions_from_running() {
        // Retry falls back to pending or waiting
        assert!(StepStatus::Running.can_transition_to(StepStatus::Pending));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Waiting));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Completed));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Failed));
        assert!(StepStatus::Running.can_transition_to(StepStatus::AwaitingApproval));
    }

    #[test]
    fn test_step_terminal_states_never_transition() {
        for target in [
            StepStatus::Waiting,
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::AwaitingApproval,
        ] {
            assert!(!StepStatus::Completed.can_transition_to(target));
            assert!(!StepStatus::Failed.can_transition_to(target));
        }
    }

    #[test]
    fn test_step_self_transition_is_noop() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Pending));
        assert!(StepStatus::Completed.can_transition_to(StepStatus::Completed));
    }

    #[test]
    fn test_step_approval_transitions() {
        assert!(StepStatus::AwaitingApproval.can_transition_to(StepStatus::Completed));
        assert!(StepStatus::AwaitingApproval.can_transition_to(StepStatus::Failed));
        assert!(StepStatus::AwaitingApproval.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::AwaitingApproval.can_transition_to(StepStatus::Pending));
    }

    #[test]
    fn test_check_transition_error_names_statuses() {
        let err = StepStatus::Completed
            .check_transition(StepStatus::Running)
            .unwrap_err();
        assert_eq!(err.from, "completed");
        assert_eq!(err.to, "running");
    }

    #[test]
    fn test_story_transitions() {
        assert!(StoryStatus::Pending.can_transition_to(StoryStatus::Running));
        assert!(StoryStatus::Running.can_transition_to(StoryStatus::Verifying));
        assert!(StoryStatus::Running.can_transition_to(StoryStatus::Pending));
        assert!(StoryStatus::Verifying.can_transition_to(StoryStatus::Completed));
        assert!(!StoryStatus::Pending.can_transition_to(StoryStatus::Completed));
        assert!(!StoryStatus::Completed.can_transition_to(StoryStatus::Running));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            StepStatus::Waiting,
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::AwaitingApproval,
            StepStatus::Completed,
            StepStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<StepStatus>().unwrap(), status);
        }
        for status in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_step_type_default_is_single() {
        assert_eq!(StepType::default(), StepType::Single);
    }

    #[test]
    fn test_unknown_value_errors() {
        let err = "bogus".parse::<StepStatus>().unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }
}
