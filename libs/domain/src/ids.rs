//! Entity identifiers.
//!
//! Every row key is a UUID v7 wrapped in a newtype and rendered behind a
//! short entity tag, e.g. `run_01961a8e-7d3a-7f1c-9b2e-4a5c6d7e8f90`. The
//! tag makes ids self-describing in logs and payloads, and a step id pasted
//! into a run endpoint fails to parse instead of hitting the wrong table.
//! v7 ids are time-ordered, so they sort by creation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A string that failed to parse as an entity id
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("bad {kind} id '{input}': {problem}")]
pub struct InvalidId {
    /// Which id type was expected
    pub kind: &'static str,
    /// The rejected input
    pub input: String,
    /// What was wrong with it
    pub problem: &'static str,
}

impl InvalidId {
    fn new(kind: &'static str, input: &str, problem: &'static str) -> Self {
        Self {
            kind,
            input: input.to_string(),
            problem,
        }
    }
}

/// Declares one tagged id type.
///
/// Text forms go through `FromStr`/`Display`; serde rides on those via the
/// `try_from`/`into` string bridge, so the JSON form and the log form can
/// never drift apart.
macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident => $tag:literal) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(Uuid);

        impl $name {
            /// Rendered tag, trailing separator included
            pub const TAG: &'static str = concat!($tag, "_");

            /// Mint a fresh, time-ordered id
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wrap a UUID read back from a row
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// The wrapped UUID, for database binds
            #[must_use]
            pub const fn uuid(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", Self::TAG, self.0)
            }
        }

        impl FromStr for $name {
            type Err = InvalidId;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let Some(raw) = s.strip_prefix(Self::TAG) else {
                    return Err(InvalidId::new($tag, s, "missing or wrong entity tag"));
                };
                match Uuid::try_parse(raw) {
                    Ok(uuid) => Ok(Self(uuid)),
                    Err(_) => Err(InvalidId::new($tag, s, "malformed uuid")),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidId;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.to_string()
            }
        }
    };
}

entity_id!(
    /// A principal that owns workflows and runs
    UserId => "user"
);
entity_id!(
    /// A workflow definition
    WorkflowId => "wf"
);
entity_id!(
    /// One execution of a workflow
    RunId => "run"
);
entity_id!(
    /// A materialized step row
    StepId => "step"
);
entity_id!(
    /// A story row consumed by a loop step
    StoryId => "story"
);
entity_id!(
    /// Reference to an external task; never dereferenced here
    TaskId => "task"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_tag() {
        let id = RunId::new();
        let text = id.to_string();
        assert!(text.starts_with("run_"), "got: {text}");
        // tag + full hyphenated uuid
        assert_eq!(text.len(), RunId::TAG.len() + 36);
    }

    #[test]
    fn test_text_round_trip() {
        let id = StepId::new();
        let parsed: StepId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_bare_uuid_rejected() {
        let err = "01961a8e-7d3a-7f1c-9b2e-4a5c6d7e8f90"
            .parse::<RunId>()
            .unwrap_err();
        assert_eq!(err.kind, "run");
        assert_eq!(err.problem, "missing or wrong entity tag");
    }

    #[test]
    fn test_wrong_tag_rejected() {
        let step = StepId::new();
        let err = step.to_string().parse::<RunId>().unwrap_err();
        assert_eq!(err.kind, "run");
        assert_eq!(err.problem, "missing or wrong entity tag");
        assert_eq!(err.input, step.to_string());
    }

    #[test]
    fn test_garbage_uuid_rejected() {
        let err = "run_not-a-uuid".parse::<RunId>().unwrap_err();
        assert_eq!(err.problem, "malformed uuid");
    }

    #[test]
    fn test_error_message_names_the_problem() {
        let err = "story_xyz".parse::<StoryId>().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("story"));
        assert!(text.contains("malformed uuid"));
    }

    #[test]
    fn test_serde_uses_the_text_form() {
        let id = WorkflowId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));

        let back: WorkflowId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_serde_rejects_cross_type_input() {
        let json = serde_json::to_string(&TaskId::new()).unwrap();
        assert!(serde_json::from_str::<UserId>(&json).is_err());
    }

    #[test]
    fn test_uuid_round_trip() {
        let uuid = Uuid::now_v7();
        let id = StoryId::from_uuid(uuid);
        assert_eq!(id.uuid(), uuid);
    }

    #[test]
    fn test_ids_are_unique_and_time_ordered() {
        let first = RunId::new();
        let second = RunId::new();
        assert_ne!(first, second);
        // v7 ids sort by creation
        assert!(first <= second);
    }
}
