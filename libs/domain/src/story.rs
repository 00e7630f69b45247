//! Story model: work units produced by a planner step for a loop step

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::StoryStatus;
use crate::ids::{RunId, StoryId};
use crate::step::DEFAULT_MAX_RETRIES;

/// A story parsed from a planner's `STORIES_JSON:` block, before it is
/// persisted. `acceptance_criteria` arrives as an array of strings and is
/// stored newline-joined as a `- item` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorySeed {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "acceptance_criteria")]
    #[serde(rename = "acceptanceCriteria")]
    pub acceptance_criteria: Vec<String>,
}

impl StorySeed {
    /// Join acceptance criteria as a `- item` list for storage
    #[must_use]
    pub fn criteria_text(&self) -> Option<String> {
        if self.acceptance_criteria.is_empty() {
            None
        } else {
            Some(
                self.acceptance_criteria
                    .iter()
                    .map(|item| format!("- {item}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        }
    }
}

/// A persisted story row owned by a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: StoryId,
    pub run_id: RunId,
    pub story_index: i32,
    /// Author-chosen identifier, unique within the run
    pub story_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Newline-joined `- item` list
    #[serde(default)]
    pub acceptance_criteria: Option<String>,
    pub status: StoryStatus,
    #[serde(default)]
    pub output: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Story {
    /// Build a persistable story from a parsed seed
    #[must_use]
    pub fn from_seed(run_id: RunId, seed: &StorySeed, story_index: i32) -> Self {
        let now = Utc::now();
        Self {
            id: StoryId::new(),
            run_id,
            story_index,
            story_id: seed.id.clone(),
            title: seed.title.clone(),
            description: seed.description.clone(),
            acceptance_criteria: seed.criteria_text(),
            status: StoryStatus::Pending,
            output: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub const fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criteria_text_joins_as_list() {
        let seed = StorySeed {
            id: "s1".to_string(),
            title: "t1".to_string(),
            description: None,
            acceptance_criteria: vec!["login works".to_string(), "logout works".to_string()],
        };
        assert_eq!(
            seed.criteria_text().as_deref(),
            Some("- login works\n- logout works")
        );
    }

    #[test]
    fn test_criteria_text_empty_is_none() {
        let seed = StorySeed {
            id: "s1".to_string(),
            title: "t1".to_string(),
            description: None,
            acceptance_criteria: vec![],
        };
        assert_eq!(seed.criteria_text(), None);
    }

    #[test]
    fn test_seed_accepts_snake_case_alias() {
        let json = r#"{"id":"s1","title":"t1","acceptance_criteria":["a"]}"#;
        let seed: StorySeed = serde_json::from_str(json).unwrap();
        assert_eq!(seed.acceptance_criteria, vec!["a".to_string()]);
    }

    #[test]
    fn test_from_seed_starts_pending() {
        let seed = StorySeed {
            id: "s1".to_string(),
            title: "t1".to_string(),
            description: Some("d1".to_string()),
            acceptance_criteria: vec!["a".to_string()],
        };
        let story = Story::from_seed(RunId::new(), &seed, 0);
        assert_eq!(story.status, StoryStatus::Pending);
        assert_eq!(story.story_id, "s1");
        assert_eq!(story.acceptance_criteria.as_deref(), Some("- a"));
    }
}
