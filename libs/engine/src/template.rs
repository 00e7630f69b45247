//! Template resolution and agent-output parsing
//!
//! Three jobs: substitute `{{var}}` placeholders against a run context,
//! fold `KEY: value` lines from agent output back into the context, and
//! extract `STORIES_JSON:` blocks emitted by planner steps.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use foreman_domain::{RunContext, Story, StorySeed};

/// Upper bound on stories a single planner output may produce
pub const DEFAULT_MAX_STORIES: usize = 20;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("placeholder regex"));

static CONTEXT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z_]+):\s*(.+)$").expect("context line regex"));

static KEY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z_]+:\s").expect("key line regex"));

const STORIES_MARKER: &str = "STORIES_JSON:";

/// Errors from `parse_stories_json`
#[derive(Debug, Error)]
pub enum StoriesError {
    #[error("STORIES_JSON block is not a valid story array: {0}")]
    Json(String),

    #[error("duplicate story id '{0}' in STORIES_JSON block")]
    DuplicateId(String),

    #[error("STORIES_JSON block has {count} stories, limit is {max}")]
    TooMany { count: usize, max: usize },
}

/// Replace every `{{name}}` (or `{{a.b.c}}`) with the context value.
///
/// Lookup is case-insensitive; dot-qualified names are looked up as whole
/// strings, not by nested descent. Missing keys resolve to the literal
/// `[missing: <name>]` and never raise.
#[must_use]
pub fn resolve(template: &str, ctx: &RunContext) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            ctx.get(&name.to_lowercase())
                .cloned()
                .unwrap_or_else(|| format!("[missing: {name}]"))
        })
        .into_owned()
}

/// Fold `KEY: value` lines from agent output into a copy of the context.
///
/// Keys are stored lowercased; values are trimmed. The `STORIES_JSON` key is
/// skipped (handled by `parse_stories_json`). The input context is never
/// mutated.
#[must_use]
pub fn merge_context(output: &str, ctx: &RunContext) -> RunContext {
    let mut merged = ctx.clone();

    for line in output.lines() {
        if let Some(caps) = CONTEXT_LINE.captures(line) {
            let key = &caps[1];
            if key == "STORIES_JSON" {
                continue;
            }
            merged.insert(key.to_lowercase(), caps[2].trim().to_string());
        }
    }

    merged
}

/// Extract the story array from a planner output.
///
/// The block starts at the first `STORIES_JSON:` line; the remainder of that
/// line plus every following line that does not start a new `KEY: ` entry
/// form one JSON document. Returns `Ok(None)` when no block is present.
pub fn parse_stories_json(
    output: &str,
    max_stories: usize,
) -> Result<Option<Vec<StorySeed>>, StoriesError> {
    let mut lines = output.lines();
    let mut block = String::new();
    let mut found = false;

    for line in lines.by_ref() {
        if let Some(rest) = line.strip_prefix(STORIES_MARKER) {
            block.push_str(rest);
            found = true;
            break;
        }
    }
    if !found {
        return Ok(None);
    }

    for line in lines {
        if KEY_LINE.is_match(line) {
            break;
        }
        block.push('\n');
        block.push_str(line);
    }

    let seeds: Vec<StorySeed> =
        serde_json::from_str(block.trim()).map_err(|e| StoriesError::Json(e.to_string()))?;

    if seeds.len() > max_stories {
        return Err(StoriesError::TooMany {
            count: seeds.len(),
            max: max_stories,
        });
    }

    let mut seen = std::collections::HashSet::new();
    for seed in &seeds {
        if !seen.insert(seed.id.as_str()) {
            return Err(StoriesError::DuplicateId(seed.id.clone()));
        }
    }

    Ok(Some(seeds))
}

/// Render a story for injection into a loop step's context.
#[must_use]
pub fn format_story(story: &Story) -> String {
    let mut text = format!("Story {}: {}", story.story_id, story.title);

    if let Some(description) = &story.description {
        text.push_str("\n\n");
        text.push_str(description);
    }

    if let Some(criteria) = &story.acceptance_criteria {
        text.push_str("\n\nAcceptance Criteria:");
        for (index, item) in criteria.lines().enumerate() {
            let item = item.strip_prefix("- ").unwrap_or(item);
            text.push_str(&format!("\n  {}. {}", index + 1, item));
        }
    }

    text
}

/// Parse a string that should hold JSON; on failure return the raw string
/// as a JSON string value rather than raising.
#[must_use]
pub fn safe_json_parse(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use foreman_domain::{RunId, StoryId, StoryStatus};

    fn ctx(pairs: &[(&str, &str)]) -> RunContext {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_resolve_simple_placeholder() {
        let context = ctx(&[("task", "auth")]);
        assert_eq!(resolve("Plan: {{task}}", &context), "Plan: auth");
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let context = ctx(&[("task", "auth")]);
        assert_eq!(resolve("Plan: {{TASK}}", &context), "Plan: auth");
        assert_eq!(resolve("Plan: {{Task}}", &context), "Plan: auth");
    }

    #[test]
    fn test_resolve_missing_key_is_literal() {
        let context = ctx(&[]);
        assert_eq!(resolve("Plan: {{task}}", &context), "Plan: [missing: task]");
    }

    #[test]
    fn test_resolve_dotted_name_whole_string_lookup() {
        let context = ctx(&[("build.target", "x86")]);
        assert_eq!(resolve("for {{build.target}}", &context), "for x86");
        // no nested descent
        let nested = ctx(&[("build", "{}")]);
        assert_eq!(
            resolve("for {{build.target}}", &nested),
            "for [missing: build.target]"
        );
    }

    #[test]
    fn test_resolve_multiple_occurrences() {
        let context = ctx(&[("task", "auth")]);
        assert_eq!(resolve("{{task}} and {{task}}", &context), "auth and auth");
    }

    #[test]
    fn test_resolve_tolerates_inner_whitespace() {
        let context = ctx(&[("task", "auth")]);
        assert_eq!(resolve("Plan: {{ task }}", &context), "Plan: auth");
    }

    #[test]
    fn test_merge_context_folds_key_lines() {
        let context = ctx(&[("task", "auth")]);
        let merged = merge_context("STATUS: done\nBRANCH_NAME: feat/auth \n", &context);
        assert_eq!(merged.get("status").map(String::as_str), Some("done"));
        assert_eq!(
            merged.get("branch_name").map(String::as_str),
            Some("feat/auth")
        );
        assert_eq!(merged.get("task").map(String::as_str), Some("auth"));
    }

    #[test]
    fn test_merge_context_skips_stories_json() {
        let context = ctx(&[]);
        let merged = merge_context("STORIES_JSON: [{\"id\":\"s1\"}]", &context);
        assert!(!merged.contains_key("stories_json"));
    }

    #[test]
    fn test_merge_context_ignores_non_key_lines() {
        let context = ctx(&[]);
        let merged = merge_context("just prose\nlower: case\nMixedCase: no", &context);
        assert!(merged.is_empty());
    }

    #[test]
    fn test_merge_context_does_not_mutate_input() {
        let context = ctx(&[("task", "auth")]);
        let _ = merge_context("STATUS: done", &context);
        assert!(!context.contains_key("status"));
    }

    #[test]
    fn test_merge_context_overwrites_existing_key() {
        let context = ctx(&[("status", "old")]);
        let merged = merge_context("STATUS: new", &context);
        assert_eq!(merged.get("status").map(String::as_str), Some("new"));
    }

    #[test]
    fn test_parse_stories_single_line() {
        let output = r#"STORIES_JSON: [{"id":"s1","title":"t1","description":"d1","acceptanceCriteria":["a"]}]"#;
        let seeds = parse_stories_json(output, DEFAULT_MAX_STORIES)
            .unwrap()
            .unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].id, "s1");
        assert_eq!(seeds[0].acceptance_criteria, vec!["a".to_string()]);
    }

    #[test]
    fn test_parse_stories_multiline_block() {
        let output = "PLAN: ok\nSTORIES_JSON: [\n  {\"id\":\"s1\",\"title\":\"t1\"},\n  {\"id\":\"s2\",\"title\":\"t2\"}\n]\nSTATUS: done";
        let seeds = parse_stories_json(output, DEFAULT_MAX_STORIES)
            .unwrap()
            .unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[1].id, "s2");
    }

    #[test]
    fn test_parse_stories_block_ends_at_next_key_line() {
        // the JSON closes before STATUS:, which must not be swallowed
        let output = "STORIES_JSON: [{\"id\":\"s1\",\"title\":\"t\"}]\nSTATUS: done";
        let seeds = parse_stories_json(output, DEFAULT_MAX_STORIES)
            .unwrap()
            .unwrap();
        assert_eq!(seeds.len(), 1);
    }

    #[test]
    fn test_parse_stories_absent_returns_none() {
        assert!(parse_stories_json("STATUS: done", DEFAULT_MAX_STORIES)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_stories_snake_case_criteria_alias() {
        let output =
            r#"STORIES_JSON: [{"id":"s1","title":"t1","acceptance_criteria":["a","b"]}]"#;
        let seeds = parse_stories_json(output, DEFAULT_MAX_STORIES)
            .unwrap()
            .unwrap();
        assert_eq!(seeds[0].acceptance_criteria.len(), 2);
    }

    #[test]
    fn test_parse_stories_duplicate_id_rejected() {
        let output = r#"STORIES_JSON: [{"id":"s1","title":"a"},{"id":"s1","title":"b"}]"#;
        let err = parse_stories_json(output, DEFAULT_MAX_STORIES).unwrap_err();
        assert!(matches!(err, StoriesError::DuplicateId(id) if id == "s1"));
    }

    #[test]
    fn test_parse_stories_limit_enforced() {
        let stories: Vec<String> = (0..3)
            .map(|i| format!("{{\"id\":\"s{i}\",\"title\":\"t\"}}"))
            .collect();
        let output = format!("STORIES_JSON: [{}]", stories.join(","));
        let err = parse_stories_json(&output, 2).unwrap_err();
        assert!(matches!(err, StoriesError::TooMany { count: 3, max: 2 }));
    }

    #[test]
    fn test_parse_stories_bad_json_rejected() {
        let err = parse_stories_json("STORIES_JSON: not json", DEFAULT_MAX_STORIES).unwrap_err();
        assert!(matches!(err, StoriesError::Json(_)));
    }

    fn story(description: Option<&str>, criteria: Option<&str>) -> Story {
        let now = Utc::now();
        Story {
            id: StoryId::new(),
            run_id: RunId::new(),
            story_index: 0,
            story_id: "s1".to_string(),
            title: "Add login".to_string(),
            description: description.map(ToString::to_string),
            acceptance_criteria: criteria.map(ToString::to_string),
            status: StoryStatus::Pending,
            output: None,
            retry_count: 0,
            max_retries: 3,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_format_story_full() {
        let story = story(Some("Users can log in."), Some("- works\n- fast"));
        assert_eq!(
            format_story(&story),
            "Story s1: Add login\n\nUsers can log in.\n\nAcceptance Criteria:\n  1. works\n  2. fast"
        );
    }

    #[test]
    fn test_format_story_without_optional_sections() {
        let story = story(None, None);
        assert_eq!(format_story(&story), "Story s1: Add login");
    }

    #[test]
    fn test_safe_json_parse_falls_back_to_raw_string() {
        assert_eq!(
            safe_json_parse("{\"a\":1}"),
            serde_json::json!({"a": 1})
        );
        assert_eq!(
            safe_json_parse("not json"),
            serde_json::Value::String("not json".to_string())
        );
    }
}
