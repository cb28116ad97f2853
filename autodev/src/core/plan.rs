//! Plan responses from the generator, and the heuristic plan used when
//! planning output is missing or unusable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::changeset::{outermost_object, strip_code_fence};

/// Number of source files the fallback plan marks as relevant.
pub const FALLBACK_RELEVANT_FILES: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub relevant_files: Vec<String>,
    pub steps: Vec<String>,
    pub reasoning: Option<String>,
}

/// Parse `{"relevant_files": [...], "plan": [...], "reasoning": "..."}`,
/// tolerating fences, surrounding prose, and a plan given as one string.
pub fn parse_plan_response(text: &str) -> Result<Plan, String> {
    let unfenced = strip_code_fence(text);
    let object = outermost_object(unfenced).ok_or_else(|| "no json object in response".to_string())?;
    let value: Value = serde_json::from_str(object).map_err(|err| format!("invalid json: {err}"))?;

    let relevant_files = string_list(value.get("relevant_files"));
    let steps = match value.get("plan").or_else(|| value.get("steps")) {
        Some(Value::String(text)) => text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        other => string_list(other),
    };
    if steps.is_empty() {
        return Err("response has no plan steps".to_string());
    }
    let reasoning = value
        .get("reasoning")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Plan {
        relevant_files,
        steps,
        reasoning,
    })
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Generic plan over the first source files of the repository.
pub fn fallback_plan(file_map: &[String], source_extensions: &[String]) -> Plan {
    let relevant_files = file_map
        .iter()
        .filter(|path| source_extensions.iter().any(|ext| path.ends_with(ext.as_str())))
        .take(FALLBACK_RELEVANT_FILES)
        .cloned()
        .collect();
    Plan {
        relevant_files,
        steps: vec![
            "Analyze the existing code structure".to_string(),
            "Identify where changes need to be made".to_string(),
            "Implement the requested changes".to_string(),
            "Add or update tests for the changes".to_string(),
        ],
        reasoning: Some("fallback plan: planning response was unavailable".to_string()),
    }
}
