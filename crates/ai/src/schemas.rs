//! Structured response shapes the agent is asked to produce.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{AiError, AiResult};

/// Output of the planning step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDocument {
    /// One-line summary, used in the proposal issue title
    pub summary: String,
    /// Markdown body of the proposal
    pub plan: String,
    /// Optional early breakdown; the approval step may refine it
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// Output of the decomposition step, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBreakdown {
    pub tasks: Vec<TaskSpec>,
}

/// A file to write as part of a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    pub content: String,
}

/// Output of the code generation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub summary: String,
    #[serde(default)]
    pub commit_message: Option<String>,
    pub files: Vec<FileEdit>,
}

/// Parse model output into `T`.
///
/// Models often wrap JSON in markdown fences or add a sentence before it, so
/// this strips fences and falls back to the outermost `{...}` span.
pub fn parse_json_block<T: DeserializeOwned>(text: &str) -> AiResult<T> {
    let text = text.trim();

    let fenced = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .and_then(|s| s.trim_end().strip_suffix("```"))
        .map(str::trim);

    if let Some(inner) = fenced {
        if let Ok(value) = serde_json::from_str(inner) {
            return Ok(value);
        }
    }

    match serde_json::from_str(text) {
        Ok(value) => Ok(value),
        Err(direct_err) => {
            let span = text
                .find('{')
                .zip(text.rfind('}'))
                .filter(|(start, end)| start < end)
                .map(|(start, end)| &text[start..=end]);

            span.and_then(|s| serde_json::from_str(s).ok())
                .ok_or_else(|| AiError::Parse {
                    reason: format!("{direct_err}. Response: {}", preview(text)),
                })
        }
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 200;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

impl TaskBreakdown {
    /// Reject empty breakdowns and untitled tasks.
    pub fn validate(&self) -> AiResult<()> {
        if self.tasks.is_empty() {
            return Err(AiError::Parse {
                reason: "task breakdown is empty".to_string(),
            });
        }
        if let Some(pos) = self.tasks.iter().position(|t| t.title.trim().is_empty()) {
            return Err(AiError::Parse {
                reason: format!("task {} has no title", pos + 1),
            });
        }
        Ok(())
    }
}

impl ChangeSet {
    /// Require at least one file and only repository-relative paths.
    pub fn validate(&self) -> AiResult<()> {
        if self.files.is_empty() {
            return Err(AiError::Parse {
                reason: "change set contains no files".to_string(),
            });
        }
        for file in &self.files {
            let path = file.path.trim();
            if path.is_empty()
                || path.starts_with('/')
                || path.split('/').any(|segment| segment == "..")
            {
                return Err(AiError::Parse {
                    reason: format!("unsafe file path '{}'", file.path),
                });
            }
        }
        Ok(())
    }
}
