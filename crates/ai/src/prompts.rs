//! Prompt templates for the three workflow steps.
//!
//! Templates are Handlebars strings rendered with HTML escaping disabled.

use handlebars::Handlebars;
use serde::Serialize;

use crate::error::{AiError, AiResult};
use crate::provider::{AIMessage, MessageBuilder};

/// A named system/user prompt pair.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub name: &'static str,
    system: &'static str,
    user: &'static str,
}

impl PromptTemplate {
    pub const fn new(name: &'static str, system: &'static str, user: &'static str) -> Self {
        Self { name, system, user }
    }

    /// Render both halves against `context`.
    pub fn render<C: Serialize>(&self, context: &C) -> AiResult<Vec<AIMessage>> {
        let mut hb = Handlebars::new();
        hb.register_escape_fn(handlebars::no_escape);

        let render = |template: &str| {
            hb.render_template(template, context)
                .map_err(|e| AiError::Prompt {
                    name: self.name.to_string(),
                    reason: e.to_string(),
                })
        };

        Ok(MessageBuilder::new()
            .system(render(self.system)?)
            .user(render(self.user)?)
            .build())
    }
}

/// Context for the planning prompt.
#[derive(Debug, Clone, Serialize)]
pub struct PlanContext {
    /// Human reference of the root issue (`#42`)
    pub issue_ref: String,
    pub title: String,
    pub body: String,
}

/// Context for the task decomposition prompt.
#[derive(Debug, Clone, Serialize)]
pub struct BreakdownContext {
    pub root_ref: String,
    pub plan_title: String,
    pub plan: String,
    pub max_tasks: usize,
}

/// Context for the code change prompt.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeContext {
    pub task_ref: String,
    pub task_title: String,
    pub task_body: String,
    pub branch: String,
}

pub const PLAN: PromptTemplate = PromptTemplate::new("plan", PLAN_SYSTEM, PLAN_USER);
pub const BREAKDOWN: PromptTemplate =
    PromptTemplate::new("breakdown", BREAKDOWN_SYSTEM, BREAKDOWN_USER);
pub const CHANGE: PromptTemplate = PromptTemplate::new("change", CHANGE_SYSTEM, CHANGE_USER);

const PLAN_SYSTEM: &str = r#"You are a senior engineer writing an implementation proposal for a repository issue.

Respond with a single JSON object and nothing else:
{
  "summary": "one-line summary of the proposed change",
  "plan": "markdown proposal: approach, affected areas, risks",
  "tasks": [{"title": "short imperative title", "description": "what to do"}]
}
The "tasks" array is optional. When present, list tasks in the order they should be done."#;

const PLAN_USER: &str = r"Write a proposal for issue {{issue_ref}}.

Title: {{title}}

{{#if body}}{{body}}{{else}}(no description){{/if}}";

const BREAKDOWN_SYSTEM: &str = r#"You break an approved implementation plan into small, independently reviewable tasks.

Respond with a single JSON object and nothing else:
{"tasks": [{"title": "short imperative title", "description": "acceptance criteria and notes"}]}
Order tasks so each one can be merged before the next starts. Produce at most {{max_tasks}} tasks."#;

const BREAKDOWN_USER: &str = r"Plan for {{root_ref}}: {{plan_title}}

{{plan}}";

const CHANGE_SYSTEM: &str = r#"You implement one task in a repository by writing complete file contents.

Respond with a single JSON object and nothing else:
{
  "summary": "what the change does",
  "commit_message": "imperative commit subject",
  "files": [{"path": "repository/relative/path", "content": "full new file content"}]
}
Paths are relative to the repository root. Every listed file is overwritten with the given content."#;

const CHANGE_USER: &str = r"Implement task {{task_ref}} on branch {{branch}}.

Title: {{task_title}}

{{#if task_body}}{{task_body}}{{else}}(no description){{/if}}";
