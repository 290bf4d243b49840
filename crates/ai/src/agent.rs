//! High-level agent operations used by the workflow handlers.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::AiResult;
use crate::prompts::{
    BreakdownContext, ChangeContext, PlanContext, PromptTemplate, BREAKDOWN, CHANGE, PLAN,
};
use crate::provider::{AgentProvider, GenerateOptions};
use crate::schemas::{parse_json_block, ChangeSet, PlanDocument, TaskBreakdown};

const PLAN_MAX_TOKENS: u32 = 4096;
const CHANGE_MAX_TOKENS: u32 = 16_384;

/// A provider plus the model to call it with.
#[derive(Clone)]
pub struct Agent {
    provider: Arc<dyn AgentProvider>,
    model: String,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .finish()
    }
}

impl Agent {
    /// Use `model`, or the provider's default when `None`.
    pub fn new(provider: Arc<dyn AgentProvider>, model: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| provider.default_model().to_string());
        Self { provider, model }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Draft a proposal for an issue.
    pub async fn propose_plan(&self, context: &PlanContext) -> AiResult<PlanDocument> {
        self.structured(&PLAN, context, PLAN_MAX_TOKENS).await
    }

    /// Split an approved plan into ordered tasks.
    pub async fn break_down(&self, context: &BreakdownContext) -> AiResult<TaskBreakdown> {
        let breakdown: TaskBreakdown = self.structured(&BREAKDOWN, context, PLAN_MAX_TOKENS).await?;
        breakdown.validate()?;
        Ok(breakdown)
    }

    /// Produce file contents implementing one task.
    pub async fn generate_change(&self, context: &ChangeContext) -> AiResult<ChangeSet> {
        let change: ChangeSet = self.structured(&CHANGE, context, CHANGE_MAX_TOKENS).await?;
        change.validate()?;
        Ok(change)
    }

    async fn structured<C: Serialize + Sync, T: DeserializeOwned>(
        &self,
        template: &PromptTemplate,
        context: &C,
        max_tokens: u32,
    ) -> AiResult<T> {
        let messages = template.render(context)?;
        let options = GenerateOptions {
            temperature: Some(0.2),
            max_tokens: Some(max_tokens),
            json_mode: true,
            schema_name: Some(template.name.to_string()),
        };

        let response = self
            .provider
            .generate_text(&self.model, &messages, &options)
            .await?;
        debug!(
            schema = template.name,
            provider = %response.provider,
            output_tokens = response.usage.output_tokens,
            "Agent response received"
        );

        parse_json_block(&response.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AiError;
    use crate::provider::{AIResponse, MockAgentProvider, TokenUsage};

    fn reply(text: &str) -> AIResponse {
        AIResponse {
            text: text.to_string(),
            usage: TokenUsage::default(),
            model: "test-model".to_string(),
            provider: "mock".to_string(),
        }
    }

    fn mock_with(text: &'static str, schema: &'static str) -> MockAgentProvider {
        let mut mock = MockAgentProvider::new();
        mock.expect_name().return_const("mock");
        mock.expect_default_model().return_const("test-model");
        mock.expect_generate_text()
            .withf(move |model, messages, options| {
                model.to_string() == "test-model"
                    && messages.len() == 2
                    && options.json_mode
                    && options.schema_name.as_deref() == Some(schema)
            })
            .times(1)
            .returning(move |_, _, _| Ok(reply(text)));
        mock
    }

    #[tokio::test]
    async fn test_propose_plan_parses_document() {
        let mock = mock_with(
            r#"{"summary": "Add CSV export", "plan": "Do it", "tasks": []}"#,
            "plan",
        );
        let agent = Agent::new(Arc::new(mock), None);

        let plan = agent
            .propose_plan(&PlanContext {
                issue_ref: "#42".to_string(),
                title: "Export".to_string(),
                body: "CSV".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(plan.summary, "Add CSV export");
    }

    #[tokio::test]
    async fn test_break_down_rejects_empty_list() {
        let mock = mock_with(r#"{"tasks": []}"#, "breakdown");
        let agent = Agent::new(Arc::new(mock), None);

        let err = agent
            .break_down(&BreakdownContext {
                root_ref: "#42".to_string(),
                plan_title: "Export".to_string(),
                plan: "plan".to_string(),
                max_tasks: 5,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_provider_errors_propagate() {
        let mut mock = MockAgentProvider::new();
        mock.expect_default_model().return_const("test-model");
        mock.expect_generate_text().returning(|_, _, _| {
            Err(AiError::Api {
                provider: "mock",
                status: 503,
                message: "overloaded".to_string(),
            })
        });
        let agent = Agent::new(Arc::new(mock), None);

        let err = agent
            .generate_change(&ChangeContext {
                task_ref: "#43".to_string(),
                task_title: "t".to_string(),
                task_body: String::new(),
                branch: "labelflow/task-43".to_string(),
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
