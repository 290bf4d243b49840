//! Hosted providers against mocked HTTP endpoints.

use std::sync::Arc;
use std::time::Duration;

use ai::{
    Agent, AiError, AnthropicProvider, AgentProvider, OpenAIProvider, PlanContext, ProviderConfig,
};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer) -> ProviderConfig {
    ProviderConfig {
        api_key: Some("sk-test".to_string()),
        base_url: Some(server.uri()),
        timeout: Duration::from_secs(5),
    }
}

fn plan_context() -> PlanContext {
    PlanContext {
        issue_ref: "#42".to_string(),
        title: "Add CSV export".to_string(),
        body: "Users want CSV.".to_string(),
    }
}

mod anthropic {
    use super::*;

    #[tokio::test]
    async fn plan_round_trip_through_messages_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-test"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{
                    "type": "text",
                    "text": "```json\n{\"summary\": \"CSV export\", \"plan\": \"- [ ] writer\\n- [ ] endpoint\"}\n```"
                }],
                "model": "claude-sonnet-4-20250514",
                "usage": {"input_tokens": 10, "output_tokens": 20}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(&config(&server)).unwrap();
        let agent = Agent::new(Arc::new(provider), None);

        let plan = agent.propose_plan(&plan_context()).await.unwrap();
        assert_eq!(plan.summary, "CSV export");
        assert!(plan.plan.contains("- [ ] endpoint"));
    }

    #[tokio::test]
    async fn overloaded_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(529).set_body_json(json!({
                "type": "error",
                "error": {"type": "overloaded_error", "message": "Overloaded"}
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(&config(&server)).unwrap();
        let err = Agent::new(Arc::new(provider), None)
            .propose_plan(&plan_context())
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert!(err.to_string().contains("overloaded_error"));
    }

    #[tokio::test]
    async fn missing_key_is_not_configured() {
        let provider = AnthropicProvider::new(&ProviderConfig::default()).unwrap();
        let err = provider
            .generate_text("sonnet", &[], &ai::GenerateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::NotConfigured { .. }));
    }
}

mod openai {
    use super::*;

    #[tokio::test]
    async fn chat_completion_text_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "{\"summary\": \"s\", \"plan\": \"p\"}"}}],
                "model": "gpt-4o",
                "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
            })))
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new(&config(&server)).unwrap();
        let plan = Agent::new(Arc::new(provider), Some("gpt-4o".to_string()))
            .propose_plan(&plan_context())
            .await
            .unwrap();
        assert_eq!(plan.plan, "p");
    }

    #[tokio::test]
    async fn invalid_key_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Incorrect API key provided"}
            })))
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new(&config(&server)).unwrap();
        let err = Agent::new(Arc::new(provider), None)
            .propose_plan(&plan_context())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
