//! OpenAI chat completions provider implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AiError, AiResult};

use super::provider::{
    AIMessage, AIResponse, AgentProvider, GenerateOptions, ProviderConfig, TokenUsage,
};

/// OpenAI API root
const OPENAI_API_URL: &str = "https://api.openai.com";

/// Default model
const DEFAULT_MODEL: &str = "gpt-4o";

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIChoiceMessage,
}

#[derive(Debug, Deserialize)]
#[allow(clippy::struct_field_names)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    model: String,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

/// OpenAI GPT provider.
pub struct OpenAIProvider {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAIProvider {
    /// Create a provider from explicit settings. `base_url` also covers
    /// Azure OpenAI and compatible proxies.
    pub fn new(config: &ProviderConfig) -> AiResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AiError::transport("openai", &e))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(OPENAI_API_URL)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn convert_messages(messages: &[AIMessage]) -> Vec<OpenAIMessage> {
        messages
            .iter()
            .map(|msg| OpenAIMessage {
                role: msg.role.as_str(),
                content: msg.content.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl AgentProvider for OpenAIProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn default_model(&self) -> &'static str {
        DEFAULT_MODEL
    }

    async fn generate_text(
        &self,
        model: &str,
        messages: &[AIMessage],
        options: &GenerateOptions,
    ) -> AiResult<AIResponse> {
        let api_key = self.api_key.as_ref().ok_or(AiError::NotConfigured {
            provider: "openai",
            env_var: "OPENAI_API_KEY",
        })?;

        let request = OpenAIRequest {
            model: model.to_string(),
            messages: Self::convert_messages(messages),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            response_format: options.json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        tracing::debug!(model = %request.model, schema = ?options.schema_name, "Calling OpenAI API");

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AiError::transport("openai", &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AiError::transport("openai", &e))?;

        if !status.is_success() {
            let message = match serde_json::from_str::<OpenAIErrorResponse>(&body) {
                Ok(err) => err.error.message,
                Err(_) => body,
            };
            return Err(AiError::Api {
                provider: "openai",
                status: status.as_u16(),
                message,
            });
        }

        let api_response: OpenAIResponse =
            serde_json::from_str(&body).map_err(|e| AiError::Parse {
                reason: format!("unexpected OpenAI response shape: {e}"),
            })?;

        // Extract text from first choice
        let text = api_response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        let usage = api_response.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        tracing::info!(
            model = %api_response.model,
            total_tokens = usage.total_tokens,
            "OpenAI API call complete"
        );

        Ok(AIResponse {
            text,
            usage,
            model: api_response.model,
            provider: "openai".to_string(),
        })
    }
}
