//! Anthropic Claude provider implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AiError, AiResult};

use super::provider::{
    AIMessage, AIResponse, AIRole, AgentProvider, GenerateOptions, ProviderConfig, TokenUsage,
};

/// Anthropic API root
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";

/// Anthropic API version
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default model
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Map short names to the canonical API model name.
fn normalize_model(model: &str) -> &str {
    match model {
        "opus" => "claude-opus-4-1-20250805",
        "sonnet" => DEFAULT_MODEL,
        "haiku" => "claude-3-5-haiku-20241022",
        _ => model,
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    model: String,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicError,
}

/// Anthropic Claude provider.
pub struct AnthropicProvider {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl AnthropicProvider {
    /// Create a provider from explicit settings.
    pub fn new(config: &ProviderConfig) -> AiResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AiError::transport("anthropic", &e))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(ANTHROPIC_API_URL)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// Convert messages to Anthropic format, extracting the system message.
    fn convert_messages(messages: &[AIMessage]) -> (Option<String>, Vec<AnthropicMessage>) {
        let mut system = None;
        let mut converted = Vec::new();

        for msg in messages {
            match msg.role {
                // Anthropic uses a separate system field
                AIRole::System => system = Some(msg.content.clone()),
                AIRole::User | AIRole::Assistant => converted.push(AnthropicMessage {
                    role: msg.role.as_str(),
                    content: msg.content.clone(),
                }),
            }
        }

        (system, converted)
    }
}

#[async_trait]
impl AgentProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
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
            provider: "anthropic",
            env_var: "ANTHROPIC_API_KEY",
        })?;

        let (system, converted_messages) = Self::convert_messages(messages);
        let request = AnthropicRequest {
            model: normalize_model(model).to_string(),
            messages: converted_messages,
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            temperature: options.temperature,
        };

        tracing::debug!(model = %request.model, schema = ?options.schema_name, "Calling Claude API");

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| AiError::transport("anthropic", &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AiError::transport("anthropic", &e))?;

        if !status.is_success() {
            let message = match serde_json::from_str::<AnthropicErrorResponse>(&body) {
                Ok(err) => format!("{} - {}", err.error.error_type, err.error.message),
                Err(_) => body,
            };
            return Err(AiError::Api {
                provider: "anthropic",
                status: status.as_u16(),
                message,
            });
        }

        let api_response: AnthropicResponse =
            serde_json::from_str(&body).map_err(|e| AiError::Parse {
                reason: format!("unexpected Anthropic response shape: {e}"),
            })?;

        let text = api_response
            .content
            .iter()
            .filter(|c| c.content_type == "text")
            .map(|c| c.text.as_str())
            .collect::<String>();

        tracing::info!(
            model = %api_response.model,
            input_tokens = api_response.usage.input_tokens,
            output_tokens = api_response.usage.output_tokens,
            "Claude API call complete"
        );

        Ok(AIResponse {
            text,
            usage: TokenUsage {
                input_tokens: api_response.usage.input_tokens,
                output_tokens: api_response.usage.output_tokens,
                total_tokens: api_response.usage.input_tokens + api_response.usage.output_tokens,
            },
            model: api_response.model,
            provider: "anthropic".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_model() {
        assert_eq!(normalize_model("sonnet"), DEFAULT_MODEL);
        assert_eq!(normalize_model("claude-3-haiku-20240307"), "claude-3-haiku-20240307");
    }

    #[test]
    fn test_message_conversion_extracts_system() {
        let messages = vec![
            AIMessage::system("You plan work"),
            AIMessage::user("Plan this"),
            AIMessage::assistant("Sure"),
        ];

        let (system, converted) = AnthropicProvider::convert_messages(&messages);

        assert_eq!(system.as_deref(), Some("You plan work"));
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0].role, "user");
        assert_eq!(converted[1].role, "assistant");
    }

    #[test]
    fn test_unconfigured_provider() {
        let provider = AnthropicProvider::new(&ProviderConfig::default()).unwrap();
        assert!(!provider.is_configured());
        assert_eq!(provider.name(), "anthropic");
    }
}
