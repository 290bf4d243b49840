//! AI agent integration.
//!
//! A provider-neutral [`AgentProvider`] trait with Anthropic and OpenAI
//! implementations, the prompts for each workflow step, and the structured
//! shapes ([`PlanDocument`], [`TaskBreakdown`], [`ChangeSet`]) parsed out of
//! model replies. Handlers talk to an [`Agent`], which binds a provider to a
//! model.

pub mod agent;
pub mod anthropic;
pub mod error;
pub mod openai;
pub mod prompts;
pub mod provider;
pub mod registry;
pub mod schemas;

pub use agent::Agent;
pub use anthropic::AnthropicProvider;
pub use error::{AiError, AiResult};
pub use openai::OpenAIProvider;
pub use prompts::{BreakdownContext, ChangeContext, PlanContext, PromptTemplate};
pub use provider::{
    AIMessage, AIResponse, AIRole, AgentProvider, GenerateOptions, MessageBuilder, ProviderConfig,
    TokenUsage,
};
pub use registry::{build_provider, env_var_for, ProviderRegistry};
pub use schemas::{parse_json_block, ChangeSet, FileEdit, PlanDocument, TaskBreakdown, TaskSpec};
