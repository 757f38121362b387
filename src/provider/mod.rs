//! Provider adapters: one per backend wire protocol.

pub mod http;
pub mod sse;

#[cfg(feature = "openai")]
pub mod openai;

#[cfg(feature = "anthropic")]
pub mod anthropic;

#[cfg(feature = "bedrock")]
pub mod bedrock;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::GatewayConfig;
use crate::error::{AgentError, Result};
use crate::health::HealthRegistry;
use crate::retry::RetryPolicy;
use crate::types::{
    ChatMessage, FinishReason, GenerationSettings, StreamDelta, ToolCallRequest, Usage,
};

/// A request sent to a model backend.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub messages: Vec<ChatMessage>,
    pub settings: GenerationSettings,
    pub tools: Option<Vec<ToolDefinition>>,
}

/// Tool schema advertised to the backend.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Response from a backend: one assistant message worth of content.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub usage: Usage,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: Option<FinishReason>,
}

impl ProviderResponse {
    /// Convert into the assistant message to append to the conversation.
    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::assistant_with_calls(self.text.clone(), self.tool_calls.clone())
    }
}

/// Core trait implemented by all backend adapters.
///
/// `stream` and `complete` share one logical contract: the terminal value
/// of a streaming call (the `Done` delta plus accumulated text/tool calls)
/// is equivalent to a full [`ProviderResponse`].
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name used for health tracking (e.g. "openai").
    fn provider_name(&self) -> &str;

    /// The model ID this adapter instance serves.
    fn model_id(&self) -> &str;

    /// Run a completion (non-streaming).
    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse>;

    /// Run a completion, streaming deltas as they arrive.
    async fn stream(
        &self,
        request: &ProviderRequest,
    ) -> Result<BoxStream<'static, Result<StreamDelta>>>;
}

/// Closed set of supported backends, resolved once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    /// OpenAI-compatible `/chat/completions` backend.
    OpenAi {
        model: String,
        base_url: Option<String>,
    },
    /// Anthropic Messages API.
    Anthropic { model: String },
    /// AWS Bedrock Converse/ConverseStream.
    Bedrock {
        model_id: String,
        region: Option<String>,
    },
}

impl ProviderKind {
    /// Provider name used for config lookup and health tracking.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAi { .. } => "openai",
            Self::Anthropic { .. } => "anthropic",
            Self::Bedrock { .. } => "bedrock",
        }
    }
}

/// Create an adapter for the given backend.
///
/// API keys are resolved here, once; a missing key is a fatal
/// authentication error, never retried.
#[allow(unused_variables)]
pub fn create_provider(
    kind: &ProviderKind,
    config: &GatewayConfig,
    health: Arc<HealthRegistry>,
    retry: RetryPolicy,
) -> Result<Box<dyn ChatProvider>> {
    match kind {
        #[cfg(feature = "openai")]
        ProviderKind::OpenAi { model, base_url } => {
            let api_key = config.require_api_key("openai")?;
            let base_url = base_url.clone().or_else(|| config.base_url("openai"));
            Ok(Box::new(openai::OpenAiProvider::new(
                model.clone(),
                api_key,
                base_url,
                health,
                retry,
            )))
        }
        #[cfg(feature = "anthropic")]
        ProviderKind::Anthropic { model } => {
            let api_key = config.require_api_key("anthropic")?;
            Ok(Box::new(anthropic::AnthropicProvider::new(
                model.clone(),
                api_key,
                config.base_url("anthropic"),
                health,
                retry,
            )))
        }
        #[cfg(feature = "bedrock")]
        ProviderKind::Bedrock { model_id, region } => Ok(Box::new(
            bedrock::BedrockProvider::new(model_id.clone(), region.clone(), health, retry),
        )),
        #[allow(unreachable_patterns)]
        _ => Err(AgentError::UnknownProvider(format!(
            "provider '{}' not enabled via feature flags",
            kind.name()
        ))),
    }
}
