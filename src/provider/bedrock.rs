//! AWS Bedrock Converse/ConverseStream adapter.
//!
//! The AWS SDK is a heavy optional dependency: the client is built on
//! first use and cached for the life of the adapter. Setup failure (for
//! example, no resolvable region) is a descriptive configuration error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_bedrockruntime::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_bedrockruntime::types::{
    ContentBlock, ContentBlockDelta, ContentBlockStart, ConversationRole, ConverseStreamOutput,
    InferenceConfiguration, Message as BedrockMessage, StopReason, SystemContentBlock, Tool,
    ToolConfiguration, ToolInputSchema, ToolResultBlock, ToolResultContentBlock, ToolResultStatus,
    ToolSpecification, ToolUseBlock,
};
use aws_smithy_types::{Document, Number};
use futures::stream::BoxStream;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::health::HealthRegistry;
use crate::retry::RetryPolicy;
use crate::types::*;

use super::{ChatProvider, ProviderRequest, ProviderResponse};

const PROVIDER_NAME: &str = "bedrock";

pub struct BedrockProvider {
    model_id: String,
    region: Option<String>,
    client: OnceCell<aws_sdk_bedrockruntime::Client>,
    health: Arc<HealthRegistry>,
    retry: RetryPolicy,
}

impl BedrockProvider {
    pub fn new(
        model_id: String,
        region: Option<String>,
        health: Arc<HealthRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            model_id,
            region,
            client: OnceCell::new(),
            health,
            retry,
        }
    }

    /// Lazily build and cache the Bedrock client.
    async fn client(&self) -> Result<&aws_sdk_bedrockruntime::Client> {
        self.client
            .get_or_try_init(|| async {
                let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
                if let Some(region) = &self.region {
                    loader = loader.region(aws_config::Region::new(region.clone()));
                }
                let sdk_config = loader.load().await;
                if sdk_config.region().is_none() {
                    return Err(AgentError::Configuration(
                        "no AWS region configured for Bedrock (set region or AWS_REGION)"
                            .to_string(),
                    ));
                }
                Ok(aws_sdk_bedrockruntime::Client::new(&sdk_config))
            })
            .await
    }

    fn build_converse_input(
        &self,
        request: &ProviderRequest,
    ) -> Result<(
        Vec<SystemContentBlock>,
        Vec<BedrockMessage>,
        Option<ToolConfiguration>,
        InferenceConfiguration,
    )> {
        let mut system = Vec::new();
        let mut messages = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::System => {
                    system.push(SystemContentBlock::Text(msg.text()));
                }
                Role::User => {
                    let text = msg.text();
                    if !text.is_empty() {
                        messages.push(build_message(
                            ConversationRole::User,
                            vec![ContentBlock::Text(text)],
                        )?);
                    }
                }
                Role::Assistant => {
                    let mut content = Vec::new();
                    let text = msg.text();
                    if !text.is_empty() {
                        content.push(ContentBlock::Text(text));
                    }
                    for tc in msg.tool_calls() {
                        let block = ToolUseBlock::builder()
                            .tool_use_id(tc.id.clone())
                            .name(tc.name.clone())
                            .input(json_to_document(&tc.arguments))
                            .build()
                            .map_err(|e| {
                                AgentError::Configuration(format!("invalid tool use block: {e}"))
                            })?;
                        content.push(ContentBlock::ToolUse(block));
                    }
                    if !content.is_empty() {
                        messages.push(build_message(ConversationRole::Assistant, content)?);
                    }
                }
                Role::Tool => {
                    for tr in msg.tool_results() {
                        let text = match &tr.result {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        let block = ToolResultBlock::builder()
                            .tool_use_id(tr.tool_call_id.clone())
                            .content(ToolResultContentBlock::Text(text))
                            .status(if tr.is_error {
                                ToolResultStatus::Error
                            } else {
                                ToolResultStatus::Success
                            })
                            .build()
                            .map_err(|e| {
                                AgentError::Configuration(format!("invalid tool result: {e}"))
                            })?;
                        messages.push(build_message(
                            ConversationRole::User,
                            vec![ContentBlock::ToolResult(block)],
                        )?);
                    }
                }
            }
        }

        let tool_config = match &request.tools {
            Some(tools) if !tools.is_empty() => {
                let mut specs = Vec::with_capacity(tools.len());
                for t in tools {
                    let spec = ToolSpecification::builder()
                        .name(t.name.clone())
                        .description(t.description.clone())
                        .input_schema(ToolInputSchema::Json(json_to_document(&t.parameters)))
                        .build()
                        .map_err(|e| {
                            AgentError::Configuration(format!("invalid tool spec: {e}"))
                        })?;
                    specs.push(Tool::ToolSpec(spec));
                }
                Some(
                    ToolConfiguration::builder()
                        .set_tools(Some(specs))
                        .build()
                        .map_err(|e| {
                            AgentError::Configuration(format!("invalid tool config: {e}"))
                        })?,
                )
            }
            _ => None,
        };

        let inference = InferenceConfiguration::builder()
            .set_max_tokens(request.settings.max_tokens.map(|v| v as i32))
            .set_temperature(request.settings.temperature.map(|v| v as f32))
            .set_top_p(request.settings.top_p.map(|v| v as f32))
            .set_stop_sequences(request.settings.stop_sequences.clone())
            .build();

        Ok((system, messages, tool_config, inference))
    }
}

#[async_trait]
impl ChatProvider for BedrockProvider {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let client = self.client().await?;
        let (system, messages, tool_config, inference) = self.build_converse_input(request)?;
        debug!(model = %self.model_id, "bedrock converse");

        let out = self
            .retry
            .execute_tracked(PROVIDER_NAME, &self.health, || async {
                client
                    .converse()
                    .model_id(&self.model_id)
                    .set_system(Some(system.clone()))
                    .set_messages(Some(messages.clone()))
                    .set_tool_config(tool_config.clone())
                    .inference_config(inference.clone())
                    .send()
                    .await
                    .map_err(map_sdk_error)
            })
            .await?;

        let message = out
            .output()
            .and_then(|o| o.as_message().ok().cloned())
            .ok_or_else(|| AgentError::Provider {
                provider: PROVIDER_NAME.to_string(),
                message: "converse output carried no message".to_string(),
            })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in message.content() {
            match block {
                ContentBlock::Text(t) => text.push_str(t),
                ContentBlock::ToolUse(tu) => tool_calls.push(ToolCallRequest {
                    id: tu.tool_use_id().to_string(),
                    name: tu.name().to_string(),
                    arguments: document_to_json(tu.input()),
                }),
                _ => {}
            }
        }

        let usage = out
            .usage()
            .map(|u| Usage {
                input_tokens: u.input_tokens().max(0) as u32,
                output_tokens: u.output_tokens().max(0) as u32,
                total_tokens: u.total_tokens().max(0) as u32,
            })
            .unwrap_or_default();

        Ok(ProviderResponse {
            text,
            usage,
            tool_calls,
            finish_reason: map_stop_reason(out.stop_reason()),
        })
    }

    async fn stream(
        &self,
        request: &ProviderRequest,
    ) -> Result<BoxStream<'static, Result<StreamDelta>>> {
        let client = self.client().await?;
        let (system, messages, tool_config, inference) = self.build_converse_input(request)?;
        debug!(model = %self.model_id, "bedrock converse stream");

        let out = self
            .retry
            .execute_tracked(PROVIDER_NAME, &self.health, || async {
                client
                    .converse_stream()
                    .model_id(&self.model_id)
                    .set_system(Some(system.clone()))
                    .set_messages(Some(messages.clone()))
                    .set_tool_config(tool_config.clone())
                    .inference_config(inference.clone())
                    .send()
                    .await
                    .map_err(map_sdk_error)
            })
            .await?;

        let mut receiver = out.stream;

        let stream = async_stream::stream! {
            let mut pending: HashMap<i32, PendingToolUse> = HashMap::new();
            let mut saw_tool_use = false;
            let mut finish: Option<FinishReason> = None;
            let mut usage: Option<Usage> = None;

            loop {
                let event = match receiver.recv().await {
                    Ok(Some(event)) => event,
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(AgentError::Stream(format!("bedrock stream: {e:?}")));
                        return;
                    }
                };

                match event {
                    ConverseStreamOutput::ContentBlockStart(ev) => {
                        if let Some(ContentBlockStart::ToolUse(start)) = ev.start() {
                            pending.insert(ev.content_block_index(), PendingToolUse {
                                id: start.tool_use_id().to_string(),
                                name: start.name().to_string(),
                                input: String::new(),
                            });
                        }
                    }
                    ConverseStreamOutput::ContentBlockDelta(ev) => {
                        match ev.delta() {
                            Some(ContentBlockDelta::Text(text)) => {
                                if !text.is_empty() {
                                    yield Ok(StreamDelta::text_delta(text.clone()));
                                }
                            }
                            Some(ContentBlockDelta::ToolUse(delta)) => {
                                if let Some(call) = pending.get_mut(&ev.content_block_index()) {
                                    call.input.push_str(delta.input());
                                }
                            }
                            _ => {}
                        }
                    }
                    ConverseStreamOutput::ContentBlockStop(ev) => {
                        if let Some(call) = pending.remove(&ev.content_block_index()) {
                            saw_tool_use = true;
                            yield Ok(StreamDelta::tool_call(call.finalize()));
                        }
                    }
                    ConverseStreamOutput::MessageStop(ev) => {
                        finish = map_stop_reason(ev.stop_reason());
                    }
                    ConverseStreamOutput::Metadata(ev) => {
                        if let Some(u) = ev.usage() {
                            usage = Some(Usage {
                                input_tokens: u.input_tokens().max(0) as u32,
                                output_tokens: u.output_tokens().max(0) as u32,
                                total_tokens: u.total_tokens().max(0) as u32,
                            });
                        }
                    }
                    _ => {}
                }
            }

            let finish = if saw_tool_use {
                Some(FinishReason::ToolCalls)
            } else {
                finish
            };
            yield Ok(StreamDelta::done(finish, usage.take()));
        };

        Ok(Box::pin(stream))
    }
}

#[derive(Debug)]
struct PendingToolUse {
    id: String,
    name: String,
    input: String,
}

impl PendingToolUse {
    fn finalize(self) -> ToolCallRequest {
        let arguments = if self.input.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&self.input)
                .unwrap_or(serde_json::Value::String(self.input.clone()))
        };
        ToolCallRequest {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

fn build_message(role: ConversationRole, content: Vec<ContentBlock>) -> Result<BedrockMessage> {
    BedrockMessage::builder()
        .role(role)
        .set_content(Some(content))
        .build()
        .map_err(|e| AgentError::Configuration(format!("invalid converse message: {e}")))
}

fn map_stop_reason(reason: &StopReason) -> Option<FinishReason> {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => Some(FinishReason::Stop),
        StopReason::MaxTokens => Some(FinishReason::Length),
        StopReason::ToolUse => Some(FinishReason::ToolCalls),
        _ => None,
    }
}

/// Classify SDK failures into the uniform shape the retry executor
/// understands: throttling and 5xx-like service faults retryable, auth
/// and validation fatal.
fn map_sdk_error<E, R>(err: SdkError<E, R>) -> AgentError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::ServiceError(ctx) => {
            let code = ctx.err().meta().code().unwrap_or("Unknown").to_string();
            let message = ctx.err().meta().message().unwrap_or_default().to_string();
            match code.as_str() {
                "ThrottlingException" => AgentError::RateLimited {
                    retry_after_ms: None,
                },
                "ServiceUnavailableException" | "ModelTimeoutException"
                | "ModelNotReadyException" => AgentError::api(503, format!("{code}: {message}")),
                "InternalServerException" | "ModelErrorException" => {
                    AgentError::api(500, format!("{code}: {message}"))
                }
                "AccessDeniedException" | "UnrecognizedClientException" => {
                    AgentError::Authentication(format!("{code}: {message}"))
                }
                "ValidationException" | "ResourceNotFoundException" => {
                    AgentError::api(400, format!("{code}: {message}"))
                }
                _ => AgentError::Provider {
                    provider: PROVIDER_NAME.to_string(),
                    message: format!("{code}: {message}"),
                },
            }
        }
        SdkError::TimeoutError(_) => AgentError::Timeout(0),
        SdkError::DispatchFailure(_) => AgentError::api(503, "request dispatch failed"),
        other => AgentError::Provider {
            provider: PROVIDER_NAME.to_string(),
            message: format!("{other:?}"),
        },
    }
}

fn json_to_document(value: &serde_json::Value) -> Document {
    match value {
        serde_json::Value::Null => Document::Null,
        serde_json::Value::Bool(b) => Document::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Document::Number(Number::PosInt(u))
            } else if let Some(i) = n.as_i64() {
                Document::Number(Number::NegInt(i))
            } else {
                Document::Number(Number::Float(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => Document::String(s.clone()),
        serde_json::Value::Array(items) => {
            Document::Array(items.iter().map(json_to_document).collect())
        }
        serde_json::Value::Object(map) => Document::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_document(v)))
                .collect(),
        ),
    }
}

fn document_to_json(doc: &Document) -> serde_json::Value {
    match doc {
        Document::Null => serde_json::Value::Null,
        Document::Bool(b) => serde_json::Value::Bool(*b),
        Document::Number(n) => match n {
            Number::PosInt(u) => serde_json::json!(u),
            Number::NegInt(i) => serde_json::json!(i),
            Number::Float(f) => serde_json::json!(f),
        },
        Document::String(s) => serde_json::Value::String(s.clone()),
        Document::Array(items) => {
            serde_json::Value::Array(items.iter().map(document_to_json).collect())
        }
        Document::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), document_to_json(v)))
                .collect(),
        ),
    }
}
