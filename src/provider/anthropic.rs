//! Anthropic Messages API adapter.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::health::HealthRegistry;
use crate::retry::RetryPolicy;
use crate::types::*;

use super::http::{anthropic_headers, shared_client, status_to_error};
use super::sse::json_event_stream;
use super::{ChatProvider, ProviderRequest, ProviderResponse};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const PROVIDER_NAME: &str = "anthropic";

/// The Messages API requires max_tokens; used when the caller sets none.
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    model: String,
    api_key: String,
    base_url: String,
    health: Arc<HealthRegistry>,
    retry: RetryPolicy,
}

impl AnthropicProvider {
    pub fn new(
        model: String,
        api_key: String,
        base_url: Option<String>,
        health: Arc<HealthRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model,
            api_key,
            health,
            retry,
        }
    }

    fn build_request_body(&self, request: &ProviderRequest, stream: bool) -> serde_json::Value {
        // System messages move to the top-level `system` field; tool
        // results become user-role tool_result blocks.
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::System => {
                    system_parts.push(msg.text());
                }
                Role::User => {
                    messages.push(serde_json::json!({
                        "role": "user",
                        "content": build_content(&msg.content),
                    }));
                }
                Role::Assistant => {
                    let mut content: Vec<serde_json::Value> = Vec::new();
                    for part in &msg.content {
                        match part {
                            ContentPart::Text { text } => {
                                if !text.is_empty() {
                                    content
                                        .push(serde_json::json!({"type": "text", "text": text}));
                                }
                            }
                            ContentPart::ToolCall(tc) => {
                                content.push(serde_json::json!({
                                    "type": "tool_use",
                                    "id": tc.id,
                                    "name": tc.name,
                                    "input": tc.arguments,
                                }));
                            }
                            _ => {}
                        }
                    }
                    if !content.is_empty() {
                        messages.push(serde_json::json!({
                            "role": "assistant",
                            "content": content,
                        }));
                    }
                }
                Role::Tool => {
                    for tr in msg.tool_results() {
                        let content = match &tr.result {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        messages.push(serde_json::json!({
                            "role": "user",
                            "content": [{
                                "type": "tool_result",
                                "tool_use_id": tr.tool_call_id,
                                "content": content,
                                "is_error": tr.is_error,
                            }],
                        }));
                    }
                }
            }
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.settings.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": stream,
        });

        let obj = body.as_object_mut().expect("body is an object");

        if !system_parts.is_empty() {
            obj.insert("system".into(), system_parts.join("\n").into());
        }
        if let Some(temp) = request.settings.temperature {
            obj.insert("temperature".into(), temp.into());
        }
        if let Some(top_p) = request.settings.top_p {
            obj.insert("top_p".into(), top_p.into());
        }
        if let Some(ref stops) = request.settings.stop_sequences {
            obj.insert("stop_sequences".into(), serde_json::json!(stops));
        }

        if let Some(ref tools) = request.tools {
            if !tools.is_empty() {
                let tool_defs: Vec<serde_json::Value> = tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect();
                obj.insert("tools".into(), tool_defs.into());
            }
        }

        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/messages", self.base_url);
        self.retry
            .execute_tracked(PROVIDER_NAME, &self.health, || async {
                let resp = shared_client()
                    .post(&url)
                    .headers(anthropic_headers(&self.api_key, API_VERSION))
                    .json(body)
                    .send()
                    .await?;
                let status = resp.status().as_u16();
                if status != 200 {
                    let body_text = resp.text().await.unwrap_or_default();
                    return Err(status_to_error(status, &body_text));
                }
                Ok(resp)
            })
            .await
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let body = self.build_request_body(request, false);
        debug!(model = %self.model, "anthropic complete");

        let resp = self.send(&body).await?;
        let data: AnthropicResponse = resp.json().await?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in &data.content {
            match block.r#type.as_str() {
                "text" => {
                    if let Some(ref t) = block.text {
                        text.push_str(t);
                    }
                }
                "tool_use" => {
                    if let (Some(ref id), Some(ref name)) = (&block.id, &block.name) {
                        tool_calls.push(ToolCallRequest {
                            id: id.clone(),
                            name: name.clone(),
                            arguments: block.input.clone().unwrap_or(serde_json::json!({})),
                        });
                    }
                }
                _ => {}
            }
        }

        Ok(ProviderResponse {
            text,
            usage: Usage {
                input_tokens: data.usage.input_tokens,
                output_tokens: data.usage.output_tokens,
                total_tokens: data.usage.input_tokens + data.usage.output_tokens,
            },
            tool_calls,
            finish_reason: data.stop_reason.as_deref().and_then(parse_stop_reason),
        })
    }

    async fn stream(
        &self,
        request: &ProviderRequest,
    ) -> Result<BoxStream<'static, Result<StreamDelta>>> {
        let body = self.build_request_body(request, true);
        debug!(model = %self.model, "anthropic stream");

        let resp = self.send(&body).await?;
        let events = json_event_stream(resp.bytes_stream());

        let stream = async_stream::stream! {
            // Tool-use blocks accumulate input fragments by block index;
            // the id/name arrive with content_block_start.
            let mut pending: BTreeMap<u64, PendingToolUse> = BTreeMap::new();
            let mut saw_tool_use = false;
            let mut usage: Option<Usage> = None;
            let mut finish: Option<FinishReason> = None;
            let mut events = events;

            while let Some(event) = events.next().await {
                let value = match event {
                    Ok(v) => v,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
                match event_type {
                    "content_block_start" => {
                        let index = value.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                        if let Some(block) = value.get("content_block") {
                            if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                                pending.insert(index, PendingToolUse {
                                    id: block.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                                    name: block.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                                    input: String::new(),
                                });
                            }
                        }
                    }
                    "content_block_delta" => {
                        let index = value.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                        if let Some(delta) = value.get("delta") {
                            match delta.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                                "text_delta" => {
                                    if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                                        if !text.is_empty() {
                                            yield Ok(StreamDelta::text_delta(text));
                                        }
                                    }
                                }
                                "input_json_delta" => {
                                    if let Some(json) = delta.get("partial_json").and_then(|t| t.as_str()) {
                                        if let Some(call) = pending.get_mut(&index) {
                                            call.input.push_str(json);
                                        }
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                    "content_block_stop" => {
                        let index = value.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                        if let Some(call) = pending.remove(&index) {
                            saw_tool_use = true;
                            yield Ok(StreamDelta::tool_call(call.finalize()));
                        }
                    }
                    "message_delta" => {
                        if let Some(stop) = value
                            .get("delta")
                            .and_then(|d| d.get("stop_reason"))
                            .and_then(|s| s.as_str())
                        {
                            finish = parse_stop_reason(stop);
                        }
                        if let Some(out) = value
                            .get("usage")
                            .and_then(|u| u.get("output_tokens"))
                            .and_then(|t| t.as_u64())
                        {
                            usage = Some(Usage {
                                output_tokens: out as u32,
                                total_tokens: out as u32,
                                ..Default::default()
                            });
                        }
                    }
                    "message_stop" => {
                        let finish = if saw_tool_use {
                            Some(FinishReason::ToolCalls)
                        } else {
                            finish.or(Some(FinishReason::Stop))
                        };
                        yield Ok(StreamDelta::done(finish, usage.take()));
                        return;
                    }
                    // message_start, ping etc. carry nothing we need.
                    _ => {}
                }
            }

            // Stream ended without message_stop.
            let finish = if saw_tool_use { Some(FinishReason::ToolCalls) } else { finish };
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

fn parse_stop_reason(s: &str) -> Option<FinishReason> {
    match s {
        "end_turn" | "stop_sequence" => Some(FinishReason::Stop),
        "max_tokens" => Some(FinishReason::Length),
        "tool_use" => Some(FinishReason::ToolCalls),
        _ => None,
    }
}

fn build_content(parts: &[ContentPart]) -> serde_json::Value {
    if parts.len() == 1 {
        if let ContentPart::Text { ref text } = parts[0] {
            return serde_json::Value::String(text.clone());
        }
    }

    let content: Vec<serde_json::Value> = parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(serde_json::json!({
                "type": "text",
                "text": text,
            })),
            ContentPart::Image(img) => Some(serde_json::json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": img.mime_type,
                    "data": img.data,
                }
            })),
            _ => None,
        })
        .collect();

    serde_json::json!(content)
}

// Internal Anthropic response types

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
