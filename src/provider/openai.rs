//! OpenAI-compatible Chat Completions adapter.

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

use super::http::{bearer_headers, shared_client, status_to_error};
use super::sse::json_event_stream;
use super::{ChatProvider, ProviderRequest, ProviderResponse};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const PROVIDER_NAME: &str = "openai";

pub struct OpenAiProvider {
    model: String,
    api_key: String,
    base_url: String,
    health: Arc<HealthRegistry>,
    retry: RetryPolicy,
}

impl OpenAiProvider {
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
        let messages = request
            .messages
            .iter()
            .map(message_to_openai)
            .collect::<Vec<_>>();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });

        let obj = body.as_object_mut().expect("body is an object");

        if let Some(max) = request.settings.max_tokens {
            obj.insert("max_tokens".into(), max.into());
        }
        if let Some(temp) = request.settings.temperature {
            obj.insert("temperature".into(), temp.into());
        }
        if let Some(top_p) = request.settings.top_p {
            obj.insert("top_p".into(), top_p.into());
        }
        if let Some(ref stops) = request.settings.stop_sequences {
            obj.insert("stop".into(), serde_json::json!(stops));
        }

        if let Some(ref tools) = request.tools {
            if !tools.is_empty() {
                let tool_defs: Vec<serde_json::Value> = tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect();
                obj.insert("tools".into(), tool_defs.into());
            }
        }

        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        self.retry
            .execute_tracked(PROVIDER_NAME, &self.health, || async {
                let resp = shared_client()
                    .post(&url)
                    .headers(bearer_headers(&self.api_key))
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
impl ChatProvider for OpenAiProvider {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let body = self.build_request_body(request, false);
        debug!(model = %self.model, "openai complete");

        let resp = self.send(&body).await?;
        let data: OpenAiChatResponse = resp.json().await?;
        let choice = data
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::api(200, "No choices in OpenAI response"))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCallRequest {
                id: tc.id,
                name: tc.function.name,
                arguments: parse_arguments(&tc.function.arguments),
            })
            .collect();

        let finish_reason = choice.finish_reason.as_deref().and_then(parse_finish_reason);

        Ok(ProviderResponse {
            text: choice.message.content.unwrap_or_default(),
            usage: data.usage.map(Into::into).unwrap_or_default(),
            tool_calls,
            finish_reason,
        })
    }

    async fn stream(
        &self,
        request: &ProviderRequest,
    ) -> Result<BoxStream<'static, Result<StreamDelta>>> {
        let body = self.build_request_body(request, true);
        debug!(model = %self.model, "openai stream");

        let resp = self.send(&body).await?;
        let events = json_event_stream(resp.bytes_stream());

        let stream = async_stream::stream! {
            // Argument fragments accumulate by choice index: some backends
            // only send the id on the first fragment of a call.
            let mut pending: BTreeMap<u32, PendingToolCall> = BTreeMap::new();
            let mut usage: Option<Usage> = None;
            let mut events = events;

            while let Some(event) = events.next().await {
                let value = match event {
                    Ok(v) => v,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let Ok(chunk) = serde_json::from_value::<OpenAiStreamChunk>(value) else {
                    continue;
                };
                if let Some(u) = chunk.usage {
                    usage = Some(u.into());
                }
                let Some(choice) = chunk.choices.into_iter().next() else {
                    continue;
                };

                for tc in choice.delta.tool_calls.unwrap_or_default() {
                    let entry = pending.entry(tc.index).or_default();
                    if let Some(id) = tc.id {
                        entry.id = id;
                    }
                    if let Some(function) = tc.function {
                        if let Some(name) = function.name {
                            entry.name = name;
                        }
                        if let Some(fragment) = function.arguments {
                            entry.arguments.push_str(&fragment);
                        }
                    }
                }

                if let Some(text) = choice.delta.content {
                    if !text.is_empty() {
                        yield Ok(StreamDelta::text_delta(text));
                    }
                }

                if let Some(reason) = choice.finish_reason.as_deref() {
                    let finish = parse_finish_reason(reason);
                    for (_, call) in std::mem::take(&mut pending) {
                        yield Ok(StreamDelta::tool_call(call.finalize()));
                    }
                    yield Ok(StreamDelta::done(finish, usage.take()));
                    return;
                }
            }

            // Stream ended without a finish_reason frame: flush what we have.
            for (_, call) in std::mem::take(&mut pending) {
                yield Ok(StreamDelta::tool_call(call.finalize()));
            }
            yield Ok(StreamDelta::done(None, usage.take()));
        };

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl PendingToolCall {
    fn finalize(self) -> ToolCallRequest {
        ToolCallRequest {
            id: self.id,
            name: self.name,
            arguments: parse_arguments(&self.arguments),
        }
    }
}

/// Parse tool-call arguments, falling back to a raw string when the
/// payload is not valid JSON.
fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(raw).unwrap_or(serde_json::Value::String(raw.to_string()))
}

fn parse_finish_reason(s: &str) -> Option<FinishReason> {
    match s {
        "stop" => Some(FinishReason::Stop),
        "length" => Some(FinishReason::Length),
        "tool_calls" => Some(FinishReason::ToolCalls),
        _ => None,
    }
}

fn message_to_openai(msg: &ChatMessage) -> serde_json::Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    // Tool-result message
    if msg.role == Role::Tool {
        if let Some(tr) = msg.tool_results().first() {
            let content = match &tr.result {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return serde_json::json!({
                "role": "tool",
                "tool_call_id": tr.tool_call_id,
                "content": content,
            });
        }
    }

    // Assistant message with tool calls
    let tool_calls = msg.tool_calls();
    if !tool_calls.is_empty() {
        let tc_json: Vec<serde_json::Value> = tool_calls
            .iter()
            .map(|tc| {
                serde_json::json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.name,
                        "arguments": tc.arguments.to_string(),
                    }
                })
            })
            .collect();
        let text = msg.text();
        return serde_json::json!({
            "role": role,
            "content": if text.is_empty() { serde_json::Value::Null } else { serde_json::Value::String(text) },
            "tool_calls": tc_json,
        });
    }

    // Simple single-text message
    if msg.content.len() == 1 {
        if let ContentPart::Text { ref text } = msg.content[0] {
            return serde_json::json!({ "role": role, "content": text });
        }
    }

    // Multi-part content
    let parts: Vec<serde_json::Value> = msg
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(serde_json::json!({
                "type": "text",
                "text": text,
            })),
            ContentPart::Image(img) => Some(serde_json::json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{};base64,{}", img.mime_type, img.data) }
            })),
            _ => None,
        })
        .collect();

    serde_json::json!({ "role": role, "content": parts })
}

// OpenAI API response types (internal)

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunction,
}

#[derive(Deserialize)]
struct OpenAiFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<OpenAiUsage> for Usage {
    fn from(u: OpenAiUsage) -> Self {
        Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

#[derive(Deserialize)]
struct OpenAiStreamToolCall {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiStreamFunction>,
}

#[derive(Deserialize)]
struct OpenAiStreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ToolDefinition;

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new(
            "gpt-4o".to_string(),
            "test-key".to_string(),
            None,
            Arc::new(HealthRegistry::default()),
            RetryPolicy::default(),
        )
    }

    #[test]
    fn request_body_has_wire_shape() {
        let request = ProviderRequest {
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
            settings: GenerationSettings {
                max_tokens: Some(256),
                temperature: Some(0.5),
                ..Default::default()
            },
            tools: Some(vec![ToolDefinition {
                name: "get_weather".into(),
                description: "Get weather".into(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            }]),
        };
        let body = provider().build_request_body(&request, true);

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "get_weather");
    }

    #[test]
    fn tool_result_message_maps_to_tool_role() {
        let msg = ChatMessage::tool_result("call_1", serde_json::json!({"temp": 21}), false);
        let mapped = message_to_openai(&msg);

        assert_eq!(mapped["role"], "tool");
        assert_eq!(mapped["tool_call_id"], "call_1");
        assert_eq!(mapped["content"], r#"{"temp":21}"#);
    }

    #[test]
    fn assistant_tool_calls_serialize_arguments_as_text() {
        let msg = ChatMessage::assistant_with_calls(
            "",
            vec![ToolCallRequest {
                id: "call_1".into(),
                name: "tool_a".into(),
                arguments: serde_json::json!({"q": "x"}),
            }],
        );
        let mapped = message_to_openai(&msg);

        assert_eq!(mapped["content"], serde_json::Value::Null);
        assert_eq!(mapped["tool_calls"][0]["function"]["name"], "tool_a");
        assert_eq!(
            mapped["tool_calls"][0]["function"]["arguments"],
            r#"{"q":"x"}"#
        );
    }

    #[test]
    fn arguments_fall_back_to_raw_string() {
        assert_eq!(parse_arguments(""), serde_json::json!({}));
        assert_eq!(parse_arguments("{\"a\":1}"), serde_json::json!({"a": 1}));
        assert_eq!(
            parse_arguments("not json"),
            serde_json::Value::String("not json".into())
        );
    }
}
