#![cfg(feature = "anthropic")]

//! Wire-level tests for the Anthropic Messages adapter against a mock server.

use std::sync::Arc;
use std::time::Duration;

use agentgate::health::HealthRegistry;
use agentgate::provider::anthropic::AnthropicProvider;
use agentgate::provider::{ChatProvider, ProviderRequest};
use agentgate::retry::RetryPolicy;
use agentgate::types::{ChatMessage, FinishReason, GenerationSettings, StreamEventType};
use futures::StreamExt;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
        multiplier: 1.0,
    }
}

fn provider(server: &MockServer) -> AnthropicProvider {
    AnthropicProvider::new(
        "claude-sonnet-4".to_string(),
        "test-key".to_string(),
        Some(server.uri()),
        Arc::new(HealthRegistry::default()),
        test_retry_policy(),
    )
}

fn simple_request(text: &str) -> ProviderRequest {
    ProviderRequest {
        messages: vec![ChatMessage::user(text)],
        settings: GenerationSettings::default(),
        tools: None,
    }
}

#[tokio::test]
async fn complete_parses_text_and_tool_use_blocks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [
                {"type": "text", "text": "Checking the weather."},
                {"type": "tool_use", "id": "toolu_1", "name": "get_weather",
                 "input": {"city": "Oslo"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 20, "output_tokens": 15}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = provider(&server)
        .complete(&simple_request("weather in Oslo?"))
        .await
        .expect("completion");

    assert_eq!(response.text, "Checking the weather.");
    assert_eq!(response.finish_reason, Some(FinishReason::ToolCalls));
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].name, "get_weather");
    assert_eq!(response.tool_calls[0].arguments, json!({"city": "Oslo"}));
    assert_eq!(response.usage.total_tokens, 35);
}

#[tokio::test]
async fn stream_accumulates_tool_use_input_fragments() {
    let sse_body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\
\"delta\":{\"type\":\"text_delta\",\"text\":\"One sec. \"}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":1,\
\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"get_weather\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":1,\
\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"city\\\"\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":1,\
\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\":\\\"Oslo\\\"}\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":1}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\
\"usage\":{\"output_tokens\":9}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&server)
        .await;

    let stream = provider(&server)
        .stream(&simple_request("weather in Oslo?"))
        .await
        .expect("stream start");
    let deltas: Vec<_> = stream.map(|d| d.expect("delta")).collect::<Vec<_>>().await;

    let text: String = deltas
        .iter()
        .filter(|d| d.event_type == StreamEventType::TextDelta)
        .map(|d| d.text.as_str())
        .collect();
    assert_eq!(text, "One sec. ");

    let calls: Vec<_> = deltas.iter().filter_map(|d| d.tool_call.as_ref()).collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "toolu_1");
    assert_eq!(calls[0].arguments, json!({"city": "Oslo"}));

    let done = deltas.last().expect("deltas");
    assert_eq!(done.event_type, StreamEventType::Done);
    assert_eq!(done.finish_reason, Some(FinishReason::ToolCalls));
    assert_eq!(done.usage.map(|u| u.output_tokens), Some(9));
}

#[tokio::test]
async fn stream_plain_text_finishes_with_stop() {
    let sse_body = concat!(
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\
\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello!\"}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\
\"usage\":{\"output_tokens\":3}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&server)
        .await;

    let stream = provider(&server)
        .stream(&simple_request("hi"))
        .await
        .expect("stream start");
    let deltas: Vec<_> = stream.map(|d| d.expect("delta")).collect::<Vec<_>>().await;

    assert_eq!(deltas[0].text, "Hello!");
    let done = deltas.last().expect("deltas");
    assert_eq!(done.event_type, StreamEventType::Done);
    assert_eq!(done.finish_reason, Some(FinishReason::Stop));
}
