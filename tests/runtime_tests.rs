//! Tests for the agent runtime's model/tool round loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use agentgate::error::{AgentError, Result};
use agentgate::health::HealthRegistry;
use agentgate::policy::{PolicyLevel, ToolPolicyEngine, DENIED_BY_POLICY};
use agentgate::provider::{ChatProvider, ProviderRequest, ProviderResponse};
use agentgate::runtime::{AgentRuntime, TurnRequest, ROUND_LIMIT_MESSAGE};
use agentgate::tools::{FnTool, ToolRegistry};
use agentgate::types::{
    FinishReason, Role, StreamDelta, StreamEventType, ToolCallRequest, Usage,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use pretty_assertions::assert_eq;
use serde_json::json;

/// Provider that pops scripted responses and records every request.
struct ScriptedProvider {
    responses: Mutex<VecDeque<ProviderResponse>>,
    requests: Arc<Mutex<Vec<ProviderRequest>>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<ProviderResponse>) -> (Self, Arc<Mutex<Vec<ProviderRequest>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                responses: Mutex::new(responses.into()),
                requests: requests.clone(),
            },
            requests,
        )
    }

    fn pop(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::api(500, "script exhausted"))
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_id(&self) -> &str {
        "scripted-model"
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        self.pop(request)
    }

    async fn stream(
        &self,
        request: &ProviderRequest,
    ) -> Result<BoxStream<'static, Result<StreamDelta>>> {
        let response = self.pop(request)?;
        let mut deltas = Vec::new();
        // Split text into two chunks to exercise accumulation.
        let text = response.text;
        if !text.is_empty() {
            let mid = text.len() / 2;
            deltas.push(Ok(StreamDelta::text_delta(&text[..mid])));
            deltas.push(Ok(StreamDelta::text_delta(&text[mid..])));
        }
        for call in response.tool_calls {
            deltas.push(Ok(StreamDelta::tool_call(call)));
        }
        deltas.push(Ok(StreamDelta::done(
            response.finish_reason,
            Some(response.usage),
        )));
        Ok(Box::pin(futures::stream::iter(deltas)))
    }
}

fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        text: text.to_string(),
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        },
        tool_calls: Vec::new(),
        finish_reason: Some(FinishReason::Stop),
    }
}

fn tool_call_response(id: &str, name: &str, args: serde_json::Value) -> ProviderResponse {
    ProviderResponse {
        text: String::new(),
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        },
        tool_calls: vec![ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments: args,
        }],
        finish_reason: Some(FinishReason::ToolCalls),
    }
}

fn echo_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(FnTool::new(
        "echo",
        "Echo the arguments back",
        json!({"type": "object"}),
        |args, _session| async move { Ok(json!({"echoed": args})) },
    )));
    registry
}

fn runtime(provider: ScriptedProvider, tools: ToolRegistry) -> AgentRuntime {
    AgentRuntime::builder()
        .provider(Box::new(provider))
        .tools(tools)
        .health(Arc::new(HealthRegistry::default()))
        .build()
}

#[tokio::test]
async fn plain_answer_finishes_in_one_round() {
    let (provider, requests) = ScriptedProvider::new(vec![text_response("hello there")]);
    let runtime = runtime(provider, ToolRegistry::new());

    let response = runtime
        .run_turn(
            TurnRequest::builder()
                .system_prompt("be brief")
                .user_message("hi")
                .session_id("session-1")
                .build(),
        )
        .await
        .expect("turn");

    assert_eq!(response.message.text(), "hello there");
    assert_eq!(response.rounds, 1);
    assert!(response.tools_used.is_empty());
    assert_eq!(response.usage.total_tokens, 15);

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let messages = &requests[0].messages;
    assert_eq!(messages[0].role, Role::System);
    assert_eq!(messages.last().unwrap().text(), "hi");
    // No registered tools means no tool schemas on the wire.
    assert!(requests[0].tools.is_none());
}

#[tokio::test]
async fn tool_round_appends_exactly_one_tool_message_per_call() {
    let (provider, requests) = ScriptedProvider::new(vec![
        tool_call_response("call_1", "echo", json!({"q": 1})),
        text_response("the echo says q=1"),
    ]);
    let runtime = runtime(provider, echo_registry());

    let response = runtime
        .run_turn(
            TurnRequest::builder()
                .user_message("echo q=1")
                .session_id("session-1")
                .build(),
        )
        .await
        .expect("turn");

    assert_eq!(response.message.text(), "the echo says q=1");
    assert_eq!(response.rounds, 2);
    assert_eq!(response.tools_used, vec!["echo".to_string()]);
    assert_eq!(response.usage.total_tokens, 30);

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    let round_two = &requests[1].messages;
    let assistant = &round_two[round_two.len() - 2];
    assert_eq!(assistant.role, Role::Assistant);
    assert_eq!(assistant.tool_calls().len(), 1);
    let tool_msg = round_two.last().unwrap();
    assert_eq!(tool_msg.role, Role::Tool);
    let outcome = tool_msg.tool_results()[0];
    assert_eq!(outcome.tool_call_id, "call_1");
    assert!(!outcome.is_error);
    assert_eq!(outcome.result["echoed"]["q"], 1);
    // Tool schemas are advertised on every round.
    assert!(requests[1].tools.is_some());
}

#[tokio::test]
async fn denied_tool_call_yields_an_error_outcome_not_an_exception() {
    let (provider, requests) = ScriptedProvider::new(vec![
        tool_call_response("call_1", "echo", json!({})),
        text_response("understood, I cannot do that"),
    ]);
    let policy = ToolPolicyEngine::new();
    policy.add_policy("echo", PolicyLevel::Deny);
    let runtime = AgentRuntime::builder()
        .provider(Box::new(provider))
        .tools(echo_registry())
        .policy(policy)
        .health(Arc::new(HealthRegistry::default()))
        .build();

    let response = runtime
        .run_turn(
            TurnRequest::builder()
                .user_message("echo please")
                .session_id("session-1")
                .build(),
        )
        .await
        .expect("turn");

    // Denied tools never execute and never appear in tools_used.
    assert!(response.tools_used.is_empty());
    assert_eq!(response.rounds, 2);

    let requests = requests.lock().unwrap();
    let tool_msg = requests[1].messages.last().unwrap();
    assert_eq!(tool_msg.role, Role::Tool);
    let outcome = tool_msg.tool_results()[0];
    assert!(outcome.is_error);
    assert_eq!(outcome.result["error"], DENIED_BY_POLICY);
}

#[tokio::test]
async fn unknown_tool_yields_an_error_outcome() {
    let (provider, requests) = ScriptedProvider::new(vec![
        tool_call_response("call_1", "no_such_tool", json!({})),
        text_response("done"),
    ]);
    let runtime = runtime(provider, echo_registry());

    let response = runtime
        .run_turn(
            TurnRequest::builder()
                .user_message("go")
                .session_id("session-1")
                .build(),
        )
        .await
        .expect("turn");

    assert_eq!(response.message.text(), "done");
    let requests = requests.lock().unwrap();
    let outcome_msg = requests[1].messages.last().unwrap();
    assert!(outcome_msg.tool_results()[0].is_error);
}

#[tokio::test]
async fn round_limit_produces_fallback_message() {
    let responses: Vec<ProviderResponse> = (0..3)
        .map(|i| tool_call_response(&format!("call_{i}"), "echo", json!({})))
        .collect();
    let (provider, _) = ScriptedProvider::new(responses);
    let runtime = AgentRuntime::builder()
        .provider(Box::new(provider))
        .tools(echo_registry())
        .health(Arc::new(HealthRegistry::default()))
        .max_rounds(3)
        .build();

    let response = runtime
        .run_turn(
            TurnRequest::builder()
                .user_message("loop forever")
                .session_id("session-1")
                .build(),
        )
        .await
        .expect("round exhaustion is not an error");

    assert_eq!(response.message.text(), ROUND_LIMIT_MESSAGE);
    assert_eq!(response.rounds, 3);
    assert_eq!(response.tools_used, vec!["echo".to_string()]);
}

#[tokio::test]
async fn open_circuit_fails_fast() {
    let (provider, requests) = ScriptedProvider::new(vec![text_response("unreachable")]);
    let health = Arc::new(HealthRegistry::default());
    for _ in 0..3 {
        health.record_failure("scripted");
    }
    let runtime = AgentRuntime::builder()
        .provider(Box::new(provider))
        .health(health)
        .build();

    let err = runtime
        .run_turn(
            TurnRequest::builder()
                .user_message("hi")
                .session_id("session-1")
                .build(),
        )
        .await
        .expect_err("circuit should be open");

    assert!(matches!(err, AgentError::CircuitOpen { provider } if provider == "scripted"));
    assert!(requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn streaming_turn_forwards_deltas_and_one_final_done() {
    let (provider, _) = ScriptedProvider::new(vec![
        tool_call_response("call_1", "echo", json!({"q": 2})),
        text_response("streamed answer"),
    ]);
    let runtime = runtime(provider, echo_registry());

    let deltas: Arc<Mutex<Vec<StreamDelta>>> = Arc::new(Mutex::new(Vec::new()));
    let deltas_for_handler = deltas.clone();
    let response = runtime
        .run_turn(
            TurnRequest::builder()
                .user_message("stream it")
                .session_id("session-1")
                .on_delta(Arc::new(move |delta| {
                    deltas_for_handler.lock().unwrap().push(delta);
                }))
                .build(),
        )
        .await
        .expect("turn");

    assert_eq!(response.message.text(), "streamed answer");
    assert_eq!(response.tools_used, vec!["echo".to_string()]);

    let deltas = deltas.lock().unwrap();
    // One tool-call delta, two text chunks, exactly one done at the end.
    let done_count = deltas
        .iter()
        .filter(|d| d.event_type == StreamEventType::Done)
        .count();
    assert_eq!(done_count, 1);
    assert_eq!(deltas.last().unwrap().event_type, StreamEventType::Done);
    assert_eq!(
        deltas.last().unwrap().usage.map(|u| u.total_tokens),
        Some(30)
    );
    let text: String = deltas
        .iter()
        .filter(|d| d.event_type == StreamEventType::TextDelta)
        .map(|d| d.text.as_str())
        .collect();
    assert_eq!(text, "streamed answer");
    assert!(deltas
        .iter()
        .any(|d| d.event_type == StreamEventType::ToolCallDelta));
}

#[tokio::test]
async fn turn_system_prompt_replaces_leading_history_system_message() {
    let (provider, requests) = ScriptedProvider::new(vec![text_response("ok")]);
    let runtime = runtime(provider, ToolRegistry::new());

    runtime
        .run_turn(
            TurnRequest::builder()
                .system_prompt("new prompt")
                .history(vec![
                    agentgate::types::ChatMessage::system("old prompt"),
                    agentgate::types::ChatMessage::user("earlier"),
                    agentgate::types::ChatMessage::assistant("sure"),
                ])
                .user_message("now")
                .session_id("session-1")
                .build(),
        )
        .await
        .expect("turn");

    let requests = requests.lock().unwrap();
    let messages = &requests[0].messages;
    let system_count = messages.iter().filter(|m| m.role == Role::System).count();
    assert_eq!(system_count, 1);
    assert_eq!(messages[0].text(), "new prompt");
    assert_eq!(messages[1].text(), "earlier");
}
