//! Agent runtime: the per-turn orchestration loop.
//!
//! A turn takes one user message plus prior history, runs bounded
//! model/tool rounds against a single provider adapter, and produces the
//! final assistant message together with the list of tools used. Channel
//! I/O lives outside this crate; deltas are forwarded through an optional
//! callback.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;

use crate::context::{self, Summarizer, KEEP_RECENT_SUMMARIZE};
use crate::error::{AgentError, Result};
use crate::health::HealthRegistry;
use crate::policy::ToolPolicyEngine;
use crate::provider::{ChatProvider, ProviderRequest, ProviderResponse};
use crate::tools::ToolRegistry;
use crate::types::{
    ChatMessage, FinishReason, GenerationSettings, Role, StreamDelta, StreamEventType, ToolOutcome,
    Usage,
};

/// Upper bound on model/tool rounds within one turn.
pub const MAX_ROUNDS: usize = 10;

/// Default context budget handed to history compaction, in tokens.
pub const DEFAULT_CONTEXT_BUDGET_TOKENS: usize = 100_000;

/// Assistant text returned when the round limit is hit before the model
/// produces a final answer.
pub const ROUND_LIMIT_MESSAGE: &str =
    "I couldn't finish this request within the allowed number of tool rounds. \
Please try rephrasing or splitting it into smaller steps.";

/// Callback invoked for every streamed delta.
pub type DeltaHandler = Arc<dyn Fn(StreamDelta) + Send + Sync>;

/// One turn's input.
#[derive(bon::Builder)]
pub struct TurnRequest {
    /// System prompt for this turn. Takes precedence over any leading
    /// system message in `history`.
    #[builder(into)]
    pub system_prompt: Option<String>,
    /// Prior conversation history, oldest first.
    #[builder(default)]
    pub history: Vec<ChatMessage>,
    /// The new user message.
    #[builder(into)]
    pub user_message: String,
    /// Session identifier passed through to tools. Generated when the
    /// channel does not supply one.
    #[builder(into, default = uuid::Uuid::new_v4().to_string())]
    pub session_id: String,
    /// Sampling settings; adapter defaults apply when absent.
    pub settings: Option<GenerationSettings>,
    /// When set, the turn streams and every delta is forwarded here.
    pub on_delta: Option<DeltaHandler>,
}

/// One turn's output.
#[derive(Debug, Clone)]
pub struct TurnResponse {
    /// The final assistant message.
    pub message: ChatMessage,
    /// Distinct tool names executed this turn, in first-use order.
    pub tools_used: Vec<String>,
    /// Number of model rounds consumed.
    pub rounds: usize,
    /// Token usage accumulated across all rounds.
    pub usage: Usage,
}

/// The orchestration core binding one provider adapter to a tool registry
/// and policy engine.
#[derive(bon::Builder)]
pub struct AgentRuntime {
    provider: Box<dyn ChatProvider>,
    #[builder(default)]
    tools: ToolRegistry,
    #[builder(default)]
    policy: ToolPolicyEngine,
    health: Arc<HealthRegistry>,
    #[builder(default = MAX_ROUNDS)]
    max_rounds: usize,
    #[builder(default = DEFAULT_CONTEXT_BUDGET_TOKENS)]
    context_budget_tokens: usize,
    /// Optional summarizer used when history must be compacted.
    summarizer: Option<Summarizer>,
}

impl AgentRuntime {
    /// Run one turn to completion.
    ///
    /// Fails fast when the provider's circuit is open. Hitting the round
    /// limit is not an error; it yields a fixed fallback message.
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnResponse> {
        let provider_name = self.provider.provider_name();
        if !self.health.is_available(provider_name) {
            return Err(AgentError::CircuitOpen {
                provider: provider_name.to_string(),
            });
        }

        let mut messages = self.assemble_messages(&request).await;
        let settings = request.settings.clone().unwrap_or_default();
        let tool_schemas = if self.tools.is_empty() {
            None
        } else {
            Some(self.tools.schemas())
        };

        let mut tools_used: Vec<String> = Vec::new();
        let mut total_usage = Usage::default();
        let mut last_finish = None;

        for round in 1..=self.max_rounds {
            let provider_request = ProviderRequest {
                messages: messages.clone(),
                settings: settings.clone(),
                tools: tool_schemas.clone(),
            };

            let started = Instant::now();
            let response = match &request.on_delta {
                Some(on_delta) => self.stream_round(&provider_request, on_delta).await?,
                None => self.provider.complete(&provider_request).await?,
            };
            total_usage.add(&response.usage);
            last_finish = response.finish_reason;

            tracing::info!(
                provider = provider_name,
                model = self.provider.model_id(),
                round,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                finish_reason = ?response.finish_reason,
                tool_calls = response.tool_calls.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "model round complete"
            );

            if response.tool_calls.is_empty() {
                let message = ChatMessage::assistant(response.text.clone());
                self.finish_stream(&request, last_finish, &total_usage);
                return Ok(TurnResponse {
                    message,
                    tools_used,
                    rounds: round,
                    usage: total_usage,
                });
            }

            // Tool round: append the assistant request, then exactly one
            // tool message per call, in call order.
            messages.push(response.to_message());
            for call in &response.tool_calls {
                let decision = self.policy.check(&call.name, &call.arguments).await;
                let outcome = if decision.allowed {
                    if !tools_used.contains(&call.name) {
                        tools_used.push(call.name.clone());
                    }
                    self.tools
                        .execute_all(std::slice::from_ref(call), &request.session_id)
                        .await
                        .into_iter()
                        .next()
                        .unwrap_or_else(|| ToolOutcome {
                            tool_call_id: call.id.clone(),
                            result: serde_json::json!({ "error": "no outcome produced" }),
                            is_error: true,
                        })
                } else {
                    let reason = decision
                        .reason
                        .unwrap_or_else(|| crate::policy::DENIED_BY_POLICY.to_string());
                    tracing::info!(tool = %call.name, %reason, "tool call rejected");
                    ToolOutcome {
                        tool_call_id: call.id.clone(),
                        result: serde_json::json!({ "error": reason }),
                        is_error: true,
                    }
                };
                messages.push(ChatMessage::tool_result(
                    outcome.tool_call_id.clone(),
                    outcome.result.clone(),
                    outcome.is_error,
                ));
            }
        }

        tracing::warn!(
            provider = provider_name,
            max_rounds = self.max_rounds,
            "round limit reached without a final answer"
        );
        self.finish_stream(&request, last_finish, &total_usage);
        Ok(TurnResponse {
            message: ChatMessage::assistant(ROUND_LIMIT_MESSAGE),
            tools_used,
            rounds: self.max_rounds,
            usage: total_usage,
        })
    }

    /// Build the message list for this turn: at most one system message at
    /// the start, then history, then the new user message, compacted to
    /// the context budget.
    async fn assemble_messages(&self, request: &TurnRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        let mut history = request.history.as_slice();

        match &request.system_prompt {
            Some(prompt) => {
                messages.push(ChatMessage::system(prompt.clone()));
                // The turn's prompt replaces a leading history system message.
                if history.first().map(|m| m.role) == Some(Role::System) {
                    history = &history[1..];
                }
            }
            None => {}
        }
        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(request.user_message.clone()));

        let compacted = context::compact_history(
            &messages,
            self.context_budget_tokens,
            KEEP_RECENT_SUMMARIZE,
            self.summarizer.as_ref(),
        )
        .await;
        if compacted.is_noop() {
            drop(compacted);
            return messages;
        }
        compacted.messages.into_owned()
    }

    /// Consume one round's stream, forwarding deltas and accumulating the
    /// equivalent of a non-streaming response.
    async fn stream_round(
        &self,
        provider_request: &ProviderRequest,
        on_delta: &DeltaHandler,
    ) -> Result<ProviderResponse> {
        let mut stream = self.provider.stream(provider_request).await?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut finish_reason = None;
        let mut usage = Usage::default();

        while let Some(delta) = stream.next().await {
            let delta = delta?;
            match delta.event_type {
                StreamEventType::TextDelta => {
                    text.push_str(&delta.text);
                    on_delta(delta);
                }
                StreamEventType::ToolCallDelta => {
                    if let Some(call) = &delta.tool_call {
                        tool_calls.push(call.clone());
                    }
                    on_delta(delta);
                }
                StreamEventType::Done => {
                    finish_reason = delta.finish_reason;
                    if let Some(u) = &delta.usage {
                        usage.add(u);
                    }
                    // Per-round done events are swallowed; one turn-level
                    // done is emitted when the turn completes.
                }
                StreamEventType::Start | StreamEventType::Error => {}
            }
        }

        Ok(ProviderResponse {
            text,
            usage,
            tool_calls,
            finish_reason,
        })
    }

    /// Emit the single turn-level done delta for streaming turns.
    fn finish_stream(
        &self,
        request: &TurnRequest,
        finish_reason: Option<FinishReason>,
        usage: &Usage,
    ) {
        if let Some(on_delta) = &request.on_delta {
            on_delta(StreamDelta::done(finish_reason, Some(*usage)));
        }
    }
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("provider", &self.provider.provider_name())
            .field("model", &self.provider.model_id())
            .field("tools", &self.tools)
            .field("max_rounds", &self.max_rounds)
            .finish()
    }
}
