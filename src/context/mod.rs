//! Context window management: truncation, progressive tool-result
//! pruning, and summarizing compaction.
//!
//! All strategies operate on the "prunable range": from the first user
//! message (bootstrap/system context before it is always protected)
//! through to the Nth-last assistant message (the most recent N assistant
//! turns and everything after them are always protected).
//!
//! Token sizes are estimated with a constant chars-per-token ratio; the
//! estimates only need to be stable, not exact.

use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{ChatMessage, ContentPart, Role};

/// Rough chars-per-token ratio used for all size estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Ratio of estimated size to context window below which pruning does
/// nothing.
pub const SOFT_PRUNE_RATIO: f64 = 0.3;

/// Ratio above which hard-clearing of tool results kicks in.
pub const HARD_CLEAR_RATIO: f64 = 0.5;

/// Protected recent assistant turns for summarizing compaction.
pub const KEEP_RECENT_SUMMARIZE: usize = 3;

/// Protected recent assistant turns for plain truncation.
pub const KEEP_RECENT_TRUNCATE: usize = 10;

/// Placeholder written over hard-cleared tool results.
pub const TOOL_RESULT_PLACEHOLDER: &str = "[old tool result cleared]";

const SUMMARY_SYSTEM_PROMPT: &str = "You summarize conversation history. Produce a compact \
summary of the following conversation excerpt, preserving facts, decisions, names, and any \
unresolved questions. Reply with the summary only.";

const MERGE_SYSTEM_PROMPT: &str = "You merge partial conversation summaries. Combine the \
following summaries into a single coherent summary, removing duplication. Reply with the \
merged summary only.";

/// Token budget per chunk handed to the summarizer.
const SUMMARY_CHUNK_TOKENS: usize = 2000;

/// Caller-supplied completion function used for summarization:
/// (system prompt, content) -> summary text.
pub type Summarizer = Arc<
    dyn Fn(String, String) -> Pin<Box<dyn Future<Output = Result<String>> + Send>> + Send + Sync,
>;

/// Outcome of a compaction pass.
///
/// When no action was needed the input is returned as `Cow::Borrowed`, so
/// callers can cheaply detect the no-op.
#[derive(Debug)]
pub struct CompactionResult<'a> {
    pub messages: Cow<'a, [ChatMessage]>,
    pub dropped: usize,
    pub summary: Option<String>,
}

impl CompactionResult<'_> {
    /// True when compaction left the input untouched.
    pub fn is_noop(&self) -> bool {
        matches!(self.messages, Cow::Borrowed(_))
    }
}

/// Estimate the token count of a text.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

fn message_chars(msg: &ChatMessage) -> usize {
    msg.content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => text.len(),
            ContentPart::Image(img) => img.data.len(),
            ContentPart::ToolCall(tc) => tc.name.len() + tc.arguments.to_string().len(),
            ContentPart::ToolResult(tr) => tr.result.to_string().len(),
        })
        .sum()
}

fn message_tokens(msg: &ChatMessage) -> usize {
    message_chars(msg).div_ceil(CHARS_PER_TOKEN)
}

fn total_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(message_tokens).sum()
}

/// Prunable index range `[start, end)`: first user message through to the
/// Nth-last assistant message. Empty when there is nothing safe to touch.
fn prunable_range(messages: &[ChatMessage], keep_recent_assistant: usize) -> (usize, usize) {
    let Some(start) = messages.iter().position(|m| m.role == Role::User) else {
        return (0, 0);
    };
    let mut seen = 0usize;
    let mut end = start;
    for (i, msg) in messages.iter().enumerate().rev() {
        if msg.role == Role::Assistant {
            seen += 1;
            if seen == keep_recent_assistant {
                end = i;
                break;
            }
        }
    }
    if seen < keep_recent_assistant {
        return (start, start);
    }
    (start, end.max(start))
}

fn truncation_marker(dropped: usize) -> ChatMessage {
    ChatMessage::system(format!(
        "[{dropped} earlier message(s) were truncated to fit the context window]"
    ))
}

/// Drop the oldest prunable messages until the history fits the budget.
///
/// Returns the input untouched (borrowed) when it already fits. When
/// messages are dropped, a single truncation marker is inserted at the
/// start of the prunable range.
pub fn truncate_history(
    messages: &[ChatMessage],
    budget_tokens: usize,
    keep_recent_assistant: usize,
) -> CompactionResult<'_> {
    if total_tokens(messages) <= budget_tokens {
        return CompactionResult {
            messages: Cow::Borrowed(messages),
            dropped: 0,
            summary: None,
        };
    }

    let (start, end) = prunable_range(messages, keep_recent_assistant);
    if start >= end {
        return CompactionResult {
            messages: Cow::Borrowed(messages),
            dropped: 0,
            summary: None,
        };
    }

    let marker_tokens = message_tokens(&truncation_marker(end - start));
    let mut dropped = 0;
    let mut size = total_tokens(messages);
    // Oldest first, never past the protected tail.
    while dropped < end - start && size + marker_tokens > budget_tokens {
        size -= message_tokens(&messages[start + dropped]);
        dropped += 1;
    }

    if dropped == 0 {
        return CompactionResult {
            messages: Cow::Borrowed(messages),
            dropped: 0,
            summary: None,
        };
    }

    tracing::debug!(dropped, budget_tokens, "truncated conversation history");

    let mut result = Vec::with_capacity(messages.len() - dropped + 1);
    result.extend_from_slice(&messages[..start]);
    result.push(truncation_marker(dropped));
    result.extend_from_slice(&messages[start + dropped..]);

    CompactionResult {
        messages: Cow::Owned(result),
        dropped,
        summary: None,
    }
}

/// Options for progressive tool-result pruning.
#[derive(Debug, Clone)]
pub struct PruneOptions {
    /// The model's context window, in tokens.
    pub context_window_tokens: usize,
    /// Ratio below which nothing happens.
    pub soft_ratio: f64,
    /// Ratio above which hard-clearing starts.
    pub hard_ratio: f64,
    /// Tool result texts longer than this get soft-trimmed.
    pub max_tool_result_chars: usize,
    /// Head/tail slice sizes kept by a soft trim.
    pub keep_head_chars: usize,
    pub keep_tail_chars: usize,
    /// Whether hard-clearing is enabled at all.
    pub hard_clear: bool,
    /// Minimum total prunable tool content before hard-clearing applies.
    pub min_prunable_chars: usize,
    /// Protected recent assistant turns.
    pub keep_recent_assistant: usize,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            context_window_tokens: 128_000,
            soft_ratio: SOFT_PRUNE_RATIO,
            hard_ratio: HARD_CLEAR_RATIO,
            max_tool_result_chars: 4000,
            keep_head_chars: 1000,
            keep_tail_chars: 1000,
            hard_clear: true,
            min_prunable_chars: 2000,
            keep_recent_assistant: KEEP_RECENT_SUMMARIZE,
        }
    }
}

fn size_ratio(messages: &[ChatMessage], window_tokens: usize) -> f64 {
    if window_tokens == 0 {
        return 1.0;
    }
    total_tokens(messages) as f64 / window_tokens as f64
}

fn tool_text(msg: &ChatMessage) -> Option<String> {
    if msg.role != Role::Tool {
        return None;
    }
    let tr = msg.tool_results().into_iter().next()?;
    Some(match &tr.result {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn replace_tool_text(msg: &ChatMessage, text: String) -> ChatMessage {
    let mut replaced = msg.clone();
    replaced.content = msg
        .content
        .iter()
        .map(|part| match part {
            ContentPart::ToolResult(tr) => ContentPart::ToolResult(crate::types::ToolOutcome {
                tool_call_id: tr.tool_call_id.clone(),
                result: serde_json::Value::String(text.clone()),
                is_error: tr.is_error,
            }),
            other => other.clone(),
        })
        .collect();
    replaced
}

/// Progressively prune tool-result content: soft-trim oversized results
/// to head+tail slices, then hard-clear them entirely if the history is
/// still too large a share of the context window.
pub fn prune_tool_results<'a>(
    messages: &'a [ChatMessage],
    options: &PruneOptions,
) -> Cow<'a, [ChatMessage]> {
    let mut ratio = size_ratio(messages, options.context_window_tokens);
    if ratio < options.soft_ratio {
        return Cow::Borrowed(messages);
    }

    let (start, end) = prunable_range(messages, options.keep_recent_assistant);
    if start >= end {
        return Cow::Borrowed(messages);
    }

    let mut work: Vec<ChatMessage> = messages.to_vec();
    let mut changed = false;

    // Pass 1: soft-trim, oldest first, recomputing the ratio after each
    // edit so we stop as soon as the history is comfortable again.
    for i in start..end {
        if ratio < options.soft_ratio {
            break;
        }
        let Some(text) = tool_text(&work[i]) else {
            continue;
        };
        if text.len() <= options.max_tool_result_chars {
            continue;
        }
        let head: String = text.chars().take(options.keep_head_chars).collect();
        let tail_count = text.chars().count().saturating_sub(options.keep_tail_chars);
        let tail: String = text.chars().skip(tail_count).collect();
        let omitted = text.len().saturating_sub(head.len() + tail.len());
        let trimmed = format!("{head}\n... [{omitted} characters trimmed] ...\n{tail}");
        work[i] = replace_tool_text(&work[i], trimmed);
        changed = true;
        ratio = size_ratio(&work, options.context_window_tokens);
    }

    // Pass 2: hard-clear whole tool results while still above the hard
    // threshold, provided there is enough prunable content to matter.
    if ratio > options.hard_ratio && options.hard_clear {
        let prunable_chars: usize = (start..end)
            .filter_map(|i| tool_text(&work[i]).map(|t| t.len()))
            .sum();
        if prunable_chars >= options.min_prunable_chars {
            for i in start..end {
                if ratio <= options.hard_ratio {
                    break;
                }
                let Some(text) = tool_text(&work[i]) else {
                    continue;
                };
                if text == TOOL_RESULT_PLACEHOLDER {
                    continue;
                }
                work[i] = replace_tool_text(&work[i], TOOL_RESULT_PLACEHOLDER.to_string());
                changed = true;
                ratio = size_ratio(&work, options.context_window_tokens);
            }
        }
    }

    if changed {
        tracing::debug!(ratio, "pruned tool results");
        Cow::Owned(work)
    } else {
        Cow::Borrowed(messages)
    }
}

fn render_for_summary(msg: &ChatMessage) -> String {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut body = msg.text();
    for tc in msg.tool_calls() {
        body.push_str(&format!(" [called {}]", tc.name));
    }
    for tr in msg.tool_results() {
        let text = match &tr.result {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        body.push_str(&text);
    }
    format!("{role}: {body}")
}

/// Compact history, summarizing dropped messages when a summarizer is
/// configured.
///
/// Messages slated for drop are chunked by a token budget, each chunk is
/// summarized with a fixed prompt, and multiple partial summaries are
/// merged with a second call. Any failure degrades to a plain truncation
/// marker; this function never returns an error to the runtime.
pub async fn compact_history<'a>(
    messages: &'a [ChatMessage],
    budget_tokens: usize,
    keep_recent_assistant: usize,
    summarizer: Option<&Summarizer>,
) -> CompactionResult<'a> {
    let truncated = truncate_history(messages, budget_tokens, keep_recent_assistant);
    if truncated.is_noop() || truncated.dropped == 0 {
        return truncated;
    }
    let Some(summarizer) = summarizer else {
        return truncated;
    };

    let (start, _) = prunable_range(messages, keep_recent_assistant);
    let dropped = truncated.dropped;
    let to_summarize = &messages[start..start + dropped];

    match summarize_messages(to_summarize, summarizer).await {
        Ok(summary) => {
            let mut result = Vec::with_capacity(messages.len() - dropped + 1);
            result.extend_from_slice(&messages[..start]);
            result.push(ChatMessage::system(format!(
                "Summary of {dropped} earlier message(s): {summary}"
            )));
            result.extend_from_slice(&messages[start + dropped..]);
            CompactionResult {
                messages: Cow::Owned(result),
                dropped,
                summary: Some(summary),
            }
        }
        Err(e) => {
            // Summarization is best-effort; fall back to the marker.
            tracing::warn!(error = %e, "summarization failed, falling back to truncation");
            truncated
        }
    }
}

async fn summarize_messages(messages: &[ChatMessage], summarizer: &Summarizer) -> Result<String> {
    // Chunk by token budget so each summarizer call stays small.
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0usize;
    for msg in messages {
        let rendered = render_for_summary(msg);
        let tokens = estimate_tokens(&rendered);
        if current_tokens + tokens > SUMMARY_CHUNK_TOKENS && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push_str(&rendered);
        current.push('\n');
        current_tokens += tokens;
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    let mut partials = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        partials.push(summarizer(SUMMARY_SYSTEM_PROMPT.to_string(), chunk).await?);
    }

    match partials.len() {
        0 => Ok(String::new()),
        1 => Ok(partials.remove(0)),
        _ => summarizer(MERGE_SYSTEM_PROMPT.to_string(), partials.join("\n\n")).await,
    }
}
