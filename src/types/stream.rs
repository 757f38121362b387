//! Streaming types.

use serde::{Deserialize, Serialize};

use super::generation::FinishReason;
use super::message::ToolCallRequest;
use super::usage::Usage;

/// A delta emitted during streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDelta {
    /// The incremental text chunk.
    pub text: String,
    /// Event type.
    pub event_type: StreamEventType,
    /// Completed tool call (only on `ToolCallDelta` events once the call
    /// has fully accumulated).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallRequest>,
    /// Finish reason (only on the final delta).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Usage (typically only on the final delta).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamDelta {
    pub fn text_delta(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            event_type: StreamEventType::TextDelta,
            tool_call: None,
            finish_reason: None,
            usage: None,
        }
    }

    pub fn tool_call(call: ToolCallRequest) -> Self {
        Self {
            text: String::new(),
            event_type: StreamEventType::ToolCallDelta,
            tool_call: Some(call),
            finish_reason: None,
            usage: None,
        }
    }

    pub fn done(finish_reason: Option<FinishReason>, usage: Option<Usage>) -> Self {
        Self {
            text: String::new(),
            event_type: StreamEventType::Done,
            tool_call: None,
            finish_reason,
            usage,
        }
    }
}

/// Type of stream event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    /// Incremental text content.
    TextDelta,
    /// A tool call finished accumulating.
    ToolCallDelta,
    /// Stream started.
    Start,
    /// Stream finished.
    Done,
    /// Error during stream.
    Error,
}
