//! Convenience re-exports for common use.

pub use crate::config::GatewayConfig;
pub use crate::error::{AgentError, Result};
pub use crate::health::{CircuitState, HealthRegistry};
pub use crate::policy::{PolicyLevel, ToolPolicyEngine};
pub use crate::provider::{ChatProvider, ProviderKind, ProviderRequest, ProviderResponse};
pub use crate::retry::RetryPolicy;
pub use crate::runtime::{AgentRuntime, TurnRequest, TurnResponse};
pub use crate::tools::{FnTool, Tool, ToolRegistry};
pub use crate::types::{
    ChatMessage, ContentPart, FinishReason, GenerationSettings, Role, StreamDelta,
    StreamEventType, ToolCallRequest, ToolOutcome, Usage,
};
