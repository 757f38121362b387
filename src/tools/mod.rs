//! Tool trait and registry.
//!
//! Individual tools (weather, QR, finance lookups, ...) live outside this
//! crate; they plug in through the [`Tool`] trait. The registry resolves
//! names to handlers and runs them, turning every failure into an
//! `is_error` outcome so the conversation can continue coherently.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AgentError;
use crate::provider::ToolDefinition;
use crate::types::{ToolCallRequest, ToolOutcome};

/// Core tool trait — implement to expose a callable function to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match what the model calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for the arguments.
    fn parameters(&self) -> serde_json::Value;

    /// Execute the tool.
    async fn execute(
        &self,
        args: serde_json::Value,
        session_id: &str,
    ) -> Result<serde_json::Value, AgentError>;
}

/// Type alias for the closure-backed tool handler.
type ToolHandler = dyn Fn(
        serde_json::Value,
        String,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, AgentError>> + Send>>
    + Send
    + Sync;

/// Closure-based tool for quick registration.
pub struct FnTool {
    name: String,
    description: String,
    parameters: serde_json::Value,
    handler: Arc<ToolHandler>,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        handler: F,
    ) -> Self
    where
        F: Fn(serde_json::Value, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, AgentError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |args, session| Box::pin(handler(args, session))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        self.parameters.clone()
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        session_id: &str,
    ) -> Result<serde_json::Value, AgentError> {
        (self.handler)(args, session_id.to_string()).await
    }
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// Registry resolving tool names to handlers.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any existing tool of the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool schemas to advertise to the provider.
    pub fn schemas(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a batch of tool calls sequentially, in call order.
    ///
    /// Unknown tools and execution failures become `is_error` outcomes,
    /// never errors; the runtime appends every outcome as a tool message.
    pub async fn execute_all(
        &self,
        calls: &[ToolCallRequest],
        session_id: &str,
    ) -> Vec<ToolOutcome> {
        let mut outcomes = Vec::with_capacity(calls.len());
        for call in calls {
            let outcome = match self.tools.get(&call.name) {
                Some(tool) => match tool.execute(call.arguments.clone(), session_id).await {
                    Ok(result) => ToolOutcome {
                        tool_call_id: call.id.clone(),
                        result,
                        is_error: false,
                    },
                    Err(e) => {
                        tracing::warn!(tool = %call.name, error = %e, "tool execution failed");
                        ToolOutcome {
                            tool_call_id: call.id.clone(),
                            result: serde_json::json!({ "error": e.to_string() }),
                            is_error: true,
                        }
                    }
                },
                None => ToolOutcome {
                    tool_call_id: call.id.clone(),
                    result: serde_json::json!({
                        "error": format!("Tool '{}' not found", call.name)
                    }),
                    is_error: true,
                },
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}
