//! Tool invocation policy.
//!
//! Decides per tool name whether a call is auto-allowed, needs external
//! approval, or is denied. Approval is delegated to a caller-supplied
//! async handler (e.g. a confirmation prompt in the chat channel) and
//! bounded by a timeout; the handler itself is not cancelled when the
//! timeout fires, only the policy decision resolves to denied.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reason string used for both explicit denials and confirm-without-handler.
pub const DENIED_BY_POLICY: &str = "Tool denied by policy";
/// Reason string used when the approval handler does not settle in time.
pub const APPROVAL_TIMED_OUT: &str = "Approval timed out";

const APPROVAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Policy level for one tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyLevel {
    Allow,
    Confirm,
    Deny,
}

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn denied(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Async approval callback: (tool name, arguments) -> approved?
pub type ApprovalHandler = Arc<
    dyn Fn(String, serde_json::Value) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync,
>;

/// Per-tool policy engine.
///
/// Policies and the approval handler can be changed at runtime; a handler
/// swap affects only checks made after the swap.
#[derive(Clone)]
pub struct ToolPolicyEngine {
    policies: Arc<RwLock<HashMap<String, PolicyLevel>>>,
    approval: Arc<RwLock<Option<ApprovalHandler>>>,
    approval_timeout: Duration,
}

impl Default for ToolPolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolPolicyEngine {
    pub fn new() -> Self {
        Self {
            policies: Arc::new(RwLock::new(HashMap::new())),
            approval: Arc::new(RwLock::new(None)),
            approval_timeout: APPROVAL_TIMEOUT,
        }
    }

    /// Set or overwrite the policy for a tool.
    pub fn add_policy(&self, tool: impl Into<String>, level: PolicyLevel) {
        if let Ok(mut policies) = self.policies.write() {
            policies.insert(tool.into(), level);
        }
    }

    /// Remove a tool's policy; returns whether an entry existed.
    pub fn remove_policy(&self, tool: &str) -> bool {
        self.policies
            .write()
            .map(|mut policies| policies.remove(tool).is_some())
            .unwrap_or(false)
    }

    /// Policy level for a tool. Unregistered tools default to `Allow`.
    pub fn policy_for(&self, tool: &str) -> PolicyLevel {
        self.policies
            .read()
            .ok()
            .and_then(|policies| policies.get(tool).copied())
            .unwrap_or(PolicyLevel::Allow)
    }

    /// Replace the approval handler. Affects only checks made afterwards.
    pub fn set_approval_handler(&self, handler: Option<ApprovalHandler>) {
        if let Ok(mut approval) = self.approval.write() {
            *approval = handler;
        }
    }

    /// Convenience wrapper for closure handlers.
    pub fn on_approval<F, Fut>(&self, handler: F)
    where
        F: Fn(String, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.set_approval_handler(Some(Arc::new(move |name, args| {
            Box::pin(handler(name, args))
        })));
    }

    /// Check whether a tool call may proceed.
    pub async fn check(&self, tool: &str, args: &serde_json::Value) -> PolicyDecision {
        match self.policy_for(tool) {
            PolicyLevel::Allow => PolicyDecision::allowed(),
            PolicyLevel::Deny => {
                tracing::debug!(tool, "tool call denied by policy");
                PolicyDecision::denied(DENIED_BY_POLICY)
            }
            PolicyLevel::Confirm => {
                let handler = self
                    .approval
                    .read()
                    .ok()
                    .and_then(|approval| approval.clone());
                let Some(handler) = handler else {
                    // Confirm without a registered handler behaves like deny.
                    tracing::debug!(tool, "confirm policy with no approval handler");
                    return PolicyDecision::denied(DENIED_BY_POLICY);
                };

                let fut = handler(tool.to_string(), args.clone());
                match tokio::time::timeout(self.approval_timeout, fut).await {
                    Ok(true) => PolicyDecision::allowed(),
                    Ok(false) => PolicyDecision::denied(DENIED_BY_POLICY),
                    Err(_) => {
                        tracing::warn!(tool, "tool approval timed out");
                        PolicyDecision::denied(APPROVAL_TIMED_OUT)
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ToolPolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolPolicyEngine")
            .field("policies", &self.policies)
            .field(
                "approval",
                &self
                    .approval
                    .read()
                    .map(|approval| approval.is_some())
                    .unwrap_or(false),
            )
            .finish()
    }
}
