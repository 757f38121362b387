//! Agentgate — agent orchestration core for chat-channel LLM gateways.
//!
//! Provides the provider-facing half of a messaging gateway: adapters for
//! OpenAI-compatible, Anthropic, and AWS Bedrock backends with unified
//! streaming, a per-provider circuit breaker, bounded retries, a tool
//! policy engine, context window management, and the bounded model/tool
//! round loop that drives one conversation turn.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use agentgate::prelude::*;
//!
//! # async fn example() -> agentgate::error::Result<()> {
//! let config = GatewayConfig::from_env();
//! let health = Arc::new(HealthRegistry::default());
//! let kind = ProviderKind::OpenAi { model: "gpt-4o".into(), base_url: None };
//! let provider = agentgate::provider::create_provider(
//!     &kind, &config, health.clone(), RetryPolicy::default(),
//! )?;
//!
//! let runtime = AgentRuntime::builder()
//!     .provider(provider)
//!     .health(health)
//!     .build();
//! let response = runtime
//!     .run_turn(
//!         TurnRequest::builder()
//!             .user_message("What's the weather in Tokyo?")
//!             .session_id("session-1")
//!             .build(),
//!     )
//!     .await?;
//! println!("{}", response.message.text());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod policy;
pub mod prelude;
pub mod provider;
pub mod retry;
pub mod runtime;
pub mod tools;
pub mod types;
