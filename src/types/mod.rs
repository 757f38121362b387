//! Core types shared across the crate.

pub mod generation;
pub mod message;
pub mod stream;
pub mod usage;

pub use generation::{FinishReason, GenerationSettings};
pub use message::{ChatMessage, ContentPart, ImageContent, Role, ToolCallRequest, ToolOutcome};
pub use stream::{StreamDelta, StreamEventType};
pub use usage::Usage;
