pub mod client;
pub mod retry;
pub mod types;

pub use client::{LlmClient, LlmStream, OpenAiCompatClient, ToolCallAccumulator};
pub use retry::{retry_with_backoff, LlmLimiter, RetryPolicy};
pub use types::{
    LlmConfig, LlmError, LlmMessage, LlmRole, StreamDelta, ToolCall, ToolCallDelta, ToolChoice,
    ToolDefinition,
};
