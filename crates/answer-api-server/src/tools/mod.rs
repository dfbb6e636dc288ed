pub mod custom;
pub mod search_tool;

use anyhow::Result;
use async_trait::async_trait;
use search_shared::llm::ToolDefinition;

use crate::answer::LlmDoc;

pub use custom::{CustomTool, MethodSpec};
pub use search_tool::SearchTool;

/// What a tool hands back to the answer engine. Search-like tools also
/// surface the documents backing the response so the citation stream can
/// reference them.
#[derive(Debug, Default)]
pub struct ToolOutput {
    /// Body shown to the LLM as the tool result.
    pub response: serde_json::Value,
    /// Documents in the order the LLM will cite them.
    pub context_docs: Option<Vec<LlmDoc>>,
    /// Documents in the order the user sees them, when that differs.
    pub display_docs: Option<Vec<LlmDoc>>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn definition(&self) -> ToolDefinition;

    async fn run(&self, args: &serde_json::Value) -> Result<ToolOutput>;
}
