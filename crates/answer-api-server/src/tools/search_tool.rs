use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use search_shared::index::IndexFilters;
use search_shared::llm::{LlmMessage, ToolDefinition};
use tracing::info;

use crate::answer::{llm_docs_from_chunks, LlmDoc};
use crate::retrieval::{RetrievalPipeline, RetrievalRequest};

use super::{Tool, ToolOutput};

pub const SEARCH_TOOL_NAME: &str = "run_search";

/// The internal search tool: retrieval pipeline exposed to the LLM.
pub struct SearchTool {
    pipeline: Arc<RetrievalPipeline>,
    filters: IndexFilters,
    history: Vec<LlmMessage>,
    user_email: Option<String>,
    user_group_ids: Vec<String>,
    description: String,
}

impl SearchTool {
    pub fn new(
        pipeline: Arc<RetrievalPipeline>,
        filters: IndexFilters,
        history: Vec<LlmMessage>,
        user_email: Option<String>,
        user_group_ids: Vec<String>,
        description: Option<String>,
    ) -> Self {
        Self {
            pipeline,
            filters,
            history,
            user_email,
            user_group_ids,
            description: description.unwrap_or_else(|| {
                "Search the organization's indexed documents for information relevant to a query."
                    .to_string()
            }),
        }
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        SEARCH_TOOL_NAME
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: SEARCH_TOOL_NAME.to_string(),
            description: self.description.clone(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "What to search for",
                    },
                },
                "required": ["query"],
            }),
        }
    }

    async fn run(&self, args: &serde_json::Value) -> Result<ToolOutput> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("search tool needs a 'query' argument"))?;

        let chunks = self
            .pipeline
            .retrieve(&RetrievalRequest {
                query: query.to_string(),
                history: self.history.clone(),
                filters: self.filters.clone(),
                user_email: self.user_email.clone(),
                user_group_ids: self.user_group_ids.clone(),
                skip_rerank: false,
                skip_llm_relevance: false,
            })
            .await?;

        let docs: Vec<LlmDoc> = llm_docs_from_chunks(&chunks);
        info!("Search tool returned {} documents for '{}'", docs.len(), query);

        // The LLM sees numbered sections it can cite by rank
        let numbered: Vec<serde_json::Value> = docs
            .iter()
            .enumerate()
            .map(|(idx, doc)| {
                serde_json::json!({
                    "number": idx + 1,
                    "title": doc.semantic_identifier,
                    "source": doc.source.as_str(),
                    "content": doc.content,
                })
            })
            .collect();

        Ok(ToolOutput {
            response: serde_json::json!({ "search_results": numbered }),
            display_docs: Some(docs.clone()),
            context_docs: Some(docs),
        })
    }
}
