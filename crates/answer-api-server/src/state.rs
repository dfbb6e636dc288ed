use std::sync::Arc;

use search_shared::index::DocumentIndex;
use search_shared::llm::{LlmClient, LlmLimiter};

use crate::answer::AnswerEngine;
use crate::auth::GraphClient;
use crate::config::Settings;
use crate::db::ChatRepository;
use crate::retrieval::{QueryEmbedder, RetrievalPipeline};
use crate::summary::ChatSummarizer;

/// Shared handles for the axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub repository: Arc<ChatRepository>,
    pub index: Arc<dyn DocumentIndex>,
    pub embedder: Arc<dyn QueryEmbedder>,
    pub llm: Arc<dyn LlmClient>,
    pub fast_llm: Arc<dyn LlmClient>,
    pub limiter: LlmLimiter,
    pub retrieval: Arc<RetrievalPipeline>,
    pub engine: Arc<AnswerEngine>,
    pub summarizer: Arc<ChatSummarizer>,
    pub graph: Option<Arc<GraphClient>>,
}
