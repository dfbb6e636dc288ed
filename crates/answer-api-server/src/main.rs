use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use search_shared::index::HttpDocumentIndex;
use search_shared::llm::{LlmConfig, LlmLimiter, OpenAiCompatClient};
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use answer_api_server::answer::AnswerEngine;
use answer_api_server::auth::{GraphClient, OidcBridge};
use answer_api_server::config::Settings;
use answer_api_server::db::ChatRepository;
use answer_api_server::handlers;
use answer_api_server::retrieval::{HttpQueryEmbedder, RetrievalPipeline};
use answer_api_server::state::AppState;
use answer_api_server::summary::ChatSummarizer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::load()?;
    info!("Starting answer API server");

    let pool = PgPoolOptions::new()
        .max_connections(settings.database.pool_max_size)
        .acquire_timeout(Duration::from_secs(settings.database.pool_timeout_seconds))
        .connect(&settings.database.url)
        .await?;
    let repository = Arc::new(ChatRepository::new(pool));

    let index = Arc::new(HttpDocumentIndex::new(
        settings.index_engine.base_url.clone(),
        Duration::from_secs(settings.index_engine.timeout_seconds),
    ));
    let embedder = Arc::new(HttpQueryEmbedder::new(
        settings.embedding.base_url.clone(),
        Duration::from_secs(settings.embedding.timeout_seconds),
    ));

    let llm = Arc::new(OpenAiCompatClient::new(
        settings.llm.base_url.clone(),
        settings.llm.api_key.clone(),
        LlmConfig {
            model_name: settings.llm.model_name.clone(),
            max_input_tokens: settings.llm.max_input_tokens,
            supports_tool_calling: settings.llm.supports_tool_calling,
        },
        Duration::from_secs(settings.llm.timeout_seconds),
        0.2,
    ));
    let fast_llm = Arc::new(OpenAiCompatClient::new(
        settings.llm.base_url.clone(),
        settings.llm.api_key.clone(),
        LlmConfig {
            model_name: settings.llm.fast_model_name.clone(),
            max_input_tokens: settings.llm.max_input_tokens,
            supports_tool_calling: false,
        },
        Duration::from_secs(settings.llm.timeout_seconds),
        0.0,
    ));

    let limiter = LlmLimiter::new(settings.llm.concurrency, Duration::from_secs(120));

    let access_lookup: Arc<dyn answer_api_server::retrieval::censor::AccessLookup> = Arc::new(
        answer_api_server::retrieval::censor::SqlAccessLookup::new(repository.pool().clone()),
    );
    let retrieval = Arc::new(RetrievalPipeline::new(
        index.clone(),
        embedder.clone(),
        llm.clone(),
        fast_llm.clone(),
        limiter.clone(),
        Some(access_lookup),
        settings.retrieval.clone(),
    ));

    let engine = Arc::new(AnswerEngine::new(llm.clone(), limiter.clone()));
    let summarizer = Arc::new(ChatSummarizer::new(
        index.clone(),
        embedder.clone(),
        fast_llm.clone(),
        settings.chat.summarization_threshold,
    ));

    let graph = match settings.oidc.clone() {
        Some(oidc_config) => {
            let graph_base = oidc_config.graph_base_url.clone();
            Some(Arc::new(GraphClient::new(
                OidcBridge::new(oidc_config)?,
                graph_base,
            )))
        }
        None => None,
    };

    let state = AppState {
        settings: settings.clone(),
        repository,
        index,
        embedder,
        llm,
        fast_llm,
        limiter,
        retrieval,
        engine,
        summarizer,
        graph,
    };

    let app = Router::new()
        .route("/api/health", get(handlers::health::health))
        .route("/api/chat", post(handlers::chat::chat))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
