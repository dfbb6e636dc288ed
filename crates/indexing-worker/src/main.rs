use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use search_shared::http::{HttpPoolConfig, RateLimitedClient};
use search_shared::index::HttpDocumentIndex;
use search_shared::kv::{KvStore, RedisKv};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use indexing_worker::config::Settings;
use indexing_worker::connectors::registry::ConnectorDeps;
use indexing_worker::coordination::{CoordinationRepository, FenceManager, FenceValidator};
use indexing_worker::extract::ContentExtractor;
use indexing_worker::image::ImageProcessorClient;
use indexing_worker::indexing::{Chunker, HttpEmbedder, IndexingPipeline};
use indexing_worker::permissions::{PermissionStore, PermissionSyncScheduler};
use indexing_worker::scheduler::{IndexingScheduler, TaskDispatcher};
use indexing_worker::utils::logger::init_logging;
use indexing_worker::worker::{AttemptProcessor, IndexingWorker};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let settings = Settings::load()?;

    info!("Starting indexing worker");

    let pool = PgPoolOptions::new()
        .max_connections(settings.database.pool_max_size)
        .acquire_timeout(std::time::Duration::from_secs(
            settings.database.pool_timeout_seconds,
        ))
        .connect(&settings.database.url)
        .await?;

    let kv: Arc<dyn KvStore> = Arc::new(RedisKv::connect(&settings.kv.url).await?);
    let repository = Arc::new(CoordinationRepository::new(pool.clone()));
    let fences = Arc::new(FenceManager::with_grace_period(
        kv.clone(),
        std::time::Duration::from_secs(settings.scheduler.fence_grace_period_seconds),
    ));

    let http = Arc::new(RateLimitedClient::new(HttpPoolConfig::default()));
    let extractor = Arc::new(ContentExtractor::new(None, true));
    let image_processor = if settings.image_server.enabled {
        Some(Arc::new(ImageProcessorClient::new(
            &settings.image_server,
            std::env::var("CLAUDE_API_KEY").ok(),
        )))
    } else {
        None
    };

    let deps = Arc::new(ConnectorDeps {
        http,
        extractor,
        image_processor,
        file_store_root: PathBuf::from(
            std::env::var("FILE_STORE_ROOT").unwrap_or_else(|_| "file_store".to_string()),
        ),
        batch_size: settings.worker.index_batch_size,
        settings: settings.clone(),
    });

    let current_settings = repository.current_search_settings().await?;
    let chunker = Chunker::new(
        current_settings.max_seq_length as usize,
        settings.embedding.chunk_token_buffer,
        true,
    );
    let embedder = Arc::new(HttpEmbedder::new(&settings.embedding));
    let index = Arc::new(HttpDocumentIndex::new(
        settings.index_engine.base_url.clone(),
        std::time::Duration::from_secs(settings.index_engine.timeout_seconds),
    ));
    let pipeline = Arc::new(IndexingPipeline::new(chunker, embedder, index, true));

    let processor = Arc::new(AttemptProcessor::new(
        repository.clone(),
        kv.clone(),
        fences.clone(),
        pipeline,
        deps.clone(),
        settings.clone(),
    ));

    // Scheduler beat
    let dispatcher = TaskDispatcher::new(repository.clone(), kv.clone(), fences.clone());
    let validator = FenceValidator::new(fences.clone(), kv.clone(), repository.clone());
    let scheduler = IndexingScheduler::new(repository.clone(), dispatcher, validator, &settings);
    tokio::spawn(scheduler.run());

    // Permission sync beat
    let permission_store = Arc::new(PermissionStore::new(pool));
    let permission_scheduler =
        PermissionSyncScheduler::new(repository, permission_store, deps, &settings);
    tokio::spawn(permission_scheduler.run());

    // Task consumption in the foreground until shutdown
    let worker = IndexingWorker::new(kv, processor, &settings);
    worker.run().await
}
