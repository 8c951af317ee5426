mod cache;
mod config;
mod error;
mod filter;
mod generator;
mod lance_store;
mod llm;
mod model;
mod pipeline;
mod prompt;
mod retrieval;
mod server;
mod store;
mod update;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use rmcp::{ServiceExt, transport::stdio};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use agent_common::embedding::{LocalEmbedder, OpenAiEmbedder, TextEmbedder};
use agent_common::openai::{OpenAiClient, OpenAiClientConfig};
use agent_common::redis::RedisCache;
use agent_common::vectordb::VectorDb;

use cache::{AgentCache, CachedEmbedder};
use config::{Config, EmbeddingBackend, StoreBackend};
use lance_store::LanceGuidelineStore;
use llm::Decoding;
use pipeline::{AgentSettings, GuidelineAgent};
use server::GuidelineAgentServer;
use store::{GuidelineStore, MemoryGuidelineStore};
use update::UpdateService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries MCP JSON-RPC, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("starting guideline-agent MCP server");

    // 1. Load config from environment
    let config = Config::from_env()?;
    info!(
        model = %config.model,
        store = ?config.store_backend,
        embedding = ?config.embedding_backend,
        redis = config.redis_url.is_some(),
        "configuration loaded"
    );

    // 2. Connect to Redis (optional)
    let redis_cache = RedisCache::new(config.redis_url.as_deref());
    if redis_cache.is_available().await {
        info!("redis connected");
    } else {
        info!("redis unavailable, running without cache");
    }
    let cache = Arc::new(AgentCache::new(redis_cache));

    // 3. Model provider and embedder
    let client = Arc::new(OpenAiClient::new(OpenAiClientConfig::from_env())?);
    let base_embedder: Arc<dyn TextEmbedder> = match config.embedding_backend {
        EmbeddingBackend::OpenAi => Arc::new(OpenAiEmbedder::new(
            Arc::clone(&client),
            config.embedding_model.clone(),
            config.embedding_dimensions,
        )),
        EmbeddingBackend::Local => {
            info!("initializing local embedding model (may download on first run)");
            Arc::new(LocalEmbedder::new().await?)
        }
    };
    let embedder: Arc<dyn TextEmbedder> =
        Arc::new(CachedEmbedder::new(base_embedder, Arc::clone(&cache)));
    info!(model = embedder.model_id(), dimensions = embedder.dimensions(), "embedder ready");

    // 4. Guideline store
    let store: Arc<dyn GuidelineStore> = match (config.store_backend, config.lancedb_path.as_deref()) {
        (StoreBackend::LanceDb, Some(path)) => {
            let vectordb = Arc::new(VectorDb::connect(path).await?);
            info!(path, "lancedb connected");
            Arc::new(LanceGuidelineStore::open(vectordb, embedder.dimensions()).await?)
        }
        (StoreBackend::LanceDb, None) => anyhow::bail!("LANCEDB_PATH is required for the lancedb store"),
        (StoreBackend::Memory, _) => Arc::new(MemoryGuidelineStore::new()),
    };

    // 5. Seed guidelines if the file changed or the store is empty
    let update_service = Arc::new(UpdateService::new(
        config.guidelines_file.clone(),
        Arc::clone(&embedder),
        Arc::clone(&store),
        Arc::clone(&cache),
    ));
    let result = update_service.update().await?;
    info!(
        updated = result.updated,
        guidelines = result.guideline_count,
        "guidelines ready"
    );

    // 6. Build the agent and serve
    let agent = GuidelineAgent::new(
        embedder,
        Arc::clone(&store),
        client,
        AgentSettings {
            model: config.model.clone(),
            match_count: config.match_count,
            turn_selection: config.turn_selection,
            decoding: Decoding::default(),
        },
    );
    let server = GuidelineAgentServer::new(agent, store, update_service);

    if let Ok(addr) = std::env::var("MCP_TCP_LISTEN_ADDR") {
        let listener = TcpListener::bind(&addr).await?;
        info!(listen_addr = %addr, "MCP server ready, serving on TCP");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = server.clone();
            tokio::spawn(async move {
                info!(peer = %peer, "MCP client connected");
                let service = server.serve(stream).await.inspect_err(|e| {
                    tracing::error!(error = %e, "MCP server error");
                })?;
                service.waiting().await?;
                info!(peer = %peer, "MCP client disconnected");
                Ok::<(), anyhow::Error>(())
            });
        }
    } else {
        info!("MCP server ready, serving on stdio");
        let service = server.serve(stdio()).await.inspect_err(|e| {
            tracing::error!(error = %e, "MCP server error");
        })?;
        service.waiting().await?;
        info!("MCP server shut down");
    }
    Ok(())
}
