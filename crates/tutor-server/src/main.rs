mod answer;
mod chunker;
mod config;
mod context;
mod conversation;
mod error;
mod index;
mod loader;
mod model;
mod pipeline;
mod retriever;
mod server;
mod taxonomy;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use tutor_common::embedding::Embedder;
use tutor_common::llm::{LlmClient, LlmClientConfig};

use config::Config;
use index::LanceIndexStore;
use pipeline::TutorPipeline;
use retriever::RetrieverCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("starting tutor server");

    let config = Config::from_env()?;
    info!(
        data_dir = %config.layout.data_root.display(),
        index_dir = %config.layout.index_root.display(),
        top_k = config.top_k,
        chunk_size = config.chunker.size(),
        chunk_overlap = config.chunker.overlap(),
        "configuration loaded"
    );

    let llm_config = LlmClientConfig::from_env()?;
    info!(
        backend = ?llm_config.backend,
        base_url = %llm_config.base_url,
        model = %llm_config.model,
        request_timeout_secs = llm_config.request_timeout.map(|t| t.as_secs()),
        "chat backend configured"
    );
    let llm = LlmClient::new(llm_config)?;

    info!("initializing embedding model");
    let embedder = Arc::new(Embedder::new().await?);

    let cache = RetrieverCache::new(
        LanceIndexStore::new(embedder),
        config.layout.clone(),
        config.chunker,
        config.memory_max_turns,
    );
    let pipeline = Arc::new(TutorPipeline::new(Arc::new(cache), llm, config.top_k));

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, server::router(pipeline))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await
        .inspect_err(|e| {
            tracing::error!(error = %e, "server error");
        })?;

    info!("tutor server shut down");
    Ok(())
}
