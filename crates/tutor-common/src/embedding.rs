/// Embedding wrapper around fastembed.
///
/// `TextEmbedding` from fastembed is synchronous and CPU-bound. All embed calls go through
/// `tokio::task::spawn_blocking`, with the model shared behind an `Arc`.
///
/// The all-MiniLM-L6-v2 model takes raw text, so documents and queries are embedded the
/// same way. Both the index build (per chunk) and retrieval (per query) go through the
/// [`Embed`] trait so that callers can substitute a different embedding service.
use std::future::Future;
use std::sync::Arc;

use crate::error::CommonError;

/// Dimensionality of all-MiniLM-L6-v2 vectors.
pub const MINILM_DIMENSIONS: usize = 384;

/// The embedding capability consumed by the index store: `embed(text) -> vector`.
pub trait Embed: Send + Sync + 'static {
    /// Embed a batch of document chunks, one vector per input in input order.
    fn embed_documents(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, CommonError>> + Send;

    /// Embed a single query string.
    fn embed_query(&self, query: &str) -> impl Future<Output = Result<Vec<f32>, CommonError>> + Send;

    /// Length of every vector this embedder produces.
    fn dimensions(&self) -> usize;
}

/// Wraps fastembed's `TextEmbedding` model for generating vector embeddings.
pub struct Embedder {
    model: Arc<fastembed::TextEmbedding>,
}

impl Embedder {
    /// Initialize the embedding model (all-MiniLM-L6-v2).
    ///
    /// This downloads the model on first run (~90MB). The download happens synchronously
    /// inside a blocking task.
    pub async fn new() -> Result<Self, CommonError> {
        let model = tokio::task::spawn_blocking(|| {
            let options = fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2)
                .with_show_download_progress(true);
            fastembed::TextEmbedding::try_new(options)
        })
        .await
        .map_err(|e| CommonError::Embedding(format!("spawn_blocking join error: {e}")))?
        .map_err(|e| CommonError::Embedding(format!("model initialization failed: {e}")))?;

        Ok(Self {
            model: Arc::new(model),
        })
    }
}

impl Embed for Embedder {
    /// Documents are processed in small batches to bound peak memory during ONNX inference.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        let owned: Vec<String> = texts.to_vec();
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || model.embed(owned, Some(16)))
            .await
            .map_err(|e| CommonError::Embedding(format!("spawn_blocking join error: {e}")))?
            .map_err(|e| CommonError::Embedding(format!("document embedding failed: {e}")))
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, CommonError> {
        let input = vec![query.to_string()];
        let model = Arc::clone(&self.model);
        let mut results = tokio::task::spawn_blocking(move || model.embed(input, None))
            .await
            .map_err(|e| CommonError::Embedding(format!("spawn_blocking join error: {e}")))?
            .map_err(|e| CommonError::Embedding(format!("query embedding failed: {e}")))?;
        results
            .pop()
            .ok_or_else(|| CommonError::Embedding("empty embedding result".to_string()))
    }

    fn dimensions(&self) -> usize {
        MINILM_DIMENSIONS
    }
}
