/// Error types shared by the tutoring service crates.
///
/// These errors represent failures in infrastructure components (vector store, embeddings)
/// that are consumed as opaque services. Application-specific errors are defined in the
/// server crate and wrap `CommonError` via `#[from]`. Chat backend failures have their own
/// type in [`crate::llm::LlmClientError`].

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("vector db error: {0}")]
    VectorDb(String),

    #[error("embedding error: {0}")]
    Embedding(String),
}
