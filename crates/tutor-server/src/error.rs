use std::path::PathBuf;

use tutor_common::error::CommonError;
use tutor_common::llm::LlmClientError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("chat backend error: {0}")]
    Llm(#[from] LlmClientError),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid level/subject: {level}/{subject}")]
    InvalidKey { level: String, subject: String },

    #[error("source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("no text to index for {}", .0.display())]
    EmptySources(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
