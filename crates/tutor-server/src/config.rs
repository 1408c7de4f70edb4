use std::net::SocketAddr;
use std::path::PathBuf;

use crate::chunker::{Chunker, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::error::AppError;
use crate::retriever::SourceLayout;

pub const DEFAULT_TOP_K: usize = 4;
pub const DEFAULT_MEMORY_MAX_TURNS: usize = 50;

/// Server configuration loaded explicitly from environment variables.
///
/// The chat backend is configured separately through
/// [`tutor_common::llm::LlmClientConfig::from_env`].
#[derive(Debug, Clone)]
pub struct Config {
    pub layout: SourceLayout,
    pub bind_addr: SocketAddr,
    /// Chunks retrieved per query
    pub top_k: usize,
    pub chunker: Chunker,
    pub memory_max_turns: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All optional:
    /// - `TUTOR_DATA_DIR`: source document root (default `./data`)
    /// - `TUTOR_INDEX_DIR`: persisted index root (default `./chroma_db`)
    /// - `TUTOR_BIND_ADDR`: listen address (default `0.0.0.0:5000`)
    /// - `RETRIEVAL_TOP_K`: default 4
    /// - `CHUNK_SIZE` / `CHUNK_OVERLAP`: default 500 / 100, overlap must be smaller
    /// - `MEMORY_MAX_TURNS`: default 50
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let data_root = var("TUTOR_DATA_DIR").unwrap_or_else(|| "./data".to_string());
        let index_root = var("TUTOR_INDEX_DIR").unwrap_or_else(|| "./chroma_db".to_string());

        let bind = var("TUTOR_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:5000".to_string());
        let bind_addr = bind
            .parse::<SocketAddr>()
            .map_err(|e| AppError::Config(format!("TUTOR_BIND_ADDR {bind:?} is invalid: {e}")))?;

        let top_k = parse_count(&var, "RETRIEVAL_TOP_K", DEFAULT_TOP_K)?;
        if top_k == 0 {
            return Err(AppError::Config("RETRIEVAL_TOP_K must be at least 1".to_string()));
        }
        let chunker = Chunker::new(
            parse_count(&var, "CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            parse_count(&var, "CHUNK_OVERLAP", DEFAULT_CHUNK_OVERLAP)?,
        )?;
        let memory_max_turns = parse_count(&var, "MEMORY_MAX_TURNS", DEFAULT_MEMORY_MAX_TURNS)?;

        Ok(Self {
            layout: SourceLayout {
                data_root: PathBuf::from(data_root),
                index_root: PathBuf::from(index_root),
            },
            bind_addr,
            top_k,
            chunker,
            memory_max_turns,
        })
    }
}

fn parse_count(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: usize,
) -> Result<usize, AppError> {
    match var(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| AppError::Config(format!("{name} must be a non-negative integer, got {raw:?}"))),
    }
}
