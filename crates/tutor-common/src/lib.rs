pub mod embedding;
pub mod error;
pub mod llm;
pub mod vectordb;
