pub mod chunking;
pub mod config;
pub mod embedding;
pub mod embedding_service;
pub mod llm;
pub mod retry;
pub mod sparse;
