use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use super::embedding::EmbeddingBackend;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default)]
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_processing_model")]
    pub processing_model: String,
    #[serde(default)]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default = "default_vector_collection")]
    pub vector_collection: String,
    #[serde(default = "default_connector_name")]
    pub connector_name: String,
    #[serde(default = "default_etl_interval_secs")]
    pub etl_interval_secs: u64,
    #[serde(default = "default_etl_batch_limit")]
    pub etl_batch_limit: usize,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_processing_model() -> String {
    "gpt-4o-mini".to_string()
}

const fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_vector_collection() -> String {
    "personal_index".to_string()
}

fn default_connector_name() -> String {
    "local".to_string()
}

const fn default_etl_interval_secs() -> u64 {
    15 * 60
}

const fn default_etl_batch_limit() -> usize {
    1_000
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
