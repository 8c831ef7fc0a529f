use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObjectStoreConfig {
    /// `"s3"` or `"local"`.
    pub provider: String,
    /// S3 bucket name (required for the s3 provider).
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Root directory (required for the local provider).
    #[serde(default)]
    pub root: Option<PathBuf>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target chunk size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Overlap between consecutive chunks in characters.
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    2000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"`, `"ngram"`, or `"disabled"`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Concurrent embedding calls per ingestion.
    #[serde(default = "default_embed_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Override for the OpenAI-compatible embeddings endpoint.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: default_dims(),
            concurrency: default_embed_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            endpoint_url: None,
        }
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_embed_concurrency() -> usize {
    10
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `"openai"` or `"disabled"`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Override for the OpenAI-compatible chat completions endpoint.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            timeout_secs: default_timeout_secs(),
            endpoint_url: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    /// Candidates per judge call.
    #[serde(default = "default_rerank_batch")]
    pub batch_size: usize,
    /// Concurrent judge calls per query.
    #[serde(default = "default_rerank_concurrency")]
    pub concurrency: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            batch_size: default_rerank_batch(),
            concurrency: default_rerank_concurrency(),
        }
    }
}

fn default_rerank_batch() -> usize {
    2
}
fn default_rerank_concurrency() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// When false, every request runs as `anonymous`.
    #[serde(default)]
    pub enabled: bool,
    /// Static bearer token → principal map.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
    /// Principals allowed to call authenticated routes. Empty = allow all.
    #[serde(default)]
    pub allowed_users: Vec<String>,
    /// Principals whose `X-End-User` header replaces the effective uploader.
    #[serde(default)]
    pub trusted_services: Vec<String>,
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.overlap must be smaller than chunking.chunk_size");
    }

    match config.object_store.provider.as_str() {
        "s3" => {
            if config.object_store.bucket.is_none() {
                anyhow::bail!("object_store.bucket is required for the s3 provider");
            }
        }
        "local" => {
            if config.object_store.root.is_none() {
                anyhow::bail!("object_store.root is required for the local provider");
            }
        }
        other => anyhow::bail!(
            "Unknown object store provider: '{}'. Must be s3 or local.",
            other
        ),
    }

    match config.embedding.provider.as_str() {
        "disabled" | "ngram" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be specified for the openai provider");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, ngram, or openai.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0 when embeddings are enabled");
    }
    if config.embedding.concurrency == 0 {
        anyhow::bail!("embedding.concurrency must be > 0");
    }

    match config.llm.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.llm.model.is_none() {
                anyhow::bail!("llm.model must be specified for the openai provider");
            }
        }
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.rerank.batch_size == 0 || config.rerank.concurrency == 0 {
        anyhow::bail!("rerank.batch_size and rerank.concurrency must be > 0");
    }

    Ok(())
}
