//! # ragserve
//!
//! **RAG-as-a-Service: hybrid document search over a two-tier store.**
//!
//! ragserve ingests heterogeneous documents (PDF, HTML, Markdown, JSON,
//! XML, YAML, CSV, source code, logs), indexes them for both semantic
//! (dense-vector) and lexical (BM25-style) retrieval, answers queries by
//! fusing the two channels, and optionally reranks the top candidates with
//! an external judge model.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────────────────────┐   ┌─────────────────┐
//! │  Upload    │──▶│  Pipeline                  │──▶│  Vector store   │
//! │ (17 fmts)  │   │ validate→chunk→embed→LLM  │   │ SQLite + BLOBs  │
//! └────────────┘   └─────────────┬─────────────┘   └────────┬────────┘
//!                                │                          │
//!                                ▼                          ▼
//!                        ┌──────────────┐          ┌─────────────────┐
//!                        │ Object store │◀─────────│  Query engine   │
//!                        │ S3 / local   │  hydrate │ vector·BM25·RRF │
//!                        └──────────────┘          └─────────────────┘
//! ```
//!
//! ## Two-tier storage
//!
//! Embeddings are hot, small, and need vector search, so they live in the
//! relational tier. Original files, extracted text, chunk texts, and the
//! per-document BM25 index are cold and only touched after ranking; they
//! live under a `{uuid}/` prefix in the object store. The ingestion
//! orchestrator always commits the vector-store row **after** the blobs, so
//! the only possible inconsistency is a cheap, GC-able orphan blob.
//!
//! ## Data Flow (indexing)
//!
//! 1. The **validator** ([`validate`]) admits an upload through three
//!    tiers: extension allow-list, magic-byte check, successful extraction.
//! 2. The **extractor** ([`extract`]) normalizes bytes to UTF-8 text
//!    (PDF/HTML→Markdown-ish, JSON/XML→YAML, the rest pass through).
//! 3. The **chunker** ([`chunk`]) windows the text (~2000 chars, 200
//!    overlap) on paragraph → sentence → word boundaries.
//! 4. The **embedder** ([`embedding`]) produces a 768-dim vector per chunk
//!    under a bounded-concurrency gate, recursively splitting any chunk the
//!    model rejects as over its token limit.
//! 5. The **LLM extractor** ([`llm_extract`]) produces a summary and
//!    keywords (soft-fails; ingestion proceeds without them).
//! 6. The **ingestion orchestrator** ([`ingest`]) uploads all blobs
//!    concurrently, then commits document and chunk rows ([`store`]).
//!
//! ## Data Flow (query)
//!
//! 1. Embed the query; k-NN search with the [`filter`] predicate and the
//!    similarity threshold.
//! 2. Hybrid: fetch each candidate document's BM25 index, score with the
//!    simplified scorer ([`bm25`]), fuse the two rankings ([`fusion`]).
//! 3. Optionally rerank the top candidates with the judge model
//!    ([`rerank`]).
//! 4. Hydrate chunk texts from the object store and return.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Error taxonomy shared by every component |
//! | [`validate`] | Three-tier upload admission |
//! | [`extract`] | Per-format text extraction |
//! | [`tokenize`] | Stopword + Snowball-stemming tokenizer |
//! | [`chunk`] | Overlapping-window chunker |
//! | [`embedding`] | Embedding providers and token-limit recovery |
//! | [`llm`] | Chat-completion client |
//! | [`llm_extract`] | Summary/keyword extraction with retry |
//! | [`bm25`] | Document-level simplified BM25 |
//! | [`fusion`] | Reciprocal Rank Fusion |
//! | [`rerank`] | Batched LLM reranking |
//! | [`filter`] | MongoDB-style filter DSL |
//! | [`store`] | Vector store adapter (SQLite) |
//! | [`object_store`] | S3 / local-directory blob store |
//! | [`ingest`] | Upload orchestration |
//! | [`query`] | Query orchestration |
//! | [`server`] | Axum HTTP surface |
//! | [`auth`] | Bearer-token principal resolution |

pub mod auth;
pub mod bm25;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod filter;
pub mod fusion;
pub mod ingest;
pub mod llm;
pub mod llm_extract;
pub mod logging;
pub mod migrate;
pub mod object_store;
pub mod query;
pub mod rerank;
pub mod server;
pub mod store;
pub mod tokenize;
pub mod validate;

use std::sync::Arc;

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::object_store::ObjectStore;
use crate::store::VectorStore;

/// Shared service wiring: configuration plus the four external
/// collaborators (vector store, object store, embedding model, judge
/// model). Built once at startup and shared across requests.
pub struct AppContext {
    pub config: Config,
    pub store: VectorStore,
    pub objects: Arc<dyn ObjectStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub llm: LlmClient,
}

impl AppContext {
    /// Connect all collaborators and run schema migrations.
    pub async fn from_config(config: Config) -> Result<Self> {
        let pool = db::connect(&config.db.path).await?;
        migrate::run_migrations(&pool).await?;

        let store = VectorStore::new(pool, config.embedding.dims);
        let objects = object_store::create_store(&config.object_store)?;
        let embedder = embedding::create_provider(&config.embedding)?;
        let llm = LlmClient::new(&config.llm)?;

        Ok(Self {
            config,
            store,
            objects,
            embedder,
            llm,
        })
    }
}
