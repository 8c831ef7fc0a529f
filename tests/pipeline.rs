//! End-to-end ingestion and retrieval tests.
//!
//! Runs the real pipeline in process against a temp SQLite database, a
//! local-directory object store, and the deterministic n-gram embedding
//! provider. The LLM provider stays disabled, exercising the soft-failure
//! path (no summary, no keywords, hybrid search without the boost).

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

use ragserve::config::{
    AuthConfig, ChunkingConfig, Config, DbConfig, EmbeddingConfig, LlmConfig, ObjectStoreConfig,
    RerankConfig, ServerConfig,
};
use ragserve::embedding::{EmbedError, EmbeddingProvider, NgramProvider};
use ragserve::error::RagError;
use ragserve::ingest::ingest_document;
use ragserve::llm::LlmClient;
use ragserve::object_store::{self, LocalStore, ObjectStore};
use ragserve::query::{chunk_context, run_query, QueryParams};
use ragserve::store::VectorStore;
use ragserve::{db, migrate, AppContext};

const DIMS: usize = 768;

fn test_config(tmp: &TempDir) -> Config {
    Config {
        db: DbConfig {
            path: tmp.path().join("data/rag.sqlite"),
        },
        object_store: ObjectStoreConfig {
            provider: "local".to_string(),
            bucket: None,
            region: "us-east-1".to_string(),
            endpoint_url: None,
            root: Some(tmp.path().join("blobs")),
        },
        chunking: ChunkingConfig {
            chunk_size: 200,
            overlap: 40,
        },
        embedding: EmbeddingConfig {
            provider: "ngram".to_string(),
            dims: DIMS,
            ..Default::default()
        },
        llm: LlmConfig::default(),
        rerank: RerankConfig::default(),
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
        auth: AuthConfig::default(),
    }
}

async fn test_context() -> (TempDir, AppContext) {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let ctx = AppContext::from_config(config).await.unwrap();
    (tmp, ctx)
}

fn blob_root(tmp: &TempDir) -> std::path::PathBuf {
    tmp.path().join("blobs")
}

const ALPHA_TEXT: &str = "Kubernetes deployment strategies for production clusters.\n\n\
    Rolling updates replace pods gradually while the service stays available. \
    Blue-green deployments switch traffic between two identical environments.\n\n\
    Canary releases route a fraction of requests to the new version first. \
    Health probes and resource limits keep the cluster stable during rollout.";

const BETA_TEXT: &str = "Sourdough bread baking at home for beginners.\n\n\
    A healthy starter needs regular feeding with flour and water. \
    Long cold fermentation in the refrigerator deepens the flavor.\n\n\
    Scoring the loaf before baking controls how the crust opens. \
    A dutch oven traps steam and gives the crumb its open texture.";

#[tokio::test]
async fn ingest_creates_matching_rows_and_blobs() {
    let (_tmp, ctx) = test_context().await;

    let outcome = ingest_document(
        &ctx,
        "k8s_guide.txt",
        ALPHA_TEXT.as_bytes().to_vec(),
        None,
        "alice@example.com",
    )
    .await
    .unwrap();

    assert!(!outcome.deduplicated);
    assert!(outcome.chunks_created >= 2);
    assert_eq!(outcome.splits_performed, 0);

    // Vector-store side.
    let doc = ctx.store.get_document(outcome.id).await.unwrap().unwrap();
    assert_eq!(doc.chunk_count as usize, outcome.chunks_created);
    assert_eq!(doc.uploaded_by, "alice@example.com");
    assert_eq!(doc.uploaded_via, "api");
    assert_eq!(doc.file_type, "text/plain");
    assert!(doc.token_count.unwrap() > 0);
    assert_eq!(
        ctx.store.count_chunks(outcome.id).await.unwrap() as usize,
        outcome.chunks_created
    );

    // Object-store side: original, extracted, bm25 index, one blob per chunk.
    let listed = ctx
        .objects
        .list_prefix(&format!("{}/", outcome.uuid))
        .await
        .unwrap();
    assert!(listed.contains(&object_store::original_path(&outcome.uuid)));
    assert!(listed.contains(&object_store::extracted_path(&outcome.uuid)));
    assert!(listed.contains(&object_store::bm25_path(&outcome.uuid)));
    for index in 0..outcome.chunks_created {
        assert!(listed.contains(&object_store::chunk_path(&outcome.uuid, index)));
    }
    assert_eq!(listed.len(), outcome.chunks_created + 3);

    // Original bytes stored verbatim.
    let original = ctx
        .objects
        .get(&object_store::original_path(&outcome.uuid))
        .await
        .unwrap();
    assert_eq!(original, ALPHA_TEXT.as_bytes());

    // LLM disabled: summary and keywords degrade softly.
    assert!(doc.summary.is_none());
    assert!(doc.keywords.is_empty());
}

#[tokio::test]
async fn duplicate_upload_is_content_based_not_name_based() {
    let (_tmp, ctx) = test_context().await;

    let first = ingest_document(
        &ctx,
        "A.txt",
        ALPHA_TEXT.as_bytes().to_vec(),
        None,
        "alice@example.com",
    )
    .await
    .unwrap();
    assert!(first.chunks_created > 0);

    // Same bytes under a different name: no new document, no new blobs.
    let second = ingest_document(
        &ctx,
        "B.txt",
        ALPHA_TEXT.as_bytes().to_vec(),
        None,
        "bob@example.com",
    )
    .await
    .unwrap();

    assert!(second.deduplicated);
    assert_eq!(second.id, first.id);
    assert_eq!(second.uuid, first.uuid);
    assert_eq!(second.chunks_created, 0);
    assert_eq!(
        second.message,
        "Document already exists (uploaded as 'A.txt'). Skipping duplicate."
    );

    assert_eq!(ctx.store.count_documents().await.unwrap(), 1);

    // Different bytes under the same name: a distinct document.
    let third = ingest_document(
        &ctx,
        "A.txt",
        BETA_TEXT.as_bytes().to_vec(),
        None,
        "alice@example.com",
    )
    .await
    .unwrap();
    assert!(!third.deduplicated);
    assert_ne!(third.id, first.id);
}

#[tokio::test]
async fn protected_metadata_is_overridden_by_server_values() {
    let (_tmp, ctx) = test_context().await;

    let outcome = ingest_document(
        &ctx,
        "doc.txt",
        ALPHA_TEXT.as_bytes().to_vec(),
        Some(json!({"uploaded_by": "attacker@x", "category": "tech"})),
        "alice@example.com",
    )
    .await
    .unwrap();

    let doc = ctx.store.get_document(outcome.id).await.unwrap().unwrap();
    // The authenticated principal wins; the attacker key is silently gone.
    assert_eq!(doc.uploaded_by, "alice@example.com");
    assert_eq!(doc.metadata, json!({"category": "tech"}));
}

#[tokio::test]
async fn invalid_uploads_are_rejected_before_any_side_effect() {
    let (tmp, ctx) = test_context().await;

    let err = ingest_document(&ctx, "no_extension", b"text".to_vec(), None, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::UnsupportedFormat(_)));

    let err = ingest_document(&ctx, "fake.pdf", b"not a pdf".to_vec(), None, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::SignatureMismatch(_)));

    let err = ingest_document(&ctx, "blank.txt", b"   \n ".to_vec(), None, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::EmptyExtraction(_)));

    let err = ingest_document(
        &ctx,
        "doc.txt",
        ALPHA_TEXT.as_bytes().to_vec(),
        Some(json!(["not", "an", "object"])),
        "alice",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RagError::InvalidMetadata(_)));

    assert_eq!(ctx.store.count_documents().await.unwrap(), 0);
    // No orphan blobs either.
    assert!(LocalStore::new(blob_root(&tmp))
        .list_prefix("")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn query_ranks_the_on_topic_document_first() {
    let (_tmp, ctx) = test_context().await;

    ingest_document(&ctx, "k8s.txt", ALPHA_TEXT.as_bytes().to_vec(), None, "alice")
        .await
        .unwrap();
    ingest_document(&ctx, "bread.txt", BETA_TEXT.as_bytes().to_vec(), None, "alice")
        .await
        .unwrap();

    let hits = run_query(
        &ctx,
        QueryParams::new("kubernetes rolling deployment strategies"),
    )
    .await
    .unwrap();

    assert!(!hits.is_empty());
    assert_eq!(hits[0].filename, "k8s.txt");
    assert!(!hits[0].chunk_text.is_empty());
    assert!(hits[0].rerank_score.is_none());

    // Pipeline integrity: the winning chunk's text is a slice of the source.
    assert!(ALPHA_TEXT.contains(hits[0].chunk_text.trim()));
}

#[tokio::test]
async fn query_is_deterministic() {
    let (_tmp, ctx) = test_context().await;

    ingest_document(&ctx, "k8s.txt", ALPHA_TEXT.as_bytes().to_vec(), None, "alice")
        .await
        .unwrap();
    ingest_document(&ctx, "bread.txt", BETA_TEXT.as_bytes().to_vec(), None, "alice")
        .await
        .unwrap();

    let a = run_query(&ctx, QueryParams::new("fermentation starter"))
        .await
        .unwrap();
    let b = run_query(&ctx, QueryParams::new("fermentation starter"))
        .await
        .unwrap();

    let ids_a: Vec<(i64, i64)> = a.iter().map(|h| (h.document_id, h.chunk_index)).collect();
    let ids_b: Vec<(i64, i64)> = b.iter().map(|h| (h.document_id, h.chunk_index)).collect();
    assert_eq!(ids_a, ids_b);
}

#[tokio::test]
async fn empty_and_invalid_queries_fail_cleanly() {
    let (_tmp, ctx) = test_context().await;

    let err = run_query(&ctx, QueryParams::new("   ")).await.unwrap_err();
    assert!(matches!(err, RagError::BadRequest(_)));

    let mut params = QueryParams::new("anything");
    params.filters = Some(json!({"field": {"$regex": "x"}}));
    let err = run_query(&ctx, params).await.unwrap_err();
    assert!(matches!(err, RagError::InvalidFilter(_)));
}

#[tokio::test]
async fn query_with_no_matches_returns_empty() {
    let (_tmp, ctx) = test_context().await;

    ingest_document(&ctx, "k8s.txt", ALPHA_TEXT.as_bytes().to_vec(), None, "alice")
        .await
        .unwrap();

    let mut params = QueryParams::new("anything at all");
    params.min_similarity = 0.999;
    let hits = run_query(&ctx, params).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn metadata_filters_constrain_retrieval() {
    let (_tmp, ctx) = test_context().await;

    for (name, text, tags) in [
        ("legal.txt", ALPHA_TEXT, json!(["legal"])),
        ("finance.txt", BETA_TEXT, json!(["finance"])),
        (
            "both.txt",
            "Quarterly compliance review of trading desk contracts and budgets.\n\n\
             Legal sign-off is required before finance closes the books.",
            json!(["legal", "finance"]),
        ),
    ] {
        ingest_document(
            &ctx,
            name,
            text.as_bytes().to_vec(),
            Some(json!({"tags": tags})),
            "alice",
        )
        .await
        .unwrap();
    }

    // legal ∧ ¬(all of [finance]) → only the purely-legal document.
    let mut params = QueryParams::new("contracts and budgets");
    params.filters = Some(json!({"$and": [
        {"tags": {"$in": ["legal"]}},
        {"$not": {"tags": {"$all": ["finance"]}}}
    ]}));

    let hits = run_query(&ctx, params).await.unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| h.filename == "legal.txt"));

    // Filtering by the uploader column.
    let mut params = QueryParams::new("contracts and budgets");
    params.filters = Some(json!({"uploaded_by": "nobody@example.com"}));
    let hits = run_query(&ctx, params).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn hybrid_survives_a_missing_bm25_blob() {
    let (tmp, ctx) = test_context().await;

    let kept = ingest_document(&ctx, "k8s.txt", ALPHA_TEXT.as_bytes().to_vec(), None, "alice")
        .await
        .unwrap();
    let broken = ingest_document(&ctx, "bread.txt", BETA_TEXT.as_bytes().to_vec(), None, "alice")
        .await
        .unwrap();

    // Simulate an object-store hiccup: the bread document loses its index.
    std::fs::remove_file(blob_root(&tmp).join(object_store::bm25_path(&broken.uuid))).unwrap();

    let hits = run_query(&ctx, QueryParams::new("sourdough starter fermentation"))
        .await
        .unwrap();

    // The query still succeeds, and the affected document is still
    // reachable through the vector channel.
    assert!(!hits.is_empty());
    assert!(hits.iter().any(|h| h.document_uuid == broken.uuid));
    let _ = kept;
}

#[tokio::test]
async fn missing_chunk_blob_omits_the_chunk_not_the_query() {
    let (tmp, ctx) = test_context().await;

    let outcome = ingest_document(&ctx, "k8s.txt", ALPHA_TEXT.as_bytes().to_vec(), None, "alice")
        .await
        .unwrap();
    assert!(outcome.chunks_created >= 2);

    // Remove one chunk blob out of several.
    std::fs::remove_file(blob_root(&tmp).join(object_store::chunk_path(&outcome.uuid, 0))).unwrap();

    let hits = run_query(&ctx, QueryParams::new("kubernetes deployment"))
        .await
        .unwrap();

    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| h.chunk_index != 0));
}

#[tokio::test]
async fn deletion_removes_both_tiers_completely() {
    let (_tmp, ctx) = test_context().await;

    let outcome = ingest_document(&ctx, "k8s.txt", ALPHA_TEXT.as_bytes().to_vec(), None, "alice")
        .await
        .unwrap();

    // Row first, then prefix (the deletion order the API uses).
    let deleted = ctx.store.delete_document(outcome.id).await.unwrap().unwrap();
    assert_eq!(deleted.chunk_count as usize, outcome.chunks_created);
    ctx.objects
        .delete_prefix(&format!("{}/", outcome.uuid))
        .await
        .unwrap();

    // No chunks from the document under any filter.
    let hits = run_query(&ctx, QueryParams::new("kubernetes deployment"))
        .await
        .unwrap();
    assert!(hits.is_empty());

    // The object-store prefix is empty.
    assert!(ctx
        .objects
        .list_prefix(&format!("{}/", outcome.uuid))
        .await
        .unwrap()
        .is_empty());

    // Re-uploading the same bytes now succeeds as a fresh document.
    let again = ingest_document(&ctx, "k8s.txt", ALPHA_TEXT.as_bytes().to_vec(), None, "alice")
        .await
        .unwrap();
    assert!(!again.deduplicated);
    assert_ne!(again.uuid, outcome.uuid);
}

#[tokio::test]
async fn chunk_context_rebuilds_text_without_overlap() {
    let (_tmp, ctx) = test_context().await;

    let outcome = ingest_document(&ctx, "k8s.txt", ALPHA_TEXT.as_bytes().to_vec(), None, "alice")
        .await
        .unwrap();
    assert!(outcome.chunks_created >= 2);

    // A window wide enough to cover the whole document reproduces the
    // extracted text exactly: overlap regions appear once, not twice.
    let full = chunk_context(&ctx, &outcome.uuid, 0, 0, outcome.chunks_created)
        .await
        .unwrap();
    assert_eq!(full.text, ALPHA_TEXT);
    assert_eq!(full.context_range, (0, outcome.chunks_created - 1));
    assert_eq!(full.chunks_included, outcome.chunks_created);
    assert_eq!(full.filename, "k8s.txt");

    // A zero-radius window is just the target chunk's own span.
    let single = chunk_context(&ctx, &outcome.uuid, 1, 0, 0).await.unwrap();
    assert_eq!(single.target_chunk_index, 1);
    assert_eq!(single.context_range, (1, 1));
    assert_eq!(single.chunks_included, 1);
    assert!(ALPHA_TEXT.contains(&single.text));

    // Neighbors clamp to the document bounds.
    let clamped = chunk_context(&ctx, &outcome.uuid, 0, 5, 0).await.unwrap();
    assert_eq!(clamped.context_range, (0, 0));
}

#[tokio::test]
async fn chunk_context_rejects_bad_targets() {
    let (_tmp, ctx) = test_context().await;

    let outcome = ingest_document(&ctx, "k8s.txt", ALPHA_TEXT.as_bytes().to_vec(), None, "alice")
        .await
        .unwrap();

    let err = chunk_context(&ctx, &outcome.uuid, 999, 1, 1).await.unwrap_err();
    assert!(matches!(err, RagError::BadRequest(_)));

    let err = chunk_context(&ctx, "no-such-uuid", 0, 1, 1).await.unwrap_err();
    assert!(matches!(err, RagError::NotFound(_)));
}

// ============ Token-limit recovery through the full pipeline ============

/// Wraps the n-gram provider but rejects texts over a length budget,
/// imitating a model token limit.
struct CappedProvider {
    inner: NgramProvider,
    max_chars: usize,
}

#[async_trait]
impl EmbeddingProvider for CappedProvider {
    fn model_name(&self) -> &str {
        "capped-ngram"
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if text.len() > self.max_chars {
            return Err(EmbedError::TokenLimit);
        }
        self.inner.embed(text).await
    }
}

#[tokio::test]
async fn token_limit_split_renumbers_chunks_contiguously() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    // Chunks come out near 400 chars, over the provider's 150-char cap.
    config.chunking.chunk_size = 400;
    config.chunking.overlap = 50;

    let pool = db::connect(&config.db.path).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let ctx = AppContext {
        store: VectorStore::new(pool, DIMS),
        objects: Arc::new(LocalStore::new(blob_root(&tmp))),
        embedder: Arc::new(CappedProvider {
            inner: NgramProvider::new(DIMS),
            max_chars: 150,
        }),
        llm: LlmClient::new(&config.llm).unwrap(),
        config,
    };

    let text = "The quick brown fox jumps over the lazy dog near the riverbank. "
        .repeat(20);
    let outcome = ingest_document(&ctx, "long.txt", text.into_bytes(), None, "alice")
        .await
        .unwrap();

    assert!(outcome.splits_performed >= 1, "expected token-limit splits");
    assert!(outcome.max_split_depth >= 1);

    // The split chunks were renumbered 0..n with rows and blobs agreeing.
    let doc = ctx.store.get_document(outcome.id).await.unwrap().unwrap();
    assert_eq!(doc.chunk_count as usize, outcome.chunks_created);
    assert_eq!(
        ctx.store.count_chunks(outcome.id).await.unwrap() as usize,
        outcome.chunks_created
    );
    for index in 0..outcome.chunks_created {
        let blob = ctx
            .objects
            .get(&object_store::chunk_path(&outcome.uuid, index))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        assert_eq!(value["index"].as_u64().unwrap() as usize, index);
        assert!(!value["text"].as_str().unwrap().is_empty());
    }

    // Sub-chunks carry no offsets, so context reconstruction falls back to
    // joining the fetched chunk texts.
    let context = chunk_context(&ctx, &outcome.uuid, 0, 0, outcome.chunks_created)
        .await
        .unwrap();
    assert_eq!(context.chunks_included, outcome.chunks_created);
    assert!(context.text.contains("quick brown fox"));
}
