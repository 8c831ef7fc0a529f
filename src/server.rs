//! HTTP surface.
//!
//! A thin transport binding over the core: routes parse requests,
//! authenticate, call the orchestrators, and shape responses. No retrieval
//! or ingestion logic lives here.
//!
//! # Endpoints
//!
//! | Method | Path | Auth | Description |
//! |--------|------|------|-------------|
//! | `GET`  | `/` | no | Service banner |
//! | `GET`  | `/health` | no | Health check with uptime |
//! | `POST` | `/v1/documents/upload` | yes | Multipart upload (file + optional metadata JSON) |
//! | `POST` | `/v1/query` | yes | Hybrid search |
//! | `POST` | `/v1/embed` | no | Single-text embedding |
//! | `GET`  | `/v1/documents` | no | List documents, newest first |
//! | `GET`  | `/v1/documents/{id}` | no | Document record |
//! | `GET`  | `/v1/documents/by-hash/{hash}` | no | Record by content hash |
//! | `GET`  | `/v1/documents/{id}/chunks` | no | All chunk texts in order |
//! | `GET`  | `/v1/documents/{uuid}/chunks/{index}/context` | no | Chunk with surrounding context, overlap-free |
//! | `GET`  | `/v1/documents/{id}/download` | no | Original bytes or extracted text |
//! | `DELETE` | `/v1/documents/{id}` | no | Delete both tiers |
//! | `DELETE` | `/v1/documents/by-hash/{hash}` | no | Delete by content hash |
//!
//! # Error Contract
//!
//! All error responses carry:
//!
//! ```json
//! { "error": { "code": "invalid_filter", "message": "unknown operator '$regex'" } }
//! ```
//!
//! Duplicate-content uploads are **not** errors: they return 200 with
//! `chunks_created = 0` and a message naming the original filename.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::authenticate;
use crate::error::RagError;
use crate::ingest::ingest_document;
use crate::object_store;
use crate::query::{run_query, QueryParams, DEFAULT_TOP_K, MAX_TOP_K};
use crate::store::DocumentRecord;
use crate::validate::MAX_FILE_SIZE;
use crate::AppContext;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    ctx: Arc<AppContext>,
    started_at: chrono::DateTime<chrono::Utc>,
}

/// Start the HTTP server and run until terminated.
pub async fn run_server(ctx: AppContext) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();

    let state = AppState {
        ctx: Arc::new(ctx),
        started_at: chrono::Utc::now(),
    };

    let app = router(state);

    tracing::info!(addr = %bind_addr, "ragserve listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/v1/documents/upload", post(handle_upload))
        .route("/v1/query", post(handle_query))
        .route("/v1/embed", post(handle_embed))
        .route("/v1/documents", get(handle_list_documents))
        .route(
            "/v1/documents/:id",
            get(handle_get_document).delete(handle_delete_document),
        )
        .route("/v1/documents/:id/chunks", get(handle_get_chunks))
        .route(
            "/v1/documents/:id/chunks/:chunk_index/context",
            get(handle_chunk_context),
        )
        .route("/v1/documents/:id/download", get(handle_download))
        .route(
            "/v1/documents/by-hash/:hash",
            get(handle_get_by_hash).delete(handle_delete_by_hash),
        )
        .layer(DefaultBodyLimit::max(MAX_FILE_SIZE + 1024 * 1024))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

/// JSON error body: `{"error": {"code", "message"}}`.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RagError> for AppError {
    fn from(e: RagError) -> Self {
        let status = match &e {
            RagError::UnsupportedFormat(_)
            | RagError::SignatureMismatch(_)
            | RagError::EmptyExtraction(_)
            | RagError::ExtractionFailed(_)
            | RagError::InvalidFilter(_)
            | RagError::InvalidMetadata(_)
            | RagError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RagError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RagError::Forbidden(_) => StatusCode::FORBIDDEN,
            RagError::NotFound(_) => StatusCode::NOT_FOUND,
            RagError::EmbeddingFailed(_)
            | RagError::StoreUnavailable(_)
            | RagError::ObjectStore(_)
            | RagError::InconsistentState(_)
            | RagError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        AppError {
            status,
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ GET / and /health ============

#[derive(Serialize)]
struct RootResponse {
    service: String,
    version: String,
    status: String,
}

async fn handle_root() -> Json<RootResponse> {
    Json(RootResponse {
        service: "ragserve".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "running".to_string(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    started_at: String,
    uptime_seconds: f64,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = chrono::Utc::now() - state.started_at;
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at: state.started_at.to_rfc3339(),
        uptime_seconds: uptime.num_milliseconds() as f64 / 1000.0,
    })
}

// ============ POST /v1/documents/upload ============

#[derive(Serialize)]
struct UploadResponse {
    id: i64,
    uuid: String,
    filename: String,
    content_hash: String,
    chunks_created: usize,
    splits_performed: u32,
    max_split_depth: u32,
    message: String,
}

async fn handle_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let auth = authenticate(&state.ctx.config.auth, &headers)?;

    let mut filename: Option<String> = None;
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut metadata: Option<Value> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        match field.name() {
            Some("file") => {
                filename = field.file_name().map(|s| s.to_string());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("failed to read file field: {}", e)))?;
                file_bytes = Some(bytes.to_vec());
            }
            Some("metadata") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("failed to read metadata field: {}", e)))?;
                if !text.trim().is_empty() {
                    let parsed: Value = serde_json::from_str(&text)
                        .map_err(|e| bad_request(format!("Invalid metadata JSON: {}", e)))?;
                    metadata = Some(parsed);
                }
            }
            _ => {}
        }
    }

    let filename = filename.ok_or_else(|| bad_request("file field with a filename is required"))?;
    let file_bytes = file_bytes.ok_or_else(|| bad_request("file field is required"))?;

    let outcome = ingest_document(&state.ctx, &filename, file_bytes, metadata, &auth.user).await?;

    Ok(Json(UploadResponse {
        id: outcome.id,
        uuid: outcome.uuid,
        filename: outcome.filename,
        content_hash: outcome.content_hash,
        chunks_created: outcome.chunks_created,
        splits_performed: outcome.splits_performed,
        max_split_depth: outcome.max_split_depth,
        message: outcome.message,
    }))
}

// ============ POST /v1/query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default = "default_true")]
    use_hybrid: bool,
    #[serde(default)]
    rerank: bool,
    /// Defaults to `2 × top_k` when omitted.
    #[serde(default)]
    rerank_candidates: Option<usize>,
    #[serde(default)]
    min_similarity: f64,
    #[serde(default)]
    filters: Option<Value>,
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
struct QueryResultItem {
    chunk_text: String,
    similarity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    rerank_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rerank_reasoning: Option<String>,
    filename: String,
    chunk_index: i64,
    document_uuid: String,
    document_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    document_metadata: Value,
}

#[derive(Serialize)]
struct QueryResponse {
    query: String,
    total: usize,
    results: Vec<QueryResultItem>,
}

async fn handle_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    authenticate(&state.ctx.config.auth, &headers)?;

    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if req.top_k == 0 || req.top_k > MAX_TOP_K {
        return Err(bad_request(format!("top_k must be in [1, {}]", MAX_TOP_K)));
    }
    if !(0.0..=1.0).contains(&req.min_similarity) {
        return Err(bad_request("min_similarity must be in [0.0, 1.0]"));
    }

    let params = QueryParams {
        top_k: req.top_k,
        use_hybrid: req.use_hybrid,
        rerank: req.rerank,
        rerank_candidates: req.rerank_candidates.unwrap_or(2 * req.top_k),
        min_similarity: req.min_similarity,
        filters: req.filters,
        query: req.query.clone(),
    };

    let hits = run_query(&state.ctx, params).await?;

    let results: Vec<QueryResultItem> = hits
        .into_iter()
        .map(|hit| QueryResultItem {
            chunk_text: hit.chunk_text,
            similarity: hit.similarity,
            rerank_score: hit.rerank_score,
            rerank_reasoning: hit.rerank_reasoning,
            filename: hit.filename,
            chunk_index: hit.chunk_index,
            document_uuid: hit.document_uuid,
            document_id: hit.document_id,
            summary: hit.summary,
            document_metadata: hit.document_metadata,
        })
        .collect();

    Ok(Json(QueryResponse {
        query: req.query,
        total: results.len(),
        results,
    }))
}

// ============ POST /v1/embed ============

#[derive(Deserialize)]
struct EmbedRequest {
    text: String,
}

#[derive(Serialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
    dimension: usize,
}

async fn handle_embed(
    State(state): State<AppState>,
    Json(req): Json<EmbedRequest>,
) -> Result<Json<EmbedResponse>, AppError> {
    if req.text.is_empty() {
        return Err(bad_request("text must not be empty"));
    }

    let embedding = crate::embedding::embed_query(state.ctx.embedder.as_ref(), &req.text).await?;
    let dimension = embedding.len();

    Ok(Json(EmbedResponse {
        embedding,
        dimension,
    }))
}

// ============ Document listing and retrieval ============

#[derive(Serialize)]
struct DocumentListResponse {
    total: usize,
    documents: Vec<DocumentRecord>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
) -> Result<Json<DocumentListResponse>, AppError> {
    let documents = state.ctx.store.list_documents().await?;
    Ok(Json(DocumentListResponse {
        total: documents.len(),
        documents,
    }))
}

async fn handle_get_document(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DocumentRecord>, AppError> {
    let doc = state
        .ctx
        .store
        .get_document(id)
        .await?
        .ok_or_else(|| not_found(format!("Document {} not found", id)))?;
    Ok(Json(doc))
}

async fn handle_get_by_hash(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<DocumentRecord>, AppError> {
    let hash = normalize_hash(&hash)?;
    let doc = state
        .ctx
        .store
        .find_by_hash(&hash)
        .await?
        .ok_or_else(|| not_found(format!("Document with hash {} not found", hash)))?;
    Ok(Json(doc))
}

// ============ GET /v1/documents/{id}/chunks ============

#[derive(Serialize)]
struct ChunkInfo {
    chunk_index: i64,
    chunk_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_char: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_char: Option<i64>,
}

#[derive(Serialize)]
struct DocumentChunksResponse {
    id: i64,
    filename: String,
    total_chunks: i64,
    chunks: Vec<ChunkInfo>,
}

/// Returns every chunk in order, straight from the object store. Useful for
/// verifying chunking-pipeline integrity.
async fn handle_get_chunks(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DocumentChunksResponse>, AppError> {
    let doc = state
        .ctx
        .store
        .get_document(id)
        .await?
        .ok_or_else(|| not_found(format!("Document {} not found", id)))?;

    let fetches = (0..doc.chunk_count as usize).map(|index| {
        let objects = state.ctx.objects.clone();
        let uuid = doc.uuid.clone();
        async move {
            let bytes = objects.get(&object_store::chunk_path(&uuid, index)).await?;
            serde_json::from_slice::<Value>(&bytes).map_err(|e| {
                RagError::InconsistentState(format!("corrupt chunk blob {}: {}", index, e))
            })
        }
    });

    let mut chunks = Vec::with_capacity(doc.chunk_count as usize);
    for (index, result) in futures::future::join_all(fetches).await.into_iter().enumerate() {
        let blob = result.map_err(|e| match e {
            RagError::NotFound(_) => RagError::InconsistentState(format!(
                "chunk {} of document {} is missing from the object store",
                index, id
            )),
            other => other,
        })?;

        chunks.push(ChunkInfo {
            chunk_index: blob.get("index").and_then(|i| i.as_i64()).unwrap_or(index as i64),
            chunk_text: blob
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            start_char: blob
                .get("metadata")
                .and_then(|m| m.get("start_char"))
                .and_then(|v| v.as_i64()),
            end_char: blob
                .get("metadata")
                .and_then(|m| m.get("end_char"))
                .and_then(|v| v.as_i64()),
        });
    }

    Ok(Json(DocumentChunksResponse {
        id,
        filename: doc.filename,
        total_chunks: doc.chunk_count,
        chunks,
    }))
}

// ============ GET /v1/documents/{uuid}/chunks/{index}/context ============

#[derive(Deserialize)]
struct ContextQuery {
    /// Chunks to include before the target.
    #[serde(default = "default_context_radius")]
    before: usize,
    /// Chunks to include after the target.
    #[serde(default = "default_context_radius")]
    after: usize,
}

fn default_context_radius() -> usize {
    1
}

#[derive(Serialize)]
struct ChunkContextResponse {
    document_uuid: String,
    filename: String,
    target_chunk_index: usize,
    context_range: [usize; 2],
    text: String,
    chunks_included: usize,
}

/// Returns the target chunk plus `before`/`after` neighbors as one
/// continuous text block, reconstructed from the extracted text so the
/// chunker's overlap regions appear exactly once.
async fn handle_chunk_context(
    State(state): State<AppState>,
    Path((uuid, chunk_index)): Path<(String, usize)>,
    Query(window): Query<ContextQuery>,
) -> Result<Json<ChunkContextResponse>, AppError> {
    let context = crate::query::chunk_context(
        &state.ctx,
        &uuid,
        chunk_index,
        window.before,
        window.after,
    )
    .await?;

    Ok(Json(ChunkContextResponse {
        document_uuid: context.document_uuid,
        filename: context.filename,
        target_chunk_index: context.target_chunk_index,
        context_range: [context.context_range.0, context.context_range.1],
        text: context.text,
        chunks_included: context.chunks_included,
    }))
}

// ============ GET /v1/documents/{id}/download ============

#[derive(Deserialize)]
struct DownloadQuery {
    #[serde(default = "default_download_format")]
    format: String,
}

fn default_download_format() -> String {
    "original".to_string()
}

async fn handle_download(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    if query.format != "original" && query.format != "extracted" {
        return Err(bad_request(format!(
            "Invalid format '{}'. Must be 'original' or 'extracted'",
            query.format
        )));
    }

    let doc = state
        .ctx
        .store
        .get_document(id)
        .await?
        .ok_or_else(|| not_found(format!("Document {} not found", id)))?;

    let (bytes, media_type, download_name) = if query.format == "extracted" {
        let bytes = state
            .ctx
            .objects
            .get(&object_store::extracted_path(&doc.uuid))
            .await?;
        let base = doc
            .filename
            .rsplit_once('.')
            .map(|(base, _)| base)
            .unwrap_or(&doc.filename);
        (
            bytes,
            "text/plain; charset=utf-8".to_string(),
            format!("{}_extracted.txt", base),
        )
    } else {
        let bytes = state
            .ctx
            .objects
            .get(&object_store::original_path(&doc.uuid))
            .await?;
        (bytes, doc.file_type.clone(), doc.filename.clone())
    };

    let disposition = format!(
        "attachment; filename*=UTF-8''{}",
        percent_encode(&download_name)
    );

    Ok((
        [
            (header::CONTENT_TYPE, media_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// RFC 5987 percent-encoding for Content-Disposition filenames.
fn percent_encode(s: &str) -> String {
    let mut out = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

// ============ Deletion ============

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
    id: i64,
    filename: String,
    chunks_deleted: i64,
    message: String,
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DeleteResponse>, AppError> {
    let doc = state
        .ctx
        .store
        .delete_document(id)
        .await?
        .ok_or_else(|| not_found(format!("Document {} not found", id)))?;

    delete_blobs(&state, &doc.uuid).await;
    Ok(Json(delete_response(doc)))
}

async fn handle_delete_by_hash(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let hash = normalize_hash(&hash)?;
    let doc = state
        .ctx
        .store
        .delete_document_by_hash(&hash)
        .await?
        .ok_or_else(|| not_found(format!("Document with hash {} not found", hash)))?;

    delete_blobs(&state, &doc.uuid).await;
    Ok(Json(delete_response(doc)))
}

/// The row goes first, the prefix second: a failed blob sweep leaves cheap
/// orphans, never a row whose blobs are gone.
async fn delete_blobs(state: &AppState, uuid: &str) {
    match state.ctx.objects.delete_prefix(&format!("{}/", uuid)).await {
        Ok(count) => tracing::debug!(uuid = %uuid, blobs = count, "deleted object store prefix"),
        Err(e) => {
            tracing::warn!(uuid = %uuid, error = %e, "object store deletion failed; orphan blobs remain")
        }
    }
}

fn delete_response(doc: DocumentRecord) -> DeleteResponse {
    DeleteResponse {
        deleted: true,
        id: doc.id,
        chunks_deleted: doc.chunk_count,
        message: format!(
            "Document '{}' deleted successfully ({} chunks removed)",
            doc.filename, doc.chunk_count
        ),
        filename: doc.filename,
    }
}

fn normalize_hash(hash: &str) -> Result<String, AppError> {
    let lowered = hash.to_lowercase();
    if lowered.len() != 64 || !lowered.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(bad_request(
            "Invalid hash format. Expected 64 hexadecimal characters (SHA-256)",
        ));
    }
    Ok(lowered)
}
