//! Ingestion pipeline orchestration.
//!
//! Coordinates the full upload flow:
//!
//! ```text
//! validate → hash → dedup? → chunk
//!     → parallel { embed · LLM-extract · put original · put extracted }
//!     → BM25 index + chunk blobs
//!     → vector-store commit (document row + chunk rows)
//! ```
//!
//! The vector-store row is written **last**, after every object-store blob,
//! so a crash can only leave orphan blobs, never a row whose blobs are
//! missing. A failure at any step after the first upload triggers a
//! best-effort `delete-prefix {uuid}/` cleanup.
//!
//! # Deduplication
//!
//! The SHA-256 of the uploaded bytes is the dedup key (the filename never
//! participates). A hash hit before processing returns the existing
//! document with `chunks_created = 0`. Two concurrent uploads of identical
//! content race on the store's UNIQUE constraint; the loser cleans up its
//! blobs and returns the winner's document.
//!
//! # Soft failures
//!
//! LLM extraction failing leaves `summary = NULL` and no keywords; the
//! document still ingests and hybrid search runs without the keyword boost.

use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::bm25;
use crate::chunk::chunk_text;
use crate::embedding::{embed_chunks, EmbeddedChunk};
use crate::error::{RagError, Result};
use crate::extract::DocFormat;
use crate::llm_extract::extract_summary_and_keywords;
use crate::object_store::{self, ObjectStore};
use crate::store::{DocumentRecord, InsertOutcome, NewDocument};
use crate::tokenize::tokenize;
use crate::validate::validate_upload;
use crate::AppContext;

/// Metadata keys reserved for system fields. Uploader attempts to set them
/// are silently dropped and replaced with server-derived values.
pub const PROTECTED_METADATA_KEYS: [&str; 15] = [
    "uploaded_by",
    "uploaded_at",
    "uploaded_via",
    "id",
    "uuid",
    "filename",
    "file_type",
    "file_size",
    "content_hash",
    "chunk_count",
    "summary",
    "keywords",
    "token_count",
    "created_at",
    "updated_at",
];

/// Result of one upload.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub id: i64,
    pub uuid: String,
    pub filename: String,
    pub content_hash: String,
    pub chunks_created: usize,
    pub splits_performed: u32,
    pub max_split_depth: u32,
    pub deduplicated: bool,
    pub message: String,
}

impl IngestOutcome {
    fn duplicate(existing: &DocumentRecord, content_hash: String) -> Self {
        Self {
            id: existing.id,
            uuid: existing.uuid.clone(),
            filename: existing.filename.clone(),
            content_hash,
            chunks_created: 0,
            splits_performed: 0,
            max_split_depth: 0,
            deduplicated: true,
            message: format!(
                "Document already exists (uploaded as '{}'). Skipping duplicate.",
                existing.filename
            ),
        }
    }
}

/// Run the full ingestion pipeline for one upload.
pub async fn ingest_document(
    ctx: &AppContext,
    filename: &str,
    bytes: Vec<u8>,
    metadata: Option<Value>,
    uploaded_by: &str,
) -> Result<IngestOutcome> {
    // Tiered admission; also yields the extracted text.
    let validated = validate_upload(filename, &bytes)?;
    let text = validated.extracted_text;

    let content_hash = hex::encode(Sha256::digest(&bytes));

    // Fast-path dedup before any processing cost.
    if let Some(existing) = ctx.store.find_by_hash(&content_hash).await? {
        tracing::info!(
            id = existing.id,
            uuid = %existing.uuid,
            original = %existing.filename,
            "duplicate upload, skipping"
        );
        return Ok(IngestOutcome::duplicate(&existing, content_hash));
    }

    let user_metadata = sanitize_metadata(metadata)?;

    let content_type = match validated.format {
        DocFormat::Pdf => "application/pdf",
        _ => "text/plain",
    };

    let chunks = chunk_text(
        &text,
        ctx.config.chunking.chunk_size,
        ctx.config.chunking.overlap,
    );
    if chunks.is_empty() {
        return Err(RagError::EmptyExtraction(format!(
            "Document '{}' is too short to produce chunks",
            filename
        )));
    }

    tracing::info!(filename, chunks = chunks.len(), "processing document");

    // Object-store prefix is keyed by a UUID generated here, before any
    // write, so cleanup always knows what to remove.
    let doc_uuid = Uuid::new_v4().to_string();
    let file_size = bytes.len() as i64;

    let chunk_inputs: Vec<(String, Option<(usize, usize)>)> = chunks
        .iter()
        .map(|c| (c.text.clone(), Some((c.start, c.end))))
        .collect();

    // Embedding, LLM extraction, and the two standalone blobs proceed in
    // parallel. LLM extraction fails soft; the others are hard failures.
    let original_path = object_store::original_path(&doc_uuid);
    let extracted_path = object_store::extracted_path(&doc_uuid);
    let (embed_result, doc_summary, original_put, extracted_put) = tokio::join!(
        embed_chunks(
            ctx.embedder.clone(),
            chunk_inputs,
            ctx.config.embedding.concurrency,
        ),
        extract_summary_and_keywords(&ctx.llm, &text),
        ctx.objects.put(&original_path, bytes, content_type),
        ctx.objects.put(
            &extracted_path,
            text.clone().into_bytes(),
            "text/plain",
        ),
    );

    let (embedded, stats) = match embed_result {
        Ok(result) => result,
        Err(e) => {
            cleanup_blobs(ctx.objects.as_ref(), &doc_uuid).await;
            return Err(e);
        }
    };
    if let Err(e) = original_put.and(extracted_put) {
        cleanup_blobs(ctx.objects.as_ref(), &doc_uuid).await;
        return Err(e);
    }

    if stats.splits_performed > 0 {
        tracing::info!(
            splits = stats.splits_performed,
            depth = stats.max_depth_reached,
            "token-limit recovery split chunks during embedding"
        );
    }

    // The embedded list is authoritative: token-limit splits may have
    // changed the chunk count, and indices are renumbered from 0 here.
    let chunk_texts: Vec<String> = embedded.iter().map(|c| c.text.clone()).collect();
    let token_count = tokenize(&text).len() as i64;
    let bm25_index = bm25::build_doc_index(&chunk_texts);

    if let Err(e) = upload_index_and_chunks(ctx.objects.as_ref(), &doc_uuid, &embedded, &bm25_index)
        .await
    {
        cleanup_blobs(ctx.objects.as_ref(), &doc_uuid).await;
        return Err(e);
    }

    // Vector-store commit, strictly after all object-store writes.
    let new_doc = NewDocument {
        uuid: doc_uuid.clone(),
        filename: filename.to_string(),
        file_type: content_type.to_string(),
        file_size,
        content_hash: content_hash.clone(),
        uploaded_by: uploaded_by.to_string(),
        uploaded_at: chrono::Utc::now().to_rfc3339(),
        uploaded_via: "api".to_string(),
        metadata: user_metadata,
        summary: doc_summary.summary,
        keywords: doc_summary.keywords,
        token_count,
    };
    let embeddings: Vec<Vec<f32>> = embedded.into_iter().map(|c| c.embedding).collect();

    match ctx.store.insert_document_with_chunks(&new_doc, &embeddings).await {
        Ok(InsertOutcome::Created(id)) => {
            tracing::info!(id, uuid = %doc_uuid, chunks = embeddings.len(), "document committed");
            Ok(IngestOutcome {
                id,
                uuid: doc_uuid,
                filename: filename.to_string(),
                content_hash,
                chunks_created: embeddings.len(),
                splits_performed: stats.splits_performed,
                max_split_depth: stats.max_depth_reached,
                deduplicated: false,
                message: format!(
                    "Document processed successfully: {} chunks created",
                    embeddings.len()
                ),
            })
        }
        Ok(InsertOutcome::DuplicateHash) => {
            // Lost a concurrent-upload race: the store's UNIQUE constraint
            // is the serialization point. Remove our blobs, serve the winner.
            cleanup_blobs(ctx.objects.as_ref(), &doc_uuid).await;
            let existing = ctx.store.find_by_hash(&content_hash).await?.ok_or_else(|| {
                RagError::StoreUnavailable(
                    "duplicate hash reported but the winning document is gone".to_string(),
                )
            })?;
            Ok(IngestOutcome::duplicate(&existing, content_hash))
        }
        Err(e) => {
            cleanup_blobs(ctx.objects.as_ref(), &doc_uuid).await;
            Err(e)
        }
    }
}

/// Upload the BM25 index blob and every chunk blob concurrently.
async fn upload_index_and_chunks(
    objects: &dyn ObjectStore,
    doc_uuid: &str,
    embedded: &[EmbeddedChunk],
    bm25_index: &bm25::Bm25DocIndex,
) -> Result<()> {
    let index_bytes = serde_json::to_vec(bm25_index)
        .map_err(|e| RagError::Internal(format!("BM25 index serialization failed: {}", e)))?;

    let chunk_blobs: Vec<(String, Vec<u8>)> = embedded
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            let mut blob = serde_json::json!({
                "text": chunk.text,
                "index": index,
            });
            if let Some((start, end)) = chunk.source_span {
                blob["metadata"] = serde_json::json!({
                    "start_char": start,
                    "end_char": end,
                });
            }
            (
                object_store::chunk_path(doc_uuid, index),
                blob.to_string().into_bytes(),
            )
        })
        .collect();

    let index_path = object_store::bm25_path(doc_uuid);
    let mut uploads = vec![objects.put(&index_path, index_bytes, "application/json")];
    for (path, bytes) in &chunk_blobs {
        uploads.push(objects.put(path, bytes.clone(), "application/json"));
    }

    let results = futures::future::join_all(uploads).await;
    for result in results {
        result?;
    }
    Ok(())
}

/// Best-effort removal of everything under `{uuid}/`.
async fn cleanup_blobs(objects: &dyn ObjectStore, doc_uuid: &str) {
    if let Err(e) = objects.delete_prefix(&format!("{}/", doc_uuid)).await {
        tracing::warn!(uuid = %doc_uuid, error = %e, "object store cleanup failed; orphan blobs remain");
    }
}

/// Validate the uploader metadata shape and silently drop protected keys.
fn sanitize_metadata(metadata: Option<Value>) -> Result<Value> {
    match metadata {
        None => Ok(Value::Object(Default::default())),
        Some(Value::Object(mut map)) => {
            for key in PROTECTED_METADATA_KEYS {
                if map.remove(key).is_some() {
                    tracing::warn!(key, "dropping protected metadata key from upload");
                }
            }
            Ok(Value::Object(map))
        }
        Some(_) => Err(RagError::InvalidMetadata(
            "metadata must be a JSON object".to_string(),
        )),
    }
}
