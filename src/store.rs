//! Vector store adapter.
//!
//! The hot tier: document metadata and 768-dim chunk embeddings in SQLite,
//! with cosine k-NN search evaluated in-process over candidate vectors.
//! Chunk text never lands here; it lives in the object store, and the
//! search result shape carries every document attribute hybrid scoring
//! needs so the query orchestrator never does a second metadata lookup.
//!
//! Embeddings are stored as little-endian f32 BLOBs ([`vec_to_blob`] /
//! [`blob_to_vec`]). `content_hash` carries a UNIQUE constraint: the store
//! is the serialization point for deduplication, so two concurrent uploads
//! of identical bytes race and the loser observes [`InsertOutcome::DuplicateHash`].

use serde::Serialize;
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::error::{RagError, Result};
use crate::filter::{FilterDoc, FilterNode};

/// A document row as the API and the query orchestrator see it.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub id: i64,
    pub uuid: String,
    pub filename: String,
    pub file_type: String,
    pub file_size: i64,
    pub content_hash: String,
    pub chunk_count: i64,
    pub uploaded_by: String,
    pub uploaded_at: String,
    pub uploaded_via: String,
    pub metadata: Value,
    pub summary: Option<String>,
    pub keywords: Vec<String>,
    pub token_count: Option<i64>,
}

/// Fields for a new document row. The UUID is generated by the ingestion
/// orchestrator before any blob is written, so the row lands last.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub uuid: String,
    pub filename: String,
    pub file_type: String,
    pub file_size: i64,
    pub content_hash: String,
    pub uploaded_by: String,
    pub uploaded_at: String,
    pub uploaded_via: String,
    pub metadata: Value,
    pub summary: Option<String>,
    pub keywords: Vec<String>,
    pub token_count: i64,
}

/// Result of a document insert.
#[derive(Debug)]
pub enum InsertOutcome {
    /// Row created; carries the new document id.
    Created(i64),
    /// Another document already holds this content hash.
    DuplicateHash,
}

/// One selected chunk from a k-NN search, joined with the document
/// attributes the query orchestrator needs.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: i64,
    pub chunk_index: i64,
    pub document_id: i64,
    pub document_uuid: String,
    pub filename: String,
    pub uploaded_by: String,
    pub summary: Option<String>,
    pub keywords: Vec<String>,
    pub token_count: Option<i64>,
    pub metadata: Value,
    pub similarity: f64,
}

pub struct VectorStore {
    pool: SqlitePool,
    dims: usize,
}

impl VectorStore {
    pub fn new(pool: SqlitePool, dims: usize) -> Self {
        Self { pool, dims }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a document row plus all its chunk rows in one transaction.
    ///
    /// Embedding dimensionality is enforced here: a vector of any other
    /// length cannot be inserted. A UNIQUE violation on `content_hash`
    /// (concurrent duplicate upload) reports `DuplicateHash` instead of
    /// failing.
    pub async fn insert_document_with_chunks(
        &self,
        doc: &NewDocument,
        embeddings: &[Vec<f32>],
    ) -> Result<InsertOutcome> {
        for embedding in embeddings {
            if embedding.len() != self.dims {
                return Err(RagError::Internal(format!(
                    "embedding dimension {} does not match the provisioned {}",
                    embedding.len(),
                    self.dims,
                )));
            }
        }

        let mut tx = self.pool.begin().await?;

        let insert = sqlx::query(
            r#"
            INSERT INTO documents
                (uuid, filename, file_type, file_size, content_hash, chunk_count,
                 uploaded_by, uploaded_at, uploaded_via, metadata, summary, keywords, token_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.uuid)
        .bind(&doc.filename)
        .bind(&doc.file_type)
        .bind(doc.file_size)
        .bind(&doc.content_hash)
        .bind(embeddings.len() as i64)
        .bind(&doc.uploaded_by)
        .bind(&doc.uploaded_at)
        .bind(&doc.uploaded_via)
        .bind(doc.metadata.to_string())
        .bind(&doc.summary)
        .bind(serde_json::to_string(&doc.keywords).unwrap_or_else(|_| "[]".to_string()))
        .bind(doc.token_count)
        .execute(&mut *tx)
        .await;

        let document_id = match insert {
            Ok(result) => result.last_insert_rowid(),
            Err(e) => {
                if is_unique_violation(&e, "documents.content_hash") {
                    return Ok(InsertOutcome::DuplicateHash);
                }
                return Err(e.into());
            }
        };

        let now = chrono::Utc::now().to_rfc3339();
        for (index, embedding) in embeddings.iter().enumerate() {
            sqlx::query(
                "INSERT INTO chunks (document_id, chunk_index, embedding, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(document_id)
            .bind(index as i64)
            .bind(vec_to_blob(embedding))
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(InsertOutcome::Created(document_id))
    }

    /// Cosine k-NN over all chunks, with an optional document-attribute
    /// predicate and similarity threshold.
    ///
    /// Ordering: similarity descending, ties broken by chunk id ascending.
    pub async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        min_similarity: f64,
        filter: Option<&FilterNode>,
    ) -> Result<Vec<SearchHit>> {
        let documents = self.list_documents().await?;

        let mut allowed: std::collections::HashMap<i64, &DocumentRecord> =
            std::collections::HashMap::new();
        for doc in &documents {
            let passes = match filter {
                Some(node) => node.matches(&FilterDoc {
                    uploaded_by: &doc.uploaded_by,
                    filename: &doc.filename,
                    file_type: &doc.file_type,
                    uploaded_at: &doc.uploaded_at,
                    keywords: &doc.keywords,
                    token_count: doc.token_count,
                    metadata: &doc.metadata,
                }),
                None => true,
            };
            if passes {
                allowed.insert(doc.id, doc);
            }
        }

        if allowed.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query("SELECT id, document_id, chunk_index, embedding FROM chunks")
            .fetch_all(&self.pool)
            .await?;

        let mut hits: Vec<SearchHit> = Vec::new();
        for row in &rows {
            let document_id: i64 = row.get("document_id");
            let Some(doc) = allowed.get(&document_id) else {
                continue;
            };

            let blob: Vec<u8> = row.get("embedding");
            let embedding = blob_to_vec(&blob);
            let similarity = cosine_similarity(query, &embedding) as f64;
            if similarity < min_similarity {
                continue;
            }

            hits.push(SearchHit {
                chunk_id: row.get("id"),
                chunk_index: row.get("chunk_index"),
                document_id,
                document_uuid: doc.uuid.clone(),
                filename: doc.filename.clone(),
                uploaded_by: doc.uploaded_by.clone(),
                summary: doc.summary.clone(),
                keywords: doc.keywords.clone(),
                token_count: doc.token_count,
                metadata: doc.metadata.clone(),
                similarity,
            });
        }

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    pub async fn find_by_hash(&self, content_hash: &str) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query("SELECT * FROM documents WHERE content_hash = ?")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_document(&r)).transpose()
    }

    pub async fn get_document(&self, id: i64) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_document(&r)).transpose()
    }

    pub async fn get_document_by_uuid(&self, uuid: &str) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query("SELECT * FROM documents WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_document(&r)).transpose()
    }

    /// All documents, newest upload first.
    pub async fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY uploaded_at DESC, id DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_document).collect()
    }

    /// Delete a document; chunk rows cascade. Returns the deleted record.
    pub async fn delete_document(&self, id: i64) -> Result<Option<DocumentRecord>> {
        let Some(doc) = self.get_document(id).await? else {
            return Ok(None);
        };
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(Some(doc))
    }

    /// Delete by content hash. Returns the deleted record.
    pub async fn delete_document_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<DocumentRecord>> {
        let Some(doc) = self.find_by_hash(content_hash).await? else {
            return Ok(None);
        };
        sqlx::query("DELETE FROM documents WHERE content_hash = ?")
            .bind(content_hash)
            .execute(&self.pool)
            .await?;
        Ok(Some(doc))
    }

    pub async fn count_documents(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn count_chunks(&self, document_id: i64) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
                .bind(document_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }
}

fn is_unique_violation(e: &sqlx::Error, constraint: &str) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed")
        && db.message().contains(constraint))
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<DocumentRecord> {
    let metadata_text: String = row.get("metadata");
    let keywords_text: String = row.get("keywords");

    Ok(DocumentRecord {
        id: row.get("id"),
        uuid: row.get("uuid"),
        filename: row.get("filename"),
        file_type: row.get("file_type"),
        file_size: row.get("file_size"),
        content_hash: row.get("content_hash"),
        chunk_count: row.get("chunk_count"),
        uploaded_by: row.get("uploaded_by"),
        uploaded_at: row.get("uploaded_at"),
        uploaded_via: row.get("uploaded_via"),
        metadata: serde_json::from_str(&metadata_text).unwrap_or_else(|_| Value::Object(Default::default())),
        summary: row.get("summary"),
        keywords: serde_json::from_str(&keywords_text).unwrap_or_default(),
        token_count: row.get("token_count"),
    })
}

// ============ Vector encoding ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
