//! Database schema migrations.
//!
//! Creates all required tables and ensures idempotent execution.
//! Designed to be run via `ragserve init` (and at server startup).
//!
//! # Schema
//!
//! ```text
//! ┌─────────────────┐        ┌─────────────────┐
//! │   documents     │───┐    │     chunks      │
//! │                 │   │    │                 │
//! │ id (PK)         │   └────│ document_id(FK) │
//! │ uuid UNIQUE     │        │ id (PK)         │
//! │ filename        │        │ chunk_index     │
//! │ file_type       │        │ embedding BLOB  │
//! │ file_size       │        │ created_at      │
//! │ content_hash UQ │        └─────────────────┘
//! │ chunk_count     │
//! │ uploaded_by     │   Chunk text is NOT stored here; it lives in the
//! │ uploaded_at     │   object store under {uuid}/chunks/NNN.json. Only
//! │ uploaded_via    │   the 768-dim embedding is hot.
//! │ metadata JSON   │
//! │ summary         │
//! │ keywords JSON   │
//! │ token_count     │
//! └─────────────────┘
//! ```
//!
//! # Indexes
//!
//! - `idx_chunks_document_id` — fast chunk lookup and cascade deletes
//! - `idx_documents_uploaded_by` — most common column filter
//! - `idx_documents_uploaded_at` — date range filters and listing order
//! - `idx_documents_file_type` — format filters
//!
//! # Idempotency
//!
//! All statements use `CREATE TABLE IF NOT EXISTS` / `CREATE INDEX IF NOT
//! EXISTS`; running `init` multiple times is safe.

use sqlx::SqlitePool;

use crate::error::Result;

/// Run all database migrations.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT NOT NULL UNIQUE,
            filename TEXT NOT NULL,
            file_type TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            content_hash TEXT NOT NULL UNIQUE,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            uploaded_by TEXT NOT NULL,
            uploaded_at TEXT NOT NULL,
            uploaded_via TEXT NOT NULL DEFAULT 'api',
            metadata TEXT NOT NULL DEFAULT '{}',
            summary TEXT,
            keywords TEXT NOT NULL DEFAULT '[]',
            token_count INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_uploaded_by ON documents(uploaded_by)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_uploaded_at ON documents(uploaded_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_file_type ON documents(file_type)")
        .execute(pool)
        .await?;

    Ok(())
}
