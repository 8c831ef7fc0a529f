//! Error taxonomy for the ingestion and retrieval pipeline.
//!
//! Every failure the core can produce maps to one variant. The HTTP layer
//! translates variants to status codes; soft errors (LLM extraction,
//! per-batch rerank, individual chunk hydration) are absorbed inside the
//! component that owns them and never reach this type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    /// Validator tier 1: extension not in the allow-list.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Validator tier 2: magic bytes do not match the declared extension.
    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),

    /// Validator tier 3: extraction produced only whitespace.
    #[error("empty extraction: {0}")]
    EmptyExtraction(String),

    /// Input claims a supported format but cannot be decoded or parsed.
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    /// Filter tree contains an unknown operator or malformed clause.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Upload metadata is not a JSON object.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// The embedding model persistently failed on a non-token-limit error.
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    /// Vector store unreachable or a statement failed.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Object store operation failed.
    #[error("object store error: {0}")]
    ObjectStore(String),

    /// Vector row present but blobs missing, or vice versa.
    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RagError {
    /// Machine-readable error code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::UnsupportedFormat(_) => "unsupported_format",
            RagError::SignatureMismatch(_) => "signature_mismatch",
            RagError::EmptyExtraction(_) => "empty_extraction",
            RagError::ExtractionFailed(_) => "extraction_failed",
            RagError::InvalidFilter(_) => "invalid_filter",
            RagError::InvalidMetadata(_) => "invalid_metadata",
            RagError::EmbeddingFailed(_) => "embedding_failed",
            RagError::StoreUnavailable(_) => "store_unavailable",
            RagError::ObjectStore(_) => "object_store_error",
            RagError::InconsistentState(_) => "inconsistent_state",
            RagError::NotFound(_) => "not_found",
            RagError::Unauthorized(_) => "unauthorized",
            RagError::Forbidden(_) => "forbidden",
            RagError::BadRequest(_) => "bad_request",
            RagError::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for RagError {
    fn from(e: sqlx::Error) -> Self {
        RagError::StoreUnavailable(e.to_string())
    }
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;
