//! Query orchestration.
//!
//! One query flows through: embed → vector search (with filter predicate
//! and similarity threshold) → optional hybrid BM25 + RRF → optional LLM
//! rerank → chunk-text hydration.
//!
//! Hybrid scoring is document-level: the candidates' distinct documents
//! have their `bm25_doc_index.json` blobs fetched concurrently, each
//! candidate chunk inherits its document's BM25 score, and the vector and
//! BM25 rankings fuse by reciprocal rank. A document whose BM25 blob is
//! missing simply scores 0 on the lexical side; the vector side still
//! ranks it.
//!
//! Chunk text lives in the cold tier, so hydration is lazy: without
//! reranking only the final `top_k` chunks are fetched. A chunk whose blob
//! cannot be fetched is omitted from the result rather than failing the
//! query, as long as at least one chunk survives.

use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use crate::bm25::{self, Bm25DocIndex};
use crate::embedding::embed_query;
use crate::error::{RagError, Result};
use crate::filter::parse_filter;
use crate::fusion::reciprocal_rank_fusion;
use crate::object_store::{self, ObjectStore};
use crate::rerank::rerank_candidates;
use crate::store::SearchHit;
use crate::tokenize::tokenize;
use crate::AppContext;

/// Default result count.
pub const DEFAULT_TOP_K: usize = 10;
/// Hard cap on requested results.
pub const MAX_TOP_K: usize = 100;
/// Candidate floor when hybrid scoring or reranking widens the first stage.
const CANDIDATE_FLOOR: usize = 100;

/// Parameters of one query.
#[derive(Debug, Clone)]
pub struct QueryParams {
    pub query: String,
    pub top_k: usize,
    pub use_hybrid: bool,
    pub rerank: bool,
    pub rerank_candidates: usize,
    pub min_similarity: f64,
    pub filters: Option<Value>,
}

impl QueryParams {
    pub fn new(query: impl Into<String>) -> Self {
        let query = query.into();
        Self {
            query,
            top_k: DEFAULT_TOP_K,
            use_hybrid: true,
            rerank: false,
            rerank_candidates: 2 * DEFAULT_TOP_K,
            min_similarity: 0.0,
            filters: None,
        }
    }
}

/// One ranked result. Position in the returned list is the authoritative
/// ranking.
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub chunk_text: String,
    pub similarity: f64,
    pub rerank_score: Option<f64>,
    pub rerank_reasoning: Option<String>,
    pub filename: String,
    pub chunk_index: i64,
    pub document_uuid: String,
    pub document_id: i64,
    pub summary: Option<String>,
    pub document_metadata: Value,
}

/// Run a query end to end.
pub async fn run_query(ctx: &AppContext, params: QueryParams) -> Result<Vec<QueryHit>> {
    if params.query.trim().is_empty() {
        return Err(RagError::BadRequest("query must not be empty".to_string()));
    }
    let top_k = params.top_k.clamp(1, MAX_TOP_K);

    // Filter parse errors surface before any model call.
    let filter = params
        .filters
        .as_ref()
        .map(parse_filter)
        .transpose()?;

    let query_vec = embed_query(ctx.embedder.as_ref(), &params.query).await?;

    // Widen the first stage when a second scoring pass will re-rank it.
    let candidate_count = if params.use_hybrid || params.rerank {
        CANDIDATE_FLOOR.max(params.rerank_candidates)
    } else {
        top_k
    };

    let mut hits = ctx
        .store
        .search(
            &query_vec,
            candidate_count,
            params.min_similarity,
            filter.as_ref(),
        )
        .await?;

    if hits.is_empty() {
        return Ok(Vec::new());
    }

    if params.use_hybrid {
        hits = hybrid_reorder(ctx, &params.query, hits).await;
    }

    if params.rerank {
        let pool_size = params.rerank_candidates.max(top_k).min(hits.len());
        hits.truncate(pool_size);

        let hydrated = hydrate_chunks(ctx.objects.as_ref(), &hits).await?;

        let texts: Vec<String> = hydrated.iter().map(|(_, text)| text.clone()).collect();
        let outcomes = rerank_candidates(
            &ctx.llm,
            &params.query,
            &texts,
            ctx.config.rerank.batch_size,
            ctx.config.rerank.concurrency,
        )
        .await;

        let mut scored: Vec<(SearchHit, String, f64, Option<String>)> = hydrated
            .into_iter()
            .zip(outcomes)
            .map(|((hit, text), outcome)| (hit, text, outcome.score, outcome.reasoning))
            .collect();
        // Stable sort: failed batches (score 0) keep their fused order.
        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        return Ok(scored
            .into_iter()
            .map(|(hit, text, score, reasoning)| to_query_hit(hit, text, Some(score), reasoning))
            .collect());
    }

    // No rerank: hydrate lazily, only the final page.
    hits.truncate(top_k);
    let hydrated = hydrate_chunks(ctx.objects.as_ref(), &hits).await?;

    Ok(hydrated
        .into_iter()
        .map(|(hit, text)| to_query_hit(hit, text, None, None))
        .collect())
}

/// Re-rank candidates by fusing the vector ordering with document-level
/// BM25 scores.
async fn hybrid_reorder(ctx: &AppContext, query: &str, hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let doc_uuids: BTreeSet<String> = hits.iter().map(|h| h.document_uuid.clone()).collect();

    // Concurrent fetch of each document's term-frequency blob.
    let fetches = doc_uuids.iter().map(|uuid| {
        let objects = ctx.objects.clone();
        async move {
            let index = fetch_bm25_index(objects.as_ref(), uuid).await;
            (uuid.clone(), index)
        }
    });
    let indices: HashMap<String, Option<Bm25DocIndex>> =
        futures::future::join_all(fetches).await.into_iter().collect();

    let query_terms = tokenize(query);

    // Document score from its term frequencies, keywords, and token count
    // (attributes already present on the vector hits).
    let mut doc_scores: HashMap<String, f64> = HashMap::new();
    for hit in &hits {
        if doc_scores.contains_key(&hit.document_uuid) {
            continue;
        }
        let score = match indices.get(&hit.document_uuid).and_then(|i| i.as_ref()) {
            Some(index) => bm25::score(
                &query_terms,
                index,
                hit.token_count.unwrap_or(0).max(0) as u64,
                &hit.keywords,
            ),
            // Missing blob: the document still ranks on the vector side.
            None => 0.0,
        };
        doc_scores.insert(hit.document_uuid.clone(), score);
    }

    // Ranking A: vector similarity (the hits arrive in this order).
    let vector_ranking: Vec<i64> = hits.iter().map(|h| h.chunk_id).collect();

    // Ranking B: document BM25, ties broken by chunk id for determinism.
    let mut by_bm25: Vec<&SearchHit> = hits.iter().collect();
    by_bm25.sort_by(|a, b| {
        let score_a = doc_scores.get(&a.document_uuid).copied().unwrap_or(0.0);
        let score_b = doc_scores.get(&b.document_uuid).copied().unwrap_or(0.0);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    let bm25_ranking: Vec<i64> = by_bm25.iter().map(|h| h.chunk_id).collect();

    let fused = reciprocal_rank_fusion(&[vector_ranking, bm25_ranking]);

    let mut by_id: HashMap<i64, SearchHit> =
        hits.into_iter().map(|h| (h.chunk_id, h)).collect();
    fused
        .into_iter()
        .filter_map(|(chunk_id, _)| by_id.remove(&chunk_id))
        .collect()
}

async fn fetch_bm25_index(objects: &dyn ObjectStore, doc_uuid: &str) -> Option<Bm25DocIndex> {
    let path = object_store::bm25_path(doc_uuid);
    match objects.get(&path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(index) => Some(index),
            Err(e) => {
                tracing::warn!(uuid = %doc_uuid, error = %e, "corrupt BM25 index blob");
                None
            }
        },
        Err(RagError::NotFound(_)) => {
            tracing::warn!(uuid = %doc_uuid, "BM25 index blob missing; lexical score is 0");
            None
        }
        Err(e) => {
            tracing::warn!(uuid = %doc_uuid, error = %e, "BM25 index fetch failed");
            None
        }
    }
}

/// Fetch chunk texts concurrently. Chunks whose blob cannot be fetched are
/// omitted; the query only fails if every fetch failed.
async fn hydrate_chunks(
    objects: &dyn ObjectStore,
    hits: &[SearchHit],
) -> Result<Vec<(SearchHit, String)>> {
    if hits.is_empty() {
        return Ok(Vec::new());
    }

    let fetches = hits.iter().map(|hit| async move {
        fetch_chunk_text(objects, &hit.document_uuid, hit.chunk_index as usize).await
    });
    let texts = futures::future::join_all(fetches).await;

    let mut hydrated = Vec::with_capacity(hits.len());
    for (hit, text) in hits.iter().zip(texts) {
        match text {
            Some(text) => hydrated.push((hit.clone(), text)),
            None => {
                tracing::warn!(
                    uuid = %hit.document_uuid,
                    chunk_index = hit.chunk_index,
                    "chunk text unavailable; omitting from results"
                );
            }
        }
    }

    if hydrated.is_empty() {
        return Err(RagError::InconsistentState(
            "no chunk text could be fetched for any candidate".to_string(),
        ));
    }
    Ok(hydrated)
}

async fn fetch_chunk_text(
    objects: &dyn ObjectStore,
    doc_uuid: &str,
    chunk_index: usize,
) -> Option<String> {
    let path = object_store::chunk_path(doc_uuid, chunk_index);
    let bytes = objects.get(&path).await.ok()?;
    let value: Value = serde_json::from_slice(&bytes).ok()?;
    value.get("text")?.as_str().map(|s| s.to_string())
}

/// A window of contiguous chunks rebuilt as one text block.
#[derive(Debug, Clone)]
pub struct ChunkContext {
    pub document_uuid: String,
    pub filename: String,
    pub target_chunk_index: usize,
    pub context_range: (usize, usize),
    pub text: String,
    pub chunks_included: usize,
}

/// Rebuild the text surrounding one chunk, without the chunker's overlap.
///
/// Fetches chunks `[index - before, index + after]` (clamped to the
/// document), takes the smallest `start_char` and largest `end_char` their
/// blobs recorded, and slices that span out of `extracted.txt` so the
/// overlap regions appear exactly once. Chunks that carry no offsets
/// (token-limit sub-chunks) fall back to joining the fetched texts.
pub async fn chunk_context(
    ctx: &AppContext,
    doc_uuid: &str,
    chunk_index: usize,
    before: usize,
    after: usize,
) -> Result<ChunkContext> {
    let doc = ctx
        .store
        .get_document_by_uuid(doc_uuid)
        .await?
        .ok_or_else(|| RagError::NotFound(format!("Document {} not found", doc_uuid)))?;

    let chunk_count = doc.chunk_count.max(0) as usize;
    if chunk_index >= chunk_count {
        return Err(RagError::BadRequest(format!(
            "chunk_index {} out of range [0, {}]",
            chunk_index,
            chunk_count.saturating_sub(1),
        )));
    }

    let start_idx = chunk_index.saturating_sub(before);
    let end_idx = (chunk_index + after).min(chunk_count - 1);

    // Chunk blobs and the extracted text come down concurrently.
    let blob_fetches = (start_idx..=end_idx).map(|index| {
        let objects = ctx.objects.clone();
        let uuid = doc.uuid.clone();
        async move { objects.get(&object_store::chunk_path(&uuid, index)).await }
    });
    let extracted_path = object_store::extracted_path(&doc.uuid);
    let (blob_results, extracted) = tokio::join!(
        futures::future::join_all(blob_fetches),
        ctx.objects.get(&extracted_path),
    );

    let mut span: Option<(usize, usize)> = None;
    let mut texts: Vec<String> = Vec::new();

    for (offset, result) in blob_results.into_iter().enumerate() {
        let bytes = result.map_err(|e| match e {
            RagError::NotFound(_) => RagError::InconsistentState(format!(
                "chunk {} of document {} is missing from the object store",
                start_idx + offset,
                doc_uuid,
            )),
            other => other,
        })?;
        let blob: Value = serde_json::from_slice(&bytes).map_err(|e| {
            RagError::InconsistentState(format!("corrupt chunk blob {}: {}", start_idx + offset, e))
        })?;

        if let (Some(start), Some(end)) = (
            blob.pointer("/metadata/start_char").and_then(|v| v.as_u64()),
            blob.pointer("/metadata/end_char").and_then(|v| v.as_u64()),
        ) {
            let (start, end) = (start as usize, end as usize);
            span = Some(match span {
                Some((lo, hi)) => (lo.min(start), hi.max(end)),
                None => (start, end),
            });
        }

        texts.push(
            blob.get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
        );
    }

    let text = match span {
        Some((lo, hi)) => {
            let source = String::from_utf8(extracted?)
                .map_err(|e| RagError::InconsistentState(format!("corrupt extracted text: {}", e)))?;
            source[lo.min(source.len())..hi.min(source.len())].to_string()
        }
        // No recorded offsets: join the chunk texts instead.
        None => texts.join("\n\n"),
    };

    Ok(ChunkContext {
        document_uuid: doc.uuid,
        filename: doc.filename,
        target_chunk_index: chunk_index,
        context_range: (start_idx, end_idx),
        text,
        chunks_included: end_idx - start_idx + 1,
    })
}

fn to_query_hit(
    hit: SearchHit,
    chunk_text: String,
    rerank_score: Option<f64>,
    rerank_reasoning: Option<String>,
) -> QueryHit {
    QueryHit {
        chunk_text,
        similarity: hit.similarity,
        rerank_score,
        rerank_reasoning,
        filename: hit.filename,
        chunk_index: hit.chunk_index,
        document_uuid: hit.document_uuid,
        document_id: hit.document_id,
        summary: hit.summary,
        document_metadata: hit.metadata,
    }
}
