//! LLM-judged reranking.
//!
//! Scores (query, chunk) pairs with an external judge model. Candidates are
//! split into small batches (default 2) issued in parallel under a
//! concurrency cap (default 10); each batch is one call whose prompt asks
//! for a JSON array of `(index, relevance_score, reasoning)` entries.
//!
//! A failed batch never aborts the rerank: its candidates fall through with
//! score 0 and no reasoning, preserving their pre-rerank order. The caller
//! always receives a full-length result.

use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::llm::LlmClient;

/// Judge verdict for one candidate.
#[derive(Debug, Clone)]
pub struct RerankOutcome {
    /// Index into the caller's candidate list.
    pub index: usize,
    /// Normalized relevance in [0, 1].
    pub score: f64,
    /// Brief judge rationale, absent when the batch failed.
    pub reasoning: Option<String>,
}

/// Rerank candidates against a query.
///
/// Returns one outcome per input document, ordered by the caller's original
/// indices. Sorting by score is left to the caller so that failed batches
/// keep their fused order under a stable sort.
pub async fn rerank_candidates(
    llm: &LlmClient,
    query: &str,
    documents: &[String],
    batch_size: usize,
    concurrency: usize,
) -> Vec<RerankOutcome> {
    if documents.is_empty() {
        return Vec::new();
    }

    let batch_size = batch_size.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let batches: Vec<(usize, &[String])> = documents
        .chunks(batch_size)
        .enumerate()
        .map(|(i, batch)| (i * batch_size, batch))
        .collect();

    tracing::info!(
        candidates = documents.len(),
        batches = batches.len(),
        "reranking with LLM judge"
    );

    let tasks = batches.into_iter().map(|(offset, batch)| {
        let semaphore = Arc::clone(&semaphore);
        async move {
            let _permit = match semaphore.acquire().await {
                Ok(p) => p,
                Err(_) => return fallthrough_batch(offset, batch.len()),
            };
            score_batch(llm, query, offset, batch).await
        }
    });

    let mut outcomes: Vec<RerankOutcome> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .flatten()
        .collect();

    outcomes.sort_by_key(|o| o.index);
    outcomes
}

/// Score one batch with a single judge call. Any failure degrades to the
/// fallthrough outcome for the whole batch.
async fn score_batch(
    llm: &LlmClient,
    query: &str,
    offset: usize,
    batch: &[String],
) -> Vec<RerankOutcome> {
    let prompt = build_prompt(query, batch);

    let response = match llm.generate_json(&prompt, 0.0, 8000).await {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(offset, error = %e, "rerank batch failed, keeping fused order");
            return fallthrough_batch(offset, batch.len());
        }
    };

    match parse_rerank_response(&response, batch.len()) {
        Some(scores) => scores
            .into_iter()
            .map(|(i, score, reasoning)| RerankOutcome {
                index: offset + i,
                score,
                reasoning,
            })
            .collect(),
        None => {
            tracing::warn!(offset, "rerank batch returned malformed JSON, keeping fused order");
            fallthrough_batch(offset, batch.len())
        }
    }
}

fn fallthrough_batch(offset: usize, len: usize) -> Vec<RerankOutcome> {
    (0..len)
        .map(|i| RerankOutcome {
            index: offset + i,
            score: 0.0,
            reasoning: None,
        })
        .collect()
}

fn build_prompt(query: &str, documents: &[String]) -> String {
    let mut docs_text = String::new();
    for (idx, doc) in documents.iter().enumerate() {
        docs_text.push_str(&format!("\n[Document {}]\n{}\n", idx, doc));
    }

    format!(
        r#"You are an expert at assessing document relevance.

Given a query and multiple documents, your task is to determine how relevant each document is to answering the query.

Query: {query}

Documents:
{docs_text}

For each document, rate its relevance to the query on a scale from 0 to 10:
- 0: Completely irrelevant, document has nothing to do with the query
- 5: Somewhat relevant, document mentions related topics but doesn't directly answer the query
- 10: Highly relevant, document directly answers or addresses the query

Respond with ONLY a JSON array in this exact format (no other text):
[
  {{"index": 0, "relevance_score": 7, "reasoning": "brief explanation"}},
  {{"index": 1, "relevance_score": 2, "reasoning": "brief explanation"}}
]"#
    )
}

/// Parse the judge's JSON array. Scores are clamped to [0, 10] and
/// normalized to [0, 1]; entries with out-of-range indices are dropped and
/// missing indices are filled with zero scores. Returns `None` when the
/// response is not a JSON array at all.
fn parse_rerank_response(
    response: &str,
    batch_len: usize,
) -> Option<Vec<(usize, f64, Option<String>)>> {
    let value: serde_json::Value = serde_json::from_str(response.trim()).ok()?;
    let entries = value.as_array()?;

    let mut scores: Vec<Option<(f64, Option<String>)>> = vec![None; batch_len];

    for entry in entries {
        let Some(index) = entry.get("index").and_then(|i| i.as_u64()) else {
            continue;
        };
        let index = index as usize;
        if index >= batch_len {
            tracing::warn!(index, "rerank response references an unknown document");
            continue;
        }

        let raw = entry
            .get("relevance_score")
            .and_then(|s| s.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 10.0);

        let reasoning = entry
            .get("reasoning")
            .and_then(|r| r.as_str())
            .map(|r| r.to_string())
            .filter(|r| !r.is_empty());

        scores[index] = Some((raw / 10.0, reasoning));
    }

    Some(
        scores
            .into_iter()
            .enumerate()
            .map(|(i, slot)| match slot {
                Some((score, reasoning)) => (i, score, reasoning),
                None => (i, 0.0, None),
            })
            .collect(),
    )
}
