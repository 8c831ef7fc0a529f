//! Document-level simplified BM25 scoring.
//!
//! This is BM25 without the global IDF term: maintaining corpus-wide
//! document-frequency statistics across concurrent uploads would need either
//! a serialization point or stale reconciliation, and the service accepts a
//! known quality hit instead. LLM-extracted keywords supply a per-document
//! notion of term importance through a multiplicative boost.
//!
//! ```text
//! contrib(t) = tf(t) · (k1 + 1) / (tf(t) + k1 · (1 − b + b · dl/avgdl))
//! ```
//!
//! with k1 = 1.2, b = 0.75, and avgdl fixed at 1000 tokens. The
//! term-frequency index is one blob per document in the object store;
//! frequencies remain sufficient input for full BM25 if IDF is ever added.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::tokenize::tokenize;

/// Term frequency saturation parameter.
pub const K1: f64 = 1.2;
/// Length normalization parameter.
pub const B: f64 = 0.75;
/// Fixed average document length (tokens); no corpus statistics are kept.
pub const AVGDL: f64 = 1000.0;
/// Multiplier applied per query term matching an LLM keyword.
pub const KEYWORD_BOOST: f64 = 1.5;

/// Document-level term frequency index, persisted as
/// `{uuid}/bm25_doc_index.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bm25DocIndex {
    pub term_frequencies: HashMap<String, u64>,
}

/// Aggregate term frequencies across all chunk texts of a document.
pub fn build_doc_index(chunk_texts: &[String]) -> Bm25DocIndex {
    let mut term_frequencies: HashMap<String, u64> = HashMap::new();

    for text in chunk_texts {
        for term in tokenize(text) {
            *term_frequencies.entry(term).or_insert(0) += 1;
        }
    }

    Bm25DocIndex { term_frequencies }
}

/// Score a document against tokenized query terms.
///
/// `token_count` is the document's total token count (length
/// normalization); `keywords` are the LLM-extracted keywords, matched
/// case-insensitively as substrings. Returns 0 when the query and the
/// document share no terms.
pub fn score(
    query_terms: &[String],
    index: &Bm25DocIndex,
    token_count: u64,
    keywords: &[String],
) -> f64 {
    if query_terms.is_empty() || index.term_frequencies.is_empty() {
        return 0.0;
    }

    let dl = token_count as f64;
    let mut total = 0.0;

    for term in query_terms {
        let tf = *index.term_frequencies.get(term).unwrap_or(&0) as f64;
        if tf == 0.0 {
            continue;
        }

        let numerator = tf * (K1 + 1.0);
        let denominator = tf + K1 * (1.0 - B + B * (dl / AVGDL));
        total += numerator / denominator;
    }

    if total > 0.0 && !keywords.is_empty() {
        let mut boost = 1.0;
        for term in query_terms {
            let term_lower = term.to_lowercase();
            if keywords.iter().any(|kw| kw.to_lowercase().contains(&term_lower)) {
                boost *= KEYWORD_BOOST;
            }
        }
        total *= boost;
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(pairs: &[(&str, u64)]) -> Bm25DocIndex {
        Bm25DocIndex {
            term_frequencies: pairs.iter().map(|(t, c)| (t.to_string(), *c)).collect(),
        }
    }

    fn terms(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn zero_score_without_matching_terms() {
        let index = index_of(&[("docker", 10)]);
        assert_eq!(score(&terms(&["kubernet"]), &index, 1000, &[]), 0.0);
    }

    #[test]
    fn zero_score_for_empty_inputs() {
        let index = index_of(&[("docker", 10)]);
        assert_eq!(score(&[], &index, 1000, &[]), 0.0);
        assert_eq!(score(&terms(&["docker"]), &Bm25DocIndex::default(), 1000, &[]), 0.0);
    }

    #[test]
    fn higher_term_frequency_never_lowers_score() {
        let query = terms(&["kubernet"]);
        let low = score(&query, &index_of(&[("kubernet", 2)]), 1000, &[]);
        let high = score(&query, &index_of(&[("kubernet", 20)]), 1000, &[]);
        assert!(high >= low);
        assert!(low > 0.0);
    }

    #[test]
    fn term_frequency_saturates() {
        let query = terms(&["kubernet"]);
        let s10 = score(&query, &index_of(&[("kubernet", 10)]), 1000, &[]);
        let s100 = score(&query, &index_of(&[("kubernet", 100)]), 1000, &[]);
        // Bounded by (k1 + 1) per term.
        assert!(s100 < K1 + 1.0);
        assert!(s100 - s10 < s10);
    }

    #[test]
    fn longer_documents_score_lower() {
        let query = terms(&["kubernet"]);
        let index = index_of(&[("kubernet", 10)]);
        let short = score(&query, &index, 500, &[]);
        let long = score(&query, &index, 5000, &[]);
        assert!(short > long);
    }

    #[test]
    fn keyword_boost_multiplies_per_matched_query_term() {
        let query = terms(&["kubernet", "deploy"]);
        let index = index_of(&[("kubernet", 10), ("deploy", 5)]);
        let base = score(&query, &index, 1000, &[]);
        let keywords = vec!["kubernetes".to_string(), "deployment".to_string()];
        let boosted = score(&query, &index, 1000, &keywords);
        assert!((boosted - base * KEYWORD_BOOST * KEYWORD_BOOST).abs() < 1e-9);
    }

    #[test]
    fn keyword_boost_is_case_insensitive_substring() {
        let query = terms(&["kubernet"]);
        let index = index_of(&[("kubernet", 10)]);
        let base = score(&query, &index, 1000, &[]);
        let boosted = score(&query, &index, 1000, &["Kubernetes Operations".to_string()]);
        assert!((boosted - base * KEYWORD_BOOST).abs() < 1e-9);
    }

    #[test]
    fn no_boost_without_base_score() {
        let index = index_of(&[("docker", 10)]);
        let s = score(&terms(&["kubernet"]), &index, 1000, &["kubernetes".to_string()]);
        assert_eq!(s, 0.0);
    }

    #[test]
    fn index_builder_aggregates_across_chunks() {
        let chunks = vec![
            "Kubernetes pod deployment".to_string(),
            "pod configuration yaml".to_string(),
        ];
        let index = build_doc_index(&chunks);
        assert_eq!(index.term_frequencies.get("pod"), Some(&2));
        assert_eq!(index.term_frequencies.get("kubernet"), Some(&1));
        assert_eq!(index.term_frequencies.get("yaml"), Some(&1));
    }

    #[test]
    fn index_builder_stems_terms() {
        let chunks = vec!["deployments deploying deployed".to_string()];
        let index = build_doc_index(&chunks);
        assert_eq!(index.term_frequencies.get("deploy"), Some(&3));
    }

    #[test]
    fn index_serializes_to_expected_shape() {
        let index = build_doc_index(&["alpha beta".to_string()]);
        let json = serde_json::to_value(&index).unwrap();
        assert!(json.get("term_frequencies").is_some());
        assert_eq!(json.as_object().unwrap().len(), 1);
    }
}
