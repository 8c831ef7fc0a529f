//! Tokenizer shared by indexing and querying.
//!
//! Pipeline: lowercase → extract `[a-z0-9]+(-[a-z0-9]+)*` runs (hyphenated
//! compounds survive as single tokens) → drop pure-digit tokens and
//! stopwords → Snowball English stemming.
//!
//! A query term matches an index term iff both stem to the same form, so the
//! exact same function runs on both paths.

use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};
use std::sync::OnceLock;

/// Common English words carrying no retrieval signal.
const STOPWORDS: [&str; 34] = [
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "its", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[a-z0-9]+(?:-[a-z0-9]+)*").unwrap())
}

fn stemmer() -> &'static Stemmer {
    static STEMMER: OnceLock<Stemmer> = OnceLock::new();
    STEMMER.get_or_init(|| Stemmer::create(Algorithm::English))
}

/// Tokenize text into stemmed terms.
///
/// Deterministic: the output is a function of the input alone.
pub fn tokenize(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    let lowered = text.to_lowercase();
    let stemmer = stemmer();

    token_pattern()
        .find_iter(&lowered)
        .map(|m| m.as_str())
        .filter(|token| !token.chars().all(|c| c.is_ascii_digit()))
        .filter(|token| !STOPWORDS.contains(token))
        .map(|token| stemmer.stem(token).into_owned())
        .collect()
}
