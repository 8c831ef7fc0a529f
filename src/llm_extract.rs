//! LLM summary and keyword extraction.
//!
//! One call per document produces a 2–3 sentence summary and 10–15 salient
//! keywords, used by the hybrid scorer's keyword boost and shown in document
//! listings. Two conditions share the same retry loop: transient API errors
//! and responses that fail to parse as the expected JSON shape (the model
//! occasionally emits invalid JSON).
//!
//! Exhausting retries is **soft**: ingestion proceeds with no summary and no
//! keywords, hybrid search simply runs without the boost.

use std::time::Duration;

use crate::llm::{LlmClient, LlmError};

/// Total attempts including the first.
const MAX_ATTEMPTS: u32 = 5;
/// Initial backoff delay; doubles each retry (1s, 2s, 4s, 8s, 16s).
const INITIAL_DELAY_SECS: u64 = 1;

/// Inputs shorter than this skip the LLM call outright.
const MIN_TEXT_LEN: usize = 100;
/// Inputs are truncated to this many bytes before prompting.
const MAX_TEXT_LEN: usize = 25_000;
/// Hard cap on accepted keywords.
const MAX_KEYWORDS: usize = 20;

/// Extraction result. `summary` is `None` when extraction failed or was
/// skipped; `keywords` is empty in the same cases.
#[derive(Debug, Clone, Default)]
pub struct DocSummary {
    pub summary: Option<String>,
    pub keywords: Vec<String>,
}

/// Extract summary and keywords from the full document text. Never fails;
/// the default result is returned when the model cannot be reached or never
/// produces valid output.
pub async fn extract_summary_and_keywords(llm: &LlmClient, text: &str) -> DocSummary {
    let trimmed = text.trim();
    if trimmed.len() < MIN_TEXT_LEN {
        tracing::debug!("text too short for summarization, skipping LLM call");
        return DocSummary::default();
    }

    let input = truncate_utf8(trimmed, MAX_TEXT_LEN);
    let prompt = build_prompt(input);

    let mut delay = Duration::from_secs(INITIAL_DELAY_SECS);

    for attempt in 1..=MAX_ATTEMPTS {
        match llm.generate_json(&prompt, 0.1, 512).await {
            Ok(response) => match parse_extraction_response(&response) {
                Some(result) => {
                    tracing::info!(
                        keywords = result.keywords.len(),
                        "extracted document summary and keywords"
                    );
                    return result;
                }
                None => {
                    tracing::warn!(
                        attempt,
                        "LLM returned a malformed extraction response, retrying"
                    );
                }
            },
            Err(LlmError::Disabled) => return DocSummary::default(),
            Err(LlmError::Api(msg)) => {
                tracing::error!(error = %msg, "non-retriable LLM extraction error");
                return DocSummary::default();
            }
            Err(LlmError::Transient(msg)) => {
                tracing::warn!(attempt, error = %msg, "transient LLM extraction error");
            }
        }

        if attempt < MAX_ATTEMPTS {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    tracing::error!("LLM extraction failed after {} attempts", MAX_ATTEMPTS);
    DocSummary::default()
}

fn build_prompt(text: &str) -> String {
    format!(
        r#"Analyze this document and provide:

1. **Summary**: 2-3 concise sentences capturing the main topics and purpose
2. **Keywords**: 10-15 key technical terms, concepts, or topics (single words or short phrases)

Document text:
{text}

Output format (valid JSON):
{{
  "summary": "your 2-3 sentence summary here",
  "keywords": ["keyword1", "keyword2", "keyword3"]
}}

Requirements:
- Summary must be 2-3 sentences maximum
- Keywords should be lowercase, single words or short phrases (e.g., "kubernetes", "machine learning")
- Keywords should be the most important technical terms, concepts, or topics
- Return valid JSON only, no additional text"#
    )
}

/// Parse the model's JSON response. Returns `None` when the shape is wrong,
/// which the caller treats as a retriable condition.
fn parse_extraction_response(response: &str) -> Option<DocSummary> {
    let value: serde_json::Value = serde_json::from_str(response.trim()).ok()?;
    let object = value.as_object()?;

    let summary = object
        .get("summary")
        .and_then(|s| s.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let mut keywords: Vec<String> = object
        .get("keywords")
        .and_then(|k| k.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|k| k.as_str())
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect()
        })
        .unwrap_or_default();

    if summary.is_none() && keywords.is_empty() {
        return None;
    }

    if keywords.len() > MAX_KEYWORDS {
        keywords.truncate(MAX_KEYWORDS);
    }

    Some(DocSummary { summary, keywords })
}

fn truncate_utf8(text: &str, max_len: usize) -> &str {
    if text.len() <= max_len {
        return text;
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
