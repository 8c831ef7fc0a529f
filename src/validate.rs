//! Three-tier upload admission.
//!
//! Upload is a one-time operation but queries happen forever after, so bad
//! input is rejected at the door rather than silently indexed. Tiers, each a
//! hard gate evaluated in order:
//!
//! 1. **Extension** must be on the allow-list.
//! 2. **Magic bytes** must match the MIME type the extension claims
//!    (PDF: `%PDF`; text formats carry no signature and skip this tier).
//! 3. **Extraction** must succeed and yield non-whitespace text. For
//!    structured formats (JSON/XML/YAML) this doubles as parse validation.
//!
//! The validator returns the extracted text so ingestion never runs
//! extraction twice.

use std::path::Path;

use crate::error::{RagError, Result};
use crate::extract::{extract_text, DocFormat};

/// Largest accepted upload.
pub const MAX_FILE_SIZE: usize = 100 * 1024 * 1024;

/// Validation strictness, chosen per extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatPolicy {
    /// Binary formats: signature check plus full extraction.
    Strict,
    /// JSON/XML/YAML: parse must succeed.
    Structured,
    /// Plain text and code: UTF-8 decode is enough.
    Lenient,
}

/// Outcome of a successful admission: the declared format, the policy it was
/// validated under, and the normalized text ready for chunking.
#[derive(Debug)]
pub struct ValidatedUpload {
    pub format: DocFormat,
    pub policy: FormatPolicy,
    pub extension: String,
    pub extracted_text: String,
}

/// All supported extensions (tier 1 allow-list).
const SUPPORTED_EXTENSIONS: [&str; 17] = [
    "pdf", "html", "htm", "json", "xml", "yaml", "yml", "csv", "txt", "md", "markdown", "rst",
    "log", "toml", "ini", "py", "js",
];

fn classify(extension: &str) -> Option<(DocFormat, FormatPolicy)> {
    match extension {
        "pdf" => Some((DocFormat::Pdf, FormatPolicy::Strict)),
        "json" => Some((DocFormat::Json, FormatPolicy::Structured)),
        "xml" => Some((DocFormat::Xml, FormatPolicy::Structured)),
        "yaml" | "yml" => Some((DocFormat::Yaml, FormatPolicy::Structured)),
        "html" | "htm" => Some((DocFormat::Html, FormatPolicy::Lenient)),
        "csv" => Some((DocFormat::Csv, FormatPolicy::Lenient)),
        "txt" | "md" | "markdown" | "rst" | "log" | "toml" | "ini" | "py" | "js" => {
            Some((DocFormat::Text, FormatPolicy::Lenient))
        }
        _ => None,
    }
}

/// Validate an upload and extract its text.
pub fn validate_upload(filename: &str, content: &[u8]) -> Result<ValidatedUpload> {
    if content.len() > MAX_FILE_SIZE {
        return Err(RagError::BadRequest(format!(
            "File '{}' is too large ({:.1}MB). Maximum allowed: {}MB.",
            filename,
            content.len() as f64 / 1024.0 / 1024.0,
            MAX_FILE_SIZE / 1024 / 1024,
        )));
    }

    // Tier 1: extension allow-list.
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    if extension.is_empty() {
        return Err(RagError::UnsupportedFormat(format!(
            "File '{}' has no extension. Supported: {}",
            filename,
            SUPPORTED_EXTENSIONS.join(", "),
        )));
    }

    let (format, policy) = classify(&extension).ok_or_else(|| {
        RagError::UnsupportedFormat(format!(
            "Unsupported file extension '.{}' in '{}'. Supported: {}",
            extension,
            filename,
            SUPPORTED_EXTENSIONS.join(", "),
        ))
    })?;

    // Tier 2: magic bytes. Text formats carry no signature and skip this.
    check_signature(filename, content, format)?;

    // Tier 3: extraction must succeed and produce non-whitespace text.
    let extracted_text = extract_text(content, format)?;
    if extracted_text.trim().is_empty() {
        return Err(RagError::EmptyExtraction(format!(
            "File '{}' produced no extractable text",
            filename,
        )));
    }

    Ok(ValidatedUpload {
        format,
        policy,
        extension,
        extracted_text,
    })
}

fn check_signature(filename: &str, content: &[u8], format: DocFormat) -> Result<()> {
    match format {
        DocFormat::Pdf => {
            if !content.starts_with(b"%PDF") {
                return Err(RagError::SignatureMismatch(format!(
                    "Format mismatch in '{}': extension claims application/pdf \
                     but content lacks the %PDF signature",
                    filename,
                )));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
