//! Multi-format text extraction.
//!
//! Converts an uploaded blob of a declared format into normalized UTF-8
//! text. Binary and markup formats are transformed; everything else passes
//! through as-is:
//!
//! | Format | Output |
//! |--------|--------|
//! | PDF | plain text with document structure preserved |
//! | HTML | Markdown (scripts and styles stripped) |
//! | JSON | YAML serialization of the parsed value |
//! | XML | YAML serialization of the parsed tree |
//! | YAML, CSV, text, code | pass-through (UTF-8 decode) |
//!
//! JSON and XML are re-serialized as YAML because YAML tokenizes with far
//! less punctuation noise than the source syntax.

use serde_json::{Map, Value};

use crate::error::{RagError, Result};

/// Extraction strategy for a validated upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocFormat {
    Pdf,
    Html,
    Json,
    Xml,
    Yaml,
    Csv,
    Text,
}

/// Extract normalized UTF-8 text from raw bytes.
pub fn extract_text(bytes: &[u8], format: DocFormat) -> Result<String> {
    match format {
        DocFormat::Pdf => extract_pdf(bytes),
        DocFormat::Html => Ok(html_to_markdown(&decode_utf8(bytes)?)),
        DocFormat::Json => extract_json(bytes),
        DocFormat::Xml => extract_xml(bytes),
        DocFormat::Yaml => extract_yaml(bytes),
        DocFormat::Csv | DocFormat::Text => decode_utf8(bytes),
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| RagError::ExtractionFailed(format!("not valid UTF-8 text: {}", e)))
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| RagError::ExtractionFailed(format!("PDF extraction failed: {}", e)))
}

fn extract_json(bytes: &[u8]) -> Result<String> {
    let text = decode_utf8(bytes)?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| RagError::ExtractionFailed(format!("invalid JSON: {}", e)))?;
    serde_yaml::to_string(&value)
        .map_err(|e| RagError::ExtractionFailed(format!("YAML serialization failed: {}", e)))
}

fn extract_yaml(bytes: &[u8]) -> Result<String> {
    let text = decode_utf8(bytes)?;
    // Parse to reject broken YAML; the original text is what gets indexed.
    serde_yaml::from_str::<serde_yaml::Value>(&text)
        .map_err(|e| RagError::ExtractionFailed(format!("invalid YAML: {}", e)))?;
    Ok(text)
}

fn extract_xml(bytes: &[u8]) -> Result<String> {
    let text = decode_utf8(bytes)?;
    let value = xml_to_value(&text)?;
    serde_yaml::to_string(&value)
        .map_err(|e| RagError::ExtractionFailed(format!("YAML serialization failed: {}", e)))
}

// ============ XML → JSON value ============

/// Parse an XML document into a nested value: attributes become `@name`
/// keys, mixed text becomes `#text`, repeated sibling elements collapse
/// into arrays.
fn xml_to_value(text: &str) -> Result<Value> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(text);
    reader.config_mut().trim_text(true);

    // One frame per open element: (name, child map, text content).
    let mut stack: Vec<(String, Map<String, Value>, String)> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let map = attribute_map(&e)?;
                stack.push((name, map, String::new()));
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let map = attribute_map(&e)?;
                let value = if map.is_empty() {
                    Value::Null
                } else {
                    Value::Object(map)
                };
                attach_element(&mut stack, &mut root, name, value)?;
            }
            Ok(Event::Text(t)) => {
                if let Some(frame) = stack.last_mut() {
                    let unescaped = t.unescape().map_err(|e| {
                        RagError::ExtractionFailed(format!("invalid XML: {}", e))
                    })?;
                    frame.2.push_str(&unescaped);
                }
            }
            Ok(Event::CData(t)) => {
                if let Some(frame) = stack.last_mut() {
                    frame.2.push_str(&String::from_utf8_lossy(&t));
                }
            }
            Ok(Event::End(_)) => {
                let (name, map, text) = stack.pop().ok_or_else(|| {
                    RagError::ExtractionFailed("invalid XML: unmatched closing tag".to_string())
                })?;
                let value = element_value(map, text);
                attach_element(&mut stack, &mut root, name, value)?;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(RagError::ExtractionFailed(format!("invalid XML: {}", e))),
        }
    }

    if !stack.is_empty() {
        return Err(RagError::ExtractionFailed(
            "invalid XML: unclosed element".to_string(),
        ));
    }

    let (name, value) = root
        .ok_or_else(|| RagError::ExtractionFailed("invalid XML: no root element".to_string()))?;
    let mut doc = Map::new();
    doc.insert(name, value);
    Ok(Value::Object(doc))
}

fn attribute_map(e: &quick_xml::events::BytesStart<'_>) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| RagError::ExtractionFailed(format!("invalid XML: {}", e)))?;
        let key = format!("@{}", String::from_utf8_lossy(attr.key.local_name().as_ref()));
        let value = attr
            .unescape_value()
            .map_err(|e| RagError::ExtractionFailed(format!("invalid XML: {}", e)))?
            .into_owned();
        map.insert(key, Value::String(value));
    }
    Ok(map)
}

fn element_value(map: Map<String, Value>, text: String) -> Value {
    if map.is_empty() {
        if text.is_empty() {
            Value::Null
        } else {
            Value::String(text)
        }
    } else {
        let mut map = map;
        if !text.is_empty() {
            map.insert("#text".to_string(), Value::String(text));
        }
        Value::Object(map)
    }
}

/// Insert a finished element into its parent (repeated names become
/// arrays), or record it as the document root.
fn attach_element(
    stack: &mut [(String, Map<String, Value>, String)],
    root: &mut Option<(String, Value)>,
    name: String,
    value: Value,
) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        match parent.1.remove(&name) {
            None => {
                parent.1.insert(name, value);
            }
            Some(Value::Array(mut items)) => {
                items.push(value);
                parent.1.insert(name, Value::Array(items));
            }
            Some(existing) => {
                parent.1.insert(name, Value::Array(vec![existing, value]));
            }
        }
        Ok(())
    } else if root.is_none() {
        *root = Some((name, value));
        Ok(())
    } else {
        Err(RagError::ExtractionFailed(
            "invalid XML: multiple root elements".to_string(),
        ))
    }
}

// ============ HTML → Markdown ============

/// Convert HTML to Markdown-flavored plain text. Scripts, styles, and the
/// document head are dropped; headings, paragraphs, lists, and table rows
/// keep their structure.
fn html_to_markdown(html: &str) -> String {
    let document = scraper::Html::parse_document(html);
    let mut out = String::new();
    walk_element(document.root_element(), &mut out);
    collapse_blank_lines(&out)
}

fn walk_element(el: scraper::ElementRef<'_>, out: &mut String) {
    let tag = el.value().name();
    match tag {
        "script" | "style" | "head" | "noscript" | "template" => {}
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = tag[1..].parse::<usize>().unwrap_or(1);
            ensure_blank_line(out);
            out.push_str(&"#".repeat(level));
            out.push(' ');
            walk_children(el, out);
            ensure_blank_line(out);
        }
        "p" | "div" | "section" | "article" | "blockquote" | "table" => {
            ensure_blank_line(out);
            walk_children(el, out);
            ensure_blank_line(out);
        }
        "br" => out.push('\n'),
        "li" => {
            ensure_newline(out);
            out.push_str("- ");
            walk_children(el, out);
            ensure_newline(out);
        }
        "tr" => {
            ensure_newline(out);
            out.push_str("| ");
            for cell in el.children() {
                if let Some(cell_el) = scraper::ElementRef::wrap(cell) {
                    if matches!(cell_el.value().name(), "td" | "th") {
                        walk_children(cell_el, out);
                        out.push_str(" | ");
                    }
                }
            }
            ensure_newline(out);
        }
        _ => walk_children(el, out),
    }
}

fn walk_children(el: scraper::ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            let content: &str = &text.text;
            if !content.trim().is_empty() {
                push_inline(out, content);
            }
        } else if let Some(child_el) = scraper::ElementRef::wrap(child) {
            walk_element(child_el, out);
        }
    }
}

fn push_inline(out: &mut String, content: &str) {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return;
    }
    // Leading whitespace in the source marks an inline word boundary.
    if !out.is_empty()
        && !out.ends_with([' ', '\n'])
        && content.starts_with(char::is_whitespace)
    {
        out.push(' ');
    }
    out.push_str(trimmed);
}

fn ensure_newline(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn ensure_blank_line(out: &mut String) {
    if out.is_empty() {
        return;
    }
    while !out.ends_with("\n\n") {
        out.push('\n');
    }
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blank_run = 0;
            out.push_str(line.trim_end());
            out.push('\n');
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let text = extract_text(b"hello world\nsecond line", DocFormat::Text).unwrap();
        assert_eq!(text, "hello world\nsecond line");
    }

    #[test]
    fn invalid_utf8_fails_extraction() {
        let err = extract_text(&[0xff, 0xfe, 0x00], DocFormat::Text).unwrap_err();
        assert!(matches!(err, RagError::ExtractionFailed(_)));
    }

    #[test]
    fn json_is_reserialized_as_yaml() {
        let json = br#"{"service": "search", "replicas": 3, "tags": ["a", "b"]}"#;
        let yaml = extract_text(json, DocFormat::Json).unwrap();
        assert!(yaml.contains("service: search"));
        assert!(yaml.contains("replicas: 3"));
        assert!(yaml.contains("- a"));
        assert!(!yaml.contains('{'));
    }

    #[test]
    fn invalid_json_fails_extraction() {
        let err = extract_text(b"{not json", DocFormat::Json).unwrap_err();
        assert!(matches!(err, RagError::ExtractionFailed(_)));
    }

    #[test]
    fn xml_is_reserialized_as_yaml() {
        let xml = br#"<config env="prod"><name>search</name><port>8080</port></config>"#;
        let yaml = extract_text(xml, DocFormat::Xml).unwrap();
        assert!(yaml.contains("config:"));
        assert!(yaml.contains("'@env': prod"));
        assert!(yaml.contains("name: search"));
        assert!(yaml.contains("port: '8080'"));
    }

    #[test]
    fn repeated_xml_elements_become_arrays() {
        let xml = b"<list><item>one</item><item>two</item></list>";
        let yaml = extract_text(xml, DocFormat::Xml).unwrap();
        assert!(yaml.contains("- one"));
        assert!(yaml.contains("- two"));
    }

    #[test]
    fn malformed_xml_fails_extraction() {
        let err = extract_text(b"<open><unclosed>", DocFormat::Xml).unwrap_err();
        assert!(matches!(err, RagError::ExtractionFailed(_)));
    }

    #[test]
    fn invalid_yaml_fails_extraction() {
        let err = extract_text(b"key: [unclosed", DocFormat::Yaml).unwrap_err();
        assert!(matches!(err, RagError::ExtractionFailed(_)));
    }

    #[test]
    fn valid_yaml_passes_through_verbatim() {
        let yaml = b"service: search\nreplicas: 3\n";
        let text = extract_text(yaml, DocFormat::Yaml).unwrap();
        assert_eq!(text, "service: search\nreplicas: 3\n");
    }

    #[test]
    fn html_headings_become_markdown() {
        let html = b"<html><body><h1>Title</h1><h2>Section</h2><p>Body text.</p></body></html>";
        let md = extract_text(html, DocFormat::Html).unwrap();
        assert!(md.contains("# Title"));
        assert!(md.contains("## Section"));
        assert!(md.contains("Body text."));
    }

    #[test]
    fn html_scripts_and_styles_are_stripped() {
        let html = b"<html><head><style>body { color: red }</style></head>\
            <body><script>alert('x')</script><p>Visible</p></body></html>";
        let md = extract_text(html, DocFormat::Html).unwrap();
        assert!(md.contains("Visible"));
        assert!(!md.contains("alert"));
        assert!(!md.contains("color"));
    }

    #[test]
    fn html_lists_become_dashes() {
        let html = b"<ul><li>first</li><li>second</li></ul>";
        let md = extract_text(html, DocFormat::Html).unwrap();
        assert!(md.contains("- first"));
        assert!(md.contains("- second"));
    }

    #[test]
    fn html_table_rows_become_pipe_rows() {
        let html = b"<table><tr><th>Name</th><th>Port</th></tr><tr><td>api</td><td>8080</td></tr></table>";
        let md = extract_text(html, DocFormat::Html).unwrap();
        assert!(md.contains("| Name | Port |"));
        assert!(md.contains("| api | 8080 |"));
    }

    #[test]
    fn invalid_pdf_fails_extraction() {
        let err = extract_text(b"not a pdf", DocFormat::Pdf).unwrap_err();
        assert!(matches!(err, RagError::ExtractionFailed(_)));
    }
}
