//! Markdown document parser.
//!
//! Turns the raw bytes of one workspace file into a [`Document`]. The
//! parser is pure: it never touches the filesystem and never consults the
//! index, so the same input always yields the same record (apart from
//! `indexed_at`).
//!
//! # Front matter
//!
//! A document may open with a YAML block delimited by `---` lines:
//!
//! ```text
//! ---
//! id: risk:vendor-delay
//! severity: high
//! status: open
//! ---
//! # Vendor delay
//! Blocks project:apollo.
//! ```
//!
//! The block ends at the first following line that is exactly `---` or
//! `...`. Everything after that line is the body, kept byte-for-byte.
//! A file without an opening `---` line has empty metadata and its whole
//! text is the body.

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::ParseError;
use crate::models::{meta_scalar, Diagnostic, DocType, Document, Metadata};
use crate::refs::extract_references;
use crate::schema::validate;

/// SHA-256 hex digest of raw file bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Parse UTF-8 bytes, failing with `InvalidEncoding` otherwise.
pub fn parse_bytes(bytes: &[u8], doc_type: DocType, path: &str) -> Result<Document, ParseError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ParseError::encoding(format!("{} is not valid UTF-8: {}", path, e)))?;
    parse(text, doc_type, path)
}

/// Parse a document.
pub fn parse(raw: &str, doc_type: DocType, path: &str) -> Result<Document, ParseError> {
    let (header, body) = split_front_matter(raw)?;
    let metadata = match header {
        Some(yaml) => yaml_to_metadata(yaml)?,
        None => Metadata::new(),
    };
    Ok(build(raw.as_bytes(), doc_type, path, metadata, body.to_string(), Vec::new()))
}

/// Parse without failing.
///
/// On a parse error the result has empty metadata, the whole text as its
/// body and the error attached as a warning, so a malformed file is still
/// visible in the index.
pub fn parse_lenient(raw: &[u8], doc_type: DocType, path: &str) -> Document {
    match parse_bytes(raw, doc_type, path) {
        Ok(doc) => doc,
        Err(err) => {
            let body = String::from_utf8_lossy(raw).into_owned();
            build(raw, doc_type, path, Metadata::new(), body, vec![err.to_diagnostic()])
        }
    }
}

fn build(
    raw: &[u8],
    doc_type: DocType,
    path: &str,
    metadata: Metadata,
    body: String,
    mut warnings: Vec<Diagnostic>,
) -> Document {
    let stem = file_stem(path);
    let identifier = meta_scalar(&metadata, "id")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("{}:{}", doc_type, stem));

    let (first_heading, sections) = scan_headings(&body);
    let title = meta_scalar(&metadata, "title")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or(first_heading)
        .unwrap_or_else(|| stem.to_string());

    let references = extract_references(&body, &metadata);
    warnings.extend(validate(doc_type, &metadata));

    Document {
        path: path.to_string(),
        doc_type,
        identifier,
        title,
        metadata,
        body,
        sections,
        references,
        content_hash: content_hash(raw),
        indexed_at: Utc::now(),
        warnings,
    }
}

/// File name without directories and without its final extension.
pub fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(i) if i > 0 => &name[..i],
        _ => name,
    }
}

fn is_open_marker(line: &str) -> bool {
    line.trim_end_matches(['\r', '\n']) == "---"
}

fn is_close_marker(line: &str) -> bool {
    let l = line.trim_end_matches(['\r', '\n']);
    l == "---" || l == "..."
}

/// Split raw text into the YAML header (if any) and the body.
pub fn split_front_matter(raw: &str) -> Result<(Option<&str>, &str), ParseError> {
    let mut lines = raw.split_inclusive('\n');
    let Some(first) = lines.next() else {
        return Ok((None, raw));
    };
    if !is_open_marker(first) {
        return Ok((None, raw));
    }

    let header_start = first.len();
    let mut offset = header_start;
    for line in lines {
        if is_close_marker(line) {
            let header = &raw[header_start..offset];
            let body = &raw[offset + line.len()..];
            return Ok((Some(header), body));
        }
        offset += line.len();
    }

    Err(ParseError::malformed("front-matter block is never closed"))
}

fn yaml_to_metadata(yaml: &str) -> Result<Metadata, ParseError> {
    let value: serde_yaml::Value = serde_yaml::from_str(yaml)
        .map_err(|e| ParseError::malformed(format!("invalid YAML: {}", e)))?;
    match value {
        serde_yaml::Value::Null => Ok(Metadata::new()),
        serde_yaml::Value::Mapping(map) => mapping_to_json(map),
        _ => Err(ParseError::malformed("front matter is not a mapping")),
    }
}

fn mapping_to_json(map: serde_yaml::Mapping) -> Result<Metadata, ParseError> {
    let mut out = Metadata::new();
    for (k, v) in map {
        let key = match k {
            serde_yaml::Value::String(s) => s,
            other => {
                return Err(ParseError::malformed(format!(
                    "metadata keys must be strings, found {:?}",
                    other
                )))
            }
        };
        out.insert(key, yaml_to_json(v)?);
    }
    Ok(out)
}

fn yaml_to_json(value: serde_yaml::Value) -> Result<serde_json::Value, ParseError> {
    use serde_json::Value as J;
    use serde_yaml::Value as Y;

    Ok(match value {
        Y::Null => J::Null,
        Y::Bool(b) => J::Bool(b),
        Y::Number(n) => {
            if let Some(i) = n.as_i64() {
                J::from(i)
            } else if let Some(u) = n.as_u64() {
                J::from(u)
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                serde_json::Number::from_f64(f)
                    .map(J::Number)
                    .ok_or_else(|| ParseError::malformed(format!("unrepresentable number {}", n)))?
            }
        }
        Y::String(s) => J::String(s),
        Y::Sequence(items) => J::Array(items.into_iter().map(yaml_to_json).collect::<Result<_, _>>()?),
        Y::Mapping(map) => J::Object(mapping_to_json(map)?),
        Y::Tagged(tagged) => {
            return Err(ParseError::malformed(format!(
                "tagged value {} is not supported",
                tagged.tag
            )))
        }
    })
}

/// First `# ` heading and every `## ` heading, skipping fenced code.
fn scan_headings(body: &str) -> (Option<String>, Vec<String>) {
    let mut in_fence = false;
    let mut first = None;
    let mut sections = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(rest) = line.strip_prefix("## ") {
            let name = rest.trim().trim_end_matches('#').trim();
            if !name.is_empty() {
                sections.push(name.to_string());
            }
        } else if let Some(rest) = line.strip_prefix("# ") {
            if first.is_none() {
                let t = rest.trim();
                if !t.is_empty() {
                    first = Some(t.to_string());
                }
            }
        }
    }

    (first, sections)
}

/// Serialize a document back to file text.
///
/// The front-matter block is emitted when metadata is non-empty, or when
/// the body itself opens with a `---` line (an empty block keeps it from
/// being read as a header).
pub fn render(doc: &Document) -> String {
    let body_opens_block = doc.body.split_inclusive('\n').next().is_some_and(is_open_marker);
    if doc.metadata.is_empty() && !body_opens_block {
        return doc.body.clone();
    }

    let mut out = String::from("---\n");
    if !doc.metadata.is_empty() {
        let yaml = serde_yaml::to_string(&doc.metadata).unwrap_or_default();
        out.push_str(&yaml);
        if !yaml.ends_with('\n') {
            out.push('\n');
        }
    }
    out.push_str("---\n");
    out.push_str(&doc.body);
    out
}
