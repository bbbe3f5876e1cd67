//! Core data models shared by the parser, the store, and the synchronizer.
//!
//! A [`Document`] is the indexed form of one markdown file under the
//! workspace root. Its [`DocType`] is decided by the directory the file
//! lives in, never by its content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordered metadata mapping parsed from the front-matter block.
///
/// Key order follows the source file (`serde_json` is built with
/// `preserve_order`).
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// The closed set of document types, one per top-level workspace directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Project,
    Epic,
    Decision,
    Risk,
    Meeting,
    Person,
    Log,
    Unknown,
}

impl DocType {
    /// Every type that has a dedicated directory (everything but `Unknown`).
    pub const TRACKED: [DocType; 7] = [
        DocType::Project,
        DocType::Epic,
        DocType::Decision,
        DocType::Risk,
        DocType::Meeting,
        DocType::Person,
        DocType::Log,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Project => "project",
            DocType::Epic => "epic",
            DocType::Decision => "decision",
            DocType::Risk => "risk",
            DocType::Meeting => "meeting",
            DocType::Person => "person",
            DocType::Log => "log",
            DocType::Unknown => "unknown",
        }
    }

    /// Workspace directory holding documents of this type.
    pub fn directory(&self) -> Option<&'static str> {
        match self {
            DocType::Project => Some("projects"),
            DocType::Epic => Some("epics"),
            DocType::Decision => Some("decisions"),
            DocType::Risk => Some("risks"),
            DocType::Meeting => Some("meetings"),
            DocType::Person => Some("people"),
            DocType::Log => Some("logs"),
            DocType::Unknown => None,
        }
    }

    pub fn from_directory(dir: &str) -> DocType {
        DocType::TRACKED
            .into_iter()
            .find(|t| t.directory() == Some(dir))
            .unwrap_or(DocType::Unknown)
    }

    /// Classify a workspace-relative path (`/`-separated) by its first
    /// component. Files directly under the root are `Unknown`.
    pub fn from_path(rel_path: &str) -> DocType {
        match rel_path.split_once('/') {
            Some((first, rest)) if !rest.is_empty() => DocType::from_directory(first),
            _ => DocType::Unknown,
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "project" | "projects" => Ok(DocType::Project),
            "epic" | "epics" => Ok(DocType::Epic),
            "decision" | "decisions" => Ok(DocType::Decision),
            "risk" | "risks" => Ok(DocType::Risk),
            "meeting" | "meetings" => Ok(DocType::Meeting),
            "person" | "people" => Ok(DocType::Person),
            "log" | "logs" => Ok(DocType::Log),
            "unknown" => Ok(DocType::Unknown),
            other => Err(format!(
                "unknown document type '{}'. Expected one of: project, epic, decision, risk, meeting, person, log, unknown",
                other
            )),
        }
    }
}

/// A directed link from one document to another document's identifier.
///
/// `kind` is the type named by the token prefix; `target` is the full
/// `type:name` token as written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    pub kind: DocType,
    pub target: String,
}

impl Reference {
    pub fn new(kind: DocType, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
        }
    }

    /// The part after the `type:` prefix.
    pub fn name(&self) -> &str {
        self.target
            .split_once(':')
            .map(|(_, name)| name)
            .unwrap_or(&self.target)
    }
}

/// Classification of a diagnostic attached to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    MalformedHeader,
    InvalidEncoding,
    ValidationWarning,
    IdentifierCollision,
    EmbeddingUnavailable,
    StoreIo,
}

impl DiagnosticKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticKind::MalformedHeader => "malformed_header",
            DiagnosticKind::InvalidEncoding => "invalid_encoding",
            DiagnosticKind::ValidationWarning => "validation_warning",
            DiagnosticKind::IdentifierCollision => "identifier_collision",
            DiagnosticKind::EmbeddingUnavailable => "embedding_unavailable",
            DiagnosticKind::StoreIo => "store_io",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-fatal problem recorded against a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    /// Metadata key the diagnostic is about, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            field: None,
        }
    }

    pub fn for_field(kind: DiagnosticKind, field: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            field: Some(field.to_string()),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "[{}] {}: {}", self.kind, field, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// One indexed markdown file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Workspace-relative path with `/` separators. Unique key.
    pub path: String,
    pub doc_type: DocType,
    /// Declared `id`, or `"{doc_type}:{file_stem}"` when none is declared.
    pub identifier: String,
    pub title: String,
    pub metadata: Metadata,
    /// Text after the front-matter block, byte-for-byte.
    pub body: String,
    /// `## ` headings in body order.
    pub sections: Vec<String>,
    /// Sorted, de-duplicated.
    pub references: Vec<Reference>,
    /// SHA-256 hex digest of the raw file bytes.
    pub content_hash: String,
    pub indexed_at: DateTime<Utc>,
    pub warnings: Vec<Diagnostic>,
}

impl Document {
    /// Metadata value rendered as a string, for scalar fields.
    pub fn meta_str(&self, key: &str) -> Option<String> {
        meta_scalar(&self.metadata, key)
    }

    pub fn status(&self) -> Option<String> {
        self.meta_str("status")
    }

    pub fn owner(&self) -> Option<String> {
        self.meta_str("owner")
    }

    pub fn has_warning(&self, kind: DiagnosticKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }

    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            path: self.path.clone(),
            doc_type: self.doc_type,
            identifier: self.identifier.clone(),
            title: self.title.clone(),
            owner: self.owner(),
            status: self.status(),
            indexed_at: self.indexed_at,
            warning_count: self.warnings.len(),
        }
    }
}

/// Render a scalar metadata value as a string. Arrays and maps yield `None`.
pub fn meta_scalar(metadata: &Metadata, key: &str) -> Option<String> {
    match metadata.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Lightweight listing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub path: String,
    pub doc_type: DocType,
    pub identifier: String,
    pub title: String,
    pub owner: Option<String>,
    pub status: Option<String>,
    pub indexed_at: DateTime<Utc>,
    pub warning_count: usize,
}

/// What happened to a path, as seen by the change detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed { from: String },
}

/// A classified, debounced filesystem change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub path: String,
    pub kind: ChangeKind,
    pub doc_type: DocType,
}

impl ChangeEvent {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        let path = path.into();
        let doc_type = DocType::from_path(&path);
        Self {
            path,
            kind,
            doc_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_type_from_path() {
        assert_eq!(DocType::from_path("projects/alpha.md"), DocType::Project);
        assert_eq!(DocType::from_path("risks/nested/deep.md"), DocType::Risk);
        assert_eq!(DocType::from_path("people/jane.md"), DocType::Person);
        assert_eq!(DocType::from_path("notes/x.md"), DocType::Unknown);
        assert_eq!(DocType::from_path("readme.md"), DocType::Unknown);
    }

    #[test]
    fn test_doc_type_parse_accepts_directory_names() {
        assert_eq!("risks".parse::<DocType>().unwrap(), DocType::Risk);
        assert_eq!("Person".parse::<DocType>().unwrap(), DocType::Person);
        assert!("widget".parse::<DocType>().is_err());
    }

    #[test]
    fn test_reference_name() {
        let r = Reference::new(DocType::Risk, "risk:vendor-delay");
        assert_eq!(r.name(), "vendor-delay");
    }

    #[test]
    fn test_change_event_classifies_path() {
        let ev = ChangeEvent::new("decisions/adr-1.md", ChangeKind::Created);
        assert_eq!(ev.doc_type, DocType::Decision);
    }
}
