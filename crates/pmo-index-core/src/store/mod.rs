//! Storage abstraction for the document index.
//!
//! The [`Store`] trait is the only way the synchronizer and the query
//! surface touch persisted state. Two backends implement it: the SQLite
//! store in the `pmo-index` crate and [`memory::InMemoryStore`] here.
//!
//! # Identifier ownership
//!
//! Each `(doc_type, identifier)` pair has at most one owning path. The
//! first path to claim a pair owns it; later claimants are stored with an
//! `IdentifierCollision` warning and are reachable only by path. When the
//! owner is deleted or stops claiming the pair, the lexicographically
//! smallest remaining claimant is promoted and its collision warning is
//! cleared in the same write.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert`](Store::upsert) | Replace a document with its references and identifier claim |
//! | [`delete`](Store::delete) | Remove a document (idempotent) |
//! | [`get_by_path`](Store::get_by_path) | Full record by path |
//! | [`get_by_identifier`](Store::get_by_identifier) | Owning record for an identifier |
//! | [`list`](Store::list) | Filtered summaries |
//! | [`keyword_search`](Store::keyword_search) | Keyword candidates |
//! | [`conflicts`](Store::conflicts) | Identifier collisions |
//! | [`dangling_references`](Store::dangling_references) | Unresolved references |

pub mod memory;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{Diagnostic, DiagnosticKind, DocType, Document, DocumentSummary, Reference};

/// Result of [`Store::upsert`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct UpsertOutcome {
    /// Whether the path now owns its `(doc_type, identifier)`.
    pub owns_identifier: bool,
    /// Set when another path already owns the identifier.
    pub conflict: Option<Conflict>,
    /// A path promoted to owner of the identifier this path gave up.
    pub promoted: Option<String>,
}

/// Result of [`Store::delete`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DeleteOutcome {
    pub existed: bool,
    pub promoted: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub doc_type: DocType,
    pub identifier: String,
    pub owner_path: String,
    pub conflicting_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DanglingReference {
    pub source_path: String,
    pub kind: DocType,
    pub target: String,
}

/// An outgoing reference with the path it resolves to, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedReference {
    pub kind: DocType,
    pub target: String,
    pub resolved_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backlink {
    pub source_path: String,
    pub source_type: DocType,
    pub source_identifier: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarningEntry {
    pub path: String,
    pub doc_type: DocType,
    pub identifier: String,
    pub warnings: Vec<Diagnostic>,
    /// Latest sync failure for a retained record.
    pub error: Option<Diagnostic>,
}

/// A keyword search candidate.
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub path: String,
    pub raw_score: f64,
    pub snippet: String,
}

/// One persisted embedding, keyed by document path.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
    pub path: String,
    pub doc_type: DocType,
    pub identifier: String,
    pub model: String,
    pub dims: usize,
    /// Hash of the text that was embedded.
    pub text_hash: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub by_type: BTreeMap<String, usize>,
    pub references: usize,
    pub dangling_references: usize,
    pub conflicts: usize,
    pub documents_with_warnings: usize,
    pub vectors: usize,
}

/// Listing filter. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub doc_type: Option<DocType>,
    pub status: Option<String>,
    pub owner: Option<String>,
    /// Arbitrary `key = value` metadata matches on scalar values.
    pub metadata: Vec<(String, String)>,
}

impl ListFilter {
    pub fn of_type(doc_type: DocType) -> Self {
        Self {
            doc_type: Some(doc_type),
            ..Self::default()
        }
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    /// Status comparison is case-insensitive; other fields are exact.
    pub fn matches(&self, doc: &Document) -> bool {
        if self.doc_type.is_some_and(|t| t != doc.doc_type) {
            return false;
        }
        if let Some(status) = &self.status {
            match doc.status() {
                Some(s) if s.eq_ignore_ascii_case(status) => {}
                _ => return false,
            }
        }
        if let Some(owner) = &self.owner {
            if doc.owner().as_deref() != Some(owner.as_str()) {
                return false;
            }
        }
        self.metadata
            .iter()
            .all(|(k, v)| doc.meta_str(k).as_deref() == Some(v.as_str()))
    }
}

/// Whether `reference` points at `identifier` owned within `doc_type`.
///
/// Matches either the full `type:name` token or just the name, so both
/// `id: risk:vendor` and `id: vendor` satisfy `risk:vendor`.
pub fn reference_matches(reference: &Reference, doc_type: DocType, identifier: &str) -> bool {
    reference.kind == doc_type && (reference.target == identifier || reference.name() == identifier)
}

/// Replace any collision warning on `doc` according to ownership.
pub fn set_collision_warning(doc: &mut Document, owner_path: Option<&str>) {
    doc.warnings
        .retain(|w| w.kind != DiagnosticKind::IdentifierCollision);
    if let Some(owner) = owner_path {
        doc.warnings.push(Diagnostic::new(
            DiagnosticKind::IdentifierCollision,
            format!(
                "identifier '{}' is already used by {} ({})",
                doc.identifier, owner, doc.doc_type
            ),
        ));
    }
}

/// Abstract storage backend.
///
/// Writes for a single path are serialized by the caller; implementations
/// must still keep each call atomic so concurrent readers never observe a
/// half-applied document.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert(&self, doc: &Document) -> Result<UpsertOutcome>;

    async fn delete(&self, path: &str) -> Result<DeleteOutcome>;

    async fn get_by_path(&self, path: &str) -> Result<Option<Document>>;

    async fn get_by_identifier(&self, doc_type: DocType, identifier: &str) -> Result<Option<Document>>;

    /// Stored content hash, for the unchanged-content short circuit.
    async fn content_hash(&self, path: &str) -> Result<Option<String>>;

    /// Summaries ordered by path.
    async fn list(&self, filter: &ListFilter) -> Result<Vec<DocumentSummary>>;

    async fn keyword_search(
        &self,
        query: &str,
        limit: i64,
        doc_type: Option<DocType>,
    ) -> Result<Vec<KeywordHit>>;

    /// Every indexed path, sorted.
    async fn paths(&self) -> Result<Vec<String>>;

    /// Attach a sync failure to a retained record. No-op for unknown paths.
    async fn record_error(&self, path: &str, diagnostic: &Diagnostic) -> Result<()>;

    async fn clear_error(&self, path: &str) -> Result<()>;

    async fn conflicts(&self) -> Result<Vec<Conflict>>;

    async fn warnings(&self) -> Result<Vec<WarningEntry>>;

    async fn dangling_references(&self) -> Result<Vec<DanglingReference>>;

    async fn references_from(&self, path: &str) -> Result<Vec<ResolvedReference>>;

    async fn backlinks(&self, doc_type: DocType, identifier: &str) -> Result<Vec<Backlink>>;

    async fn upsert_vector(&self, vector: &StoredVector) -> Result<()>;

    async fn remove_vector(&self, path: &str) -> Result<()>;

    /// Text hash of the stored vector for `path`.
    async fn vector_hash(&self, path: &str) -> Result<Option<String>>;

    async fn vectors(&self) -> Result<Vec<StoredVector>>;

    async fn stats(&self) -> Result<IndexStats>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;

    #[test]
    fn test_filter_matches() {
        let doc = parse(
            "---\nid: p1\nowner: jane\nstatus: Active\nphase: build\n---\n",
            DocType::Project,
            "projects/p1.md",
        )
        .unwrap();
        assert!(ListFilter::of_type(DocType::Project).status("active").matches(&doc));
        assert!(ListFilter::default().owner("jane").with_meta("phase", "build").matches(&doc));
        assert!(!ListFilter::of_type(DocType::Risk).matches(&doc));
        assert!(!ListFilter::default().with_meta("phase", "design").matches(&doc));
    }

    #[test]
    fn test_reference_matches_full_or_name() {
        let r = Reference::new(DocType::Risk, "risk:vendor");
        assert!(reference_matches(&r, DocType::Risk, "risk:vendor"));
        assert!(reference_matches(&r, DocType::Risk, "vendor"));
        assert!(!reference_matches(&r, DocType::Project, "vendor"));
    }

    #[test]
    fn test_set_collision_warning_replaces() {
        let mut doc = parse("---\nid: x\n---\n", DocType::Person, "people/b.md").unwrap();
        set_collision_warning(&mut doc, Some("people/a.md"));
        set_collision_warning(&mut doc, Some("people/a.md"));
        assert_eq!(doc.warnings.len(), 1);
        set_collision_warning(&mut doc, None);
        assert!(doc.warnings.is_empty());
    }
}
