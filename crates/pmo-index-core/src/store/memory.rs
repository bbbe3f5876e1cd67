//! In-memory [`Store`] implementation for tests and embedding in tools.
//!
//! All state sits behind one `std::sync::RwLock`, so every write is
//! atomic with respect to readers. Keyword search is a plain term count
//! over title, identifier and body.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{Diagnostic, DocType, Document, DocumentSummary, Reference};

use super::{
    reference_matches, set_collision_warning, Backlink, Conflict, DanglingReference,
    DeleteOutcome, IndexStats, KeywordHit, ListFilter, ResolvedReference, Store, StoredVector,
    UpsertOutcome, WarningEntry,
};

type IdentKey = (DocType, String);

struct StoredDoc {
    doc: Document,
    error: Option<Diagnostic>,
}

#[derive(Default)]
struct State {
    docs: BTreeMap<String, StoredDoc>,
    owners: HashMap<IdentKey, String>,
    vectors: BTreeMap<String, StoredVector>,
}

impl State {
    /// Give up `key` if `path` owns it, promoting the smallest other claimant.
    fn release(&mut self, key: &IdentKey, path: &str) -> Option<String> {
        if self.owners.get(key).map(String::as_str) != Some(path) {
            return None;
        }
        self.owners.remove(key);
        let next = self
            .docs
            .iter()
            .find(|(p, s)| {
                p.as_str() != path && s.doc.doc_type == key.0 && s.doc.identifier == key.1
            })
            .map(|(p, _)| p.clone())?;
        self.owners.insert(key.clone(), next.clone());
        if let Some(stored) = self.docs.get_mut(&next) {
            set_collision_warning(&mut stored.doc, None);
        }
        Some(next)
    }

    fn resolve(&self, reference: &Reference) -> Option<String> {
        self.owners
            .get(&(reference.kind, reference.target.clone()))
            .or_else(|| {
                self.owners
                    .get(&(reference.kind, reference.name().to_string()))
            })
            .cloned()
    }

    fn conflicts(&self) -> Vec<Conflict> {
        self.docs
            .iter()
            .filter_map(|(path, s)| {
                let owner = self
                    .owners
                    .get(&(s.doc.doc_type, s.doc.identifier.clone()))?;
                (owner != path).then(|| Conflict {
                    doc_type: s.doc.doc_type,
                    identifier: s.doc.identifier.clone(),
                    owner_path: owner.clone(),
                    conflicting_path: path.clone(),
                })
            })
            .collect()
    }

    fn dangling(&self) -> Vec<DanglingReference> {
        let mut out = Vec::new();
        for (path, s) in &self.docs {
            for r in &s.doc.references {
                if self.resolve(r).is_none() {
                    out.push(DanglingReference {
                        source_path: path.clone(),
                        kind: r.kind,
                        target: r.target.clone(),
                    });
                }
            }
        }
        out
    }
}

/// In-memory store.
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn snippet(body: &str) -> String {
    body.trim().chars().take(240).collect()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert(&self, doc: &Document) -> Result<UpsertOutcome> {
        let mut state = self.write()?;
        let key = (doc.doc_type, doc.identifier.clone());

        let mut promoted = None;
        let old_key = state
            .docs
            .get(&doc.path)
            .map(|s| (s.doc.doc_type, s.doc.identifier.clone()));
        if let Some(old_key) = old_key {
            if old_key != key {
                promoted = state.release(&old_key, &doc.path);
            }
        }

        let conflict = match state.owners.get(&key).cloned() {
            None => {
                state.owners.insert(key, doc.path.clone());
                None
            }
            Some(owner) if owner == doc.path => None,
            Some(owner) => Some(Conflict {
                doc_type: doc.doc_type,
                identifier: doc.identifier.clone(),
                owner_path: owner,
                conflicting_path: doc.path.clone(),
            }),
        };

        let mut stored = doc.clone();
        set_collision_warning(&mut stored, conflict.as_ref().map(|c| c.owner_path.as_str()));
        state.docs.insert(
            doc.path.clone(),
            StoredDoc {
                doc: stored,
                error: None,
            },
        );

        Ok(UpsertOutcome {
            owns_identifier: conflict.is_none(),
            conflict,
            promoted,
        })
    }

    async fn delete(&self, path: &str) -> Result<DeleteOutcome> {
        let mut state = self.write()?;
        state.vectors.remove(path);
        let Some(old) = state.docs.remove(path) else {
            return Ok(DeleteOutcome::default());
        };
        let key = (old.doc.doc_type, old.doc.identifier.clone());
        let promoted = state.release(&key, path);
        Ok(DeleteOutcome {
            existed: true,
            promoted,
        })
    }

    async fn get_by_path(&self, path: &str) -> Result<Option<Document>> {
        Ok(self.read()?.docs.get(path).map(|s| s.doc.clone()))
    }

    async fn get_by_identifier(&self, doc_type: DocType, identifier: &str) -> Result<Option<Document>> {
        let state = self.read()?;
        let doc = state
            .owners
            .get(&(doc_type, identifier.to_string()))
            .and_then(|path| state.docs.get(path))
            .map(|s| s.doc.clone());
        Ok(doc)
    }

    async fn content_hash(&self, path: &str) -> Result<Option<String>> {
        Ok(self
            .read()?
            .docs
            .get(path)
            .map(|s| s.doc.content_hash.clone()))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<DocumentSummary>> {
        Ok(self
            .read()?
            .docs
            .values()
            .filter(|s| filter.matches(&s.doc))
            .map(|s| s.doc.summary())
            .collect())
    }

    async fn keyword_search(
        &self,
        query: &str,
        limit: i64,
        doc_type: Option<DocType>,
    ) -> Result<Vec<KeywordHit>> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.read()?;
        let mut hits: Vec<KeywordHit> = state
            .docs
            .values()
            .filter(|s| doc_type.map_or(true, |t| s.doc.doc_type == t))
            .filter_map(|s| {
                let haystack = format!(
                    "{}\n{}\n{}",
                    s.doc.title, s.doc.identifier, s.doc.body
                )
                .to_lowercase();
                let matches = terms.iter().filter(|t| haystack.contains(*t)).count();
                (matches > 0).then(|| KeywordHit {
                    path: s.doc.path.clone(),
                    raw_score: matches as f64,
                    snippet: snippet(&s.doc.body),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        hits.truncate(limit.max(0) as usize);
        Ok(hits)
    }

    async fn paths(&self) -> Result<Vec<String>> {
        Ok(self.read()?.docs.keys().cloned().collect())
    }

    async fn record_error(&self, path: &str, diagnostic: &Diagnostic) -> Result<()> {
        if let Some(stored) = self.write()?.docs.get_mut(path) {
            stored.error = Some(diagnostic.clone());
        }
        Ok(())
    }

    async fn clear_error(&self, path: &str) -> Result<()> {
        if let Some(stored) = self.write()?.docs.get_mut(path) {
            stored.error = None;
        }
        Ok(())
    }

    async fn conflicts(&self) -> Result<Vec<Conflict>> {
        Ok(self.read()?.conflicts())
    }

    async fn warnings(&self) -> Result<Vec<WarningEntry>> {
        Ok(self
            .read()?
            .docs
            .values()
            .filter(|s| !s.doc.warnings.is_empty() || s.error.is_some())
            .map(|s| WarningEntry {
                path: s.doc.path.clone(),
                doc_type: s.doc.doc_type,
                identifier: s.doc.identifier.clone(),
                warnings: s.doc.warnings.clone(),
                error: s.error.clone(),
            })
            .collect())
    }

    async fn dangling_references(&self) -> Result<Vec<DanglingReference>> {
        Ok(self.read()?.dangling())
    }

    async fn references_from(&self, path: &str) -> Result<Vec<ResolvedReference>> {
        let state = self.read()?;
        let Some(stored) = state.docs.get(path) else {
            return Ok(Vec::new());
        };
        Ok(stored
            .doc
            .references
            .iter()
            .map(|r| ResolvedReference {
                kind: r.kind,
                target: r.target.clone(),
                resolved_path: state.resolve(r),
            })
            .collect())
    }

    async fn backlinks(&self, doc_type: DocType, identifier: &str) -> Result<Vec<Backlink>> {
        let state = self.read()?;
        let mut out = Vec::new();
        for (path, s) in &state.docs {
            for r in &s.doc.references {
                if reference_matches(r, doc_type, identifier) {
                    out.push(Backlink {
                        source_path: path.clone(),
                        source_type: s.doc.doc_type,
                        source_identifier: s.doc.identifier.clone(),
                        target: r.target.clone(),
                    });
                }
            }
        }
        Ok(out)
    }

    async fn upsert_vector(&self, vector: &StoredVector) -> Result<()> {
        self.write()?
            .vectors
            .insert(vector.path.clone(), vector.clone());
        Ok(())
    }

    async fn remove_vector(&self, path: &str) -> Result<()> {
        self.write()?.vectors.remove(path);
        Ok(())
    }

    async fn vector_hash(&self, path: &str) -> Result<Option<String>> {
        Ok(self
            .read()?
            .vectors
            .get(path)
            .map(|v| v.text_hash.clone()))
    }

    async fn vectors(&self) -> Result<Vec<StoredVector>> {
        Ok(self.read()?.vectors.values().cloned().collect())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let state = self.read()?;
        let mut stats = IndexStats {
            documents: state.docs.len(),
            vectors: state.vectors.len(),
            conflicts: state.conflicts().len(),
            dangling_references: state.dangling().len(),
            ..IndexStats::default()
        };
        for s in state.docs.values() {
            *stats
                .by_type
                .entry(s.doc.doc_type.as_str().to_string())
                .or_insert(0) += 1;
            stats.references += s.doc.references.len();
            if !s.doc.warnings.is_empty() || s.error.is_some() {
                stats.documents_with_warnings += 1;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiagnosticKind;
    use crate::parse::parse;

    fn risk(path: &str, id: &str, extra: &str) -> Document {
        let raw = format!("---\nid: {}\nseverity: high\nstatus: open\n---\n{}\n", id, extra);
        parse(&raw, DocType::Risk, path).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = InMemoryStore::new();
        let doc = risk("risks/a.md", "risk:a", "body");
        let out = store.upsert(&doc).await.unwrap();
        assert!(out.owns_identifier);
        let got = store.get_by_identifier(DocType::Risk, "risk:a").await.unwrap().unwrap();
        assert_eq!(got.path, "risks/a.md");
        assert_eq!(store.content_hash("risks/a.md").await.unwrap(), Some(doc.content_hash));
    }

    #[tokio::test]
    async fn test_collision_first_claimant_wins() {
        let store = InMemoryStore::new();
        store.upsert(&risk("risks/a.md", "risk:x", "")).await.unwrap();
        let out = store.upsert(&risk("risks/b.md", "risk:x", "")).await.unwrap();
        assert!(!out.owns_identifier);
        assert_eq!(out.conflict.unwrap().owner_path, "risks/a.md");

        let owner = store.get_by_identifier(DocType::Risk, "risk:x").await.unwrap().unwrap();
        assert_eq!(owner.path, "risks/a.md");
        let loser = store.get_by_path("risks/b.md").await.unwrap().unwrap();
        assert!(loser.has_warning(DiagnosticKind::IdentifierCollision));
        assert_eq!(store.conflicts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_promotes_smallest_claimant() {
        let store = InMemoryStore::new();
        store.upsert(&risk("risks/b.md", "risk:x", "")).await.unwrap();
        store.upsert(&risk("risks/d.md", "risk:x", "")).await.unwrap();
        store.upsert(&risk("risks/c.md", "risk:x", "")).await.unwrap();

        let out = store.delete("risks/b.md").await.unwrap();
        assert!(out.existed);
        assert_eq!(out.promoted.as_deref(), Some("risks/c.md"));
        let owner = store.get_by_path("risks/c.md").await.unwrap().unwrap();
        assert!(!owner.has_warning(DiagnosticKind::IdentifierCollision));
        assert_eq!(store.conflicts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_identifier_change_releases_claim() {
        let store = InMemoryStore::new();
        store.upsert(&risk("risks/a.md", "risk:x", "")).await.unwrap();
        store.upsert(&risk("risks/b.md", "risk:x", "")).await.unwrap();
        let out = store.upsert(&risk("risks/a.md", "risk:y", "")).await.unwrap();
        assert_eq!(out.promoted.as_deref(), Some("risks/b.md"));
        assert!(store.conflicts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryStore::new();
        let out = store.delete("risks/none.md").await.unwrap();
        assert!(!out.existed);
    }

    #[tokio::test]
    async fn test_dangling_after_delete() {
        let store = InMemoryStore::new();
        store.upsert(&risk("risks/a.md", "risk:a", "")).await.unwrap();
        let project = parse(
            "---\nid: project:p\nowner: x\nstatus: active\n---\nsee risk:a\n",
            DocType::Project,
            "projects/p.md",
        )
        .unwrap();
        store.upsert(&project).await.unwrap();
        assert!(store.dangling_references().await.unwrap().is_empty());
        let backlinks = store.backlinks(DocType::Risk, "risk:a").await.unwrap();
        assert_eq!(backlinks[0].source_path, "projects/p.md");

        store.delete("risks/a.md").await.unwrap();
        let dangling = store.dangling_references().await.unwrap();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].target, "risk:a");
        assert!(store.get_by_path("projects/p.md").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reference_resolves_by_name() {
        let store = InMemoryStore::new();
        store.upsert(&risk("risks/a.md", "vendor", "")).await.unwrap();
        store.upsert(&risk("risks/b.md", "risk:b", "blocked by risk:vendor")).await.unwrap();
        let refs = store.references_from("risks/b.md").await.unwrap();
        assert_eq!(refs[0].resolved_path.as_deref(), Some("risks/a.md"));
    }

    #[tokio::test]
    async fn test_record_and_clear_error() {
        let store = InMemoryStore::new();
        store.upsert(&risk("risks/a.md", "risk:a", "")).await.unwrap();
        let diag = Diagnostic::new(DiagnosticKind::MalformedHeader, "bad");
        store.record_error("risks/a.md", &diag).await.unwrap();
        assert_eq!(store.warnings().await.unwrap()[0].error, Some(diag));
        store.clear_error("risks/a.md").await.unwrap();
        assert!(store.warnings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keyword_search_and_list() {
        let store = InMemoryStore::new();
        store.upsert(&risk("risks/a.md", "risk:a", "vendor delay")).await.unwrap();
        store.upsert(&risk("risks/b.md", "risk:b", "budget")).await.unwrap();
        let hits = store.keyword_search("vendor", 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "risks/a.md");

        let all = store.list(&ListFilter::of_type(DocType::Risk)).await.unwrap();
        let paths: Vec<_> = all.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, vec!["risks/a.md", "risks/b.md"]);
    }

    #[tokio::test]
    async fn test_stats() {
        let store = InMemoryStore::new();
        store.upsert(&risk("risks/a.md", "risk:a", "see project:missing")).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.by_type.get("risk"), Some(&1));
        assert_eq!(stats.dangling_references, 1);
    }
}
