//! SQLite-backed [`Store`] implementation.
//!
//! Every write runs in one transaction covering the `documents` row, its
//! `doc_refs` rows, its `documents_fts` row and the `identifiers` claim,
//! so readers on other pool connections (WAL snapshot reads) never see a
//! half-applied document.
//!
//! Write transactions start with `BEGIN IMMEDIATE`: they read before they
//! write, and a deferred transaction upgraded under WAL fails with
//! `SQLITE_BUSY` at once instead of waiting out the busy timeout.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use pmo_index_core::embedding::{blob_to_vec, vec_to_blob};
use pmo_index_core::models::{
    Diagnostic, DiagnosticKind, DocType, Document, DocumentSummary, Reference,
};
use pmo_index_core::store::{
    set_collision_warning, Backlink, Conflict, DanglingReference, DeleteOutcome, IndexStats,
    KeywordHit, ListFilter, ResolvedReference, Store, StoredVector, UpsertOutcome, WarningEntry,
};

const BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

const SELECT_DOC: &str = "SELECT path, doc_type, identifier, title, metadata_json, body, \
     sections_json, warnings_json, content_hash, indexed_at FROM documents";

/// SQLite implementation of the [`Store`] trait.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_references(&self, path: &str) -> Result<Vec<Reference>> {
        let rows = sqlx::query("SELECT kind, target FROM doc_refs WHERE source_path = ?")
            .bind(path)
            .fetch_all(&self.pool)
            .await?;
        let mut refs = rows
            .iter()
            .map(|row| {
                Ok(Reference::new(
                    parse_doc_type(&row.try_get::<String, _>("kind")?)?,
                    row.try_get::<String, _>("target")?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        refs.sort();
        Ok(refs)
    }
}

fn parse_doc_type(s: &str) -> Result<DocType> {
    DocType::from_str(s).map_err(|e| anyhow!(e))
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// Decode a `documents` row. References are loaded separately.
fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let metadata_json: String = row.try_get("metadata_json")?;
    let sections_json: String = row.try_get("sections_json")?;
    let warnings_json: String = row.try_get("warnings_json")?;
    let indexed_at: String = row.try_get("indexed_at")?;
    Ok(Document {
        path: row.try_get("path")?,
        doc_type: parse_doc_type(&row.try_get::<String, _>("doc_type")?)?,
        identifier: row.try_get("identifier")?,
        title: row.try_get("title")?,
        metadata: serde_json::from_str(&metadata_json)?,
        body: row.try_get("body")?,
        sections: serde_json::from_str(&sections_json)?,
        references: Vec::new(),
        content_hash: row.try_get("content_hash")?,
        indexed_at: parse_ts(&indexed_at)?,
        warnings: serde_json::from_str(&warnings_json)?,
    })
}

/// Build an FTS5 query from free text: every word quoted, OR-joined.
///
/// Raw user input would otherwise be interpreted as FTS5 syntax (`risk:x`
/// is a column filter).
pub fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Give up `(doc_type, identifier)` if `path` owns it and promote the
/// smallest remaining claimant. Returns the promoted path.
async fn release_identifier(
    conn: &mut SqliteConnection,
    doc_type: &str,
    identifier: &str,
    path: &str,
) -> Result<Option<String>> {
    let owner: Option<String> = sqlx::query_scalar(
        "SELECT owner_path FROM identifiers WHERE doc_type = ? AND identifier = ?",
    )
    .bind(doc_type)
    .bind(identifier)
    .fetch_optional(&mut *conn)
    .await?;
    if owner.as_deref() != Some(path) {
        return Ok(None);
    }

    sqlx::query("DELETE FROM identifiers WHERE doc_type = ? AND identifier = ?")
        .bind(doc_type)
        .bind(identifier)
        .execute(&mut *conn)
        .await?;

    let next: Option<(String, String)> = sqlx::query_as(
        "SELECT path, warnings_json FROM documents
         WHERE doc_type = ? AND identifier = ? AND path != ?
         ORDER BY path LIMIT 1",
    )
    .bind(doc_type)
    .bind(identifier)
    .bind(path)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((next_path, warnings_json)) = next else {
        return Ok(None);
    };

    sqlx::query("INSERT INTO identifiers (doc_type, identifier, owner_path) VALUES (?, ?, ?)")
        .bind(doc_type)
        .bind(identifier)
        .bind(&next_path)
        .execute(&mut *conn)
        .await?;

    let mut warnings: Vec<Diagnostic> = serde_json::from_str(&warnings_json)?;
    warnings.retain(|w| w.kind != DiagnosticKind::IdentifierCollision);
    sqlx::query("UPDATE documents SET warnings_json = ? WHERE path = ?")
        .bind(serde_json::to_string(&warnings)?)
        .bind(&next_path)
        .execute(&mut *conn)
        .await?;

    Ok(Some(next_path))
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert(&self, doc: &Document) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin_with(BEGIN_WRITE).await?;
        let doc_type = doc.doc_type.as_str();

        let old: Option<(String, String)> =
            sqlx::query_as("SELECT doc_type, identifier FROM documents WHERE path = ?")
                .bind(&doc.path)
                .fetch_optional(&mut *tx)
                .await?;

        let mut promoted = None;
        if let Some((old_type, old_ident)) = old {
            if old_type != doc_type || old_ident != doc.identifier {
                promoted = release_identifier(&mut *tx, &old_type, &old_ident, &doc.path).await?;
            }
        }

        let owner: Option<String> = sqlx::query_scalar(
            "SELECT owner_path FROM identifiers WHERE doc_type = ? AND identifier = ?",
        )
        .bind(doc_type)
        .bind(&doc.identifier)
        .fetch_optional(&mut *tx)
        .await?;

        let conflict = match owner {
            None => {
                sqlx::query(
                    "INSERT INTO identifiers (doc_type, identifier, owner_path) VALUES (?, ?, ?)",
                )
                .bind(doc_type)
                .bind(&doc.identifier)
                .bind(&doc.path)
                .execute(&mut *tx)
                .await?;
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

        sqlx::query(
            r#"
            INSERT INTO documents (path, doc_type, identifier, title, metadata_json, body,
                                   sections_json, warnings_json, content_hash, indexed_at, last_error_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            ON CONFLICT(path) DO UPDATE SET
                doc_type = excluded.doc_type,
                identifier = excluded.identifier,
                title = excluded.title,
                metadata_json = excluded.metadata_json,
                body = excluded.body,
                sections_json = excluded.sections_json,
                warnings_json = excluded.warnings_json,
                content_hash = excluded.content_hash,
                indexed_at = excluded.indexed_at,
                last_error_json = NULL
            "#,
        )
        .bind(&stored.path)
        .bind(doc_type)
        .bind(&stored.identifier)
        .bind(&stored.title)
        .bind(serde_json::to_string(&stored.metadata)?)
        .bind(&stored.body)
        .bind(serde_json::to_string(&stored.sections)?)
        .bind(serde_json::to_string(&stored.warnings)?)
        .bind(&stored.content_hash)
        .bind(format_ts(&stored.indexed_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM doc_refs WHERE source_path = ?")
            .bind(&stored.path)
            .execute(&mut *tx)
            .await?;
        for r in &stored.references {
            sqlx::query(
                "INSERT OR IGNORE INTO doc_refs (source_path, kind, target, name) VALUES (?, ?, ?, ?)",
            )
            .bind(&stored.path)
            .bind(r.kind.as_str())
            .bind(&r.target)
            .bind(r.name())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM documents_fts WHERE path = ?")
            .bind(&stored.path)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO documents_fts (path, doc_type, title, identifier, body) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&stored.path)
        .bind(doc_type)
        .bind(&stored.title)
        .bind(&stored.identifier)
        .bind(&stored.body)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(UpsertOutcome {
            owns_identifier: conflict.is_none(),
            conflict,
            promoted,
        })
    }

    async fn delete(&self, path: &str) -> Result<DeleteOutcome> {
        let mut tx = self.pool.begin_with(BEGIN_WRITE).await?;

        sqlx::query("DELETE FROM vectors WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;

        let old: Option<(String, String)> =
            sqlx::query_as("SELECT doc_type, identifier FROM documents WHERE path = ?")
                .bind(path)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((doc_type, identifier)) = old else {
            tx.commit().await?;
            return Ok(DeleteOutcome::default());
        };

        for sql in [
            "DELETE FROM doc_refs WHERE source_path = ?",
            "DELETE FROM documents_fts WHERE path = ?",
            "DELETE FROM documents WHERE path = ?",
        ] {
            sqlx::query(sql).bind(path).execute(&mut *tx).await?;
        }

        let promoted = release_identifier(&mut *tx, &doc_type, &identifier, path).await?;
        tx.commit().await?;

        Ok(DeleteOutcome {
            existed: true,
            promoted,
        })
    }

    async fn get_by_path(&self, path: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!("{} WHERE path = ?", SELECT_DOC))
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut doc = row_to_document(&row)?;
        doc.references = self.load_references(path).await?;
        Ok(Some(doc))
    }

    async fn get_by_identifier(&self, doc_type: DocType, identifier: &str) -> Result<Option<Document>> {
        let owner: Option<String> = sqlx::query_scalar(
            "SELECT owner_path FROM identifiers WHERE doc_type = ? AND identifier = ?",
        )
        .bind(doc_type.as_str())
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;
        match owner {
            Some(path) => self.get_by_path(&path).await,
            None => Ok(None),
        }
    }

    async fn content_hash(&self, path: &str) -> Result<Option<String>> {
        let hash = sqlx::query_scalar("SELECT content_hash FROM documents WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(hash)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<DocumentSummary>> {
        let rows = sqlx::query(&format!(
            "{} WHERE (?1 IS NULL OR doc_type = ?1) ORDER BY path",
            SELECT_DOC
        ))
        .bind(filter.doc_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::new();
        for row in &rows {
            let doc = row_to_document(row)?;
            if filter.matches(&doc) {
                out.push(doc.summary());
            }
        }
        Ok(out)
    }

    async fn keyword_search(
        &self,
        query: &str,
        limit: i64,
        doc_type: Option<DocType>,
    ) -> Result<Vec<KeywordHit>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r#"
            SELECT path, rank,
                   snippet(documents_fts, 4, '>>>', '<<<', '...', 48) AS snippet
            FROM documents_fts
            WHERE documents_fts MATCH ?1 AND (?2 IS NULL OR doc_type = ?2)
            ORDER BY rank
            LIMIT ?3
            "#,
        )
        .bind(&fts)
        .bind(doc_type.map(|t| t.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let rank: f64 = row.try_get("rank")?;
                Ok(KeywordHit {
                    path: row.try_get("path")?,
                    raw_score: -rank, // negate so higher = better
                    snippet: row.try_get("snippet")?,
                })
            })
            .collect()
    }

    async fn paths(&self) -> Result<Vec<String>> {
        let paths = sqlx::query_scalar("SELECT path FROM documents ORDER BY path")
            .fetch_all(&self.pool)
            .await?;
        Ok(paths)
    }

    async fn record_error(&self, path: &str, diagnostic: &Diagnostic) -> Result<()> {
        sqlx::query("UPDATE documents SET last_error_json = ? WHERE path = ?")
            .bind(serde_json::to_string(diagnostic)?)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_error(&self, path: &str) -> Result<()> {
        sqlx::query("UPDATE documents SET last_error_json = NULL WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn conflicts(&self) -> Result<Vec<Conflict>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT d.doc_type, d.identifier, i.owner_path, d.path
            FROM documents d
            JOIN identifiers i ON i.doc_type = d.doc_type AND i.identifier = d.identifier
            WHERE i.owner_path != d.path
            ORDER BY d.path
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(doc_type, identifier, owner_path, conflicting_path)| {
                Ok(Conflict {
                    doc_type: parse_doc_type(&doc_type)?,
                    identifier,
                    owner_path,
                    conflicting_path,
                })
            })
            .collect()
    }

    async fn warnings(&self) -> Result<Vec<WarningEntry>> {
        let rows: Vec<(String, String, String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT path, doc_type, identifier, warnings_json, last_error_json
            FROM documents
            WHERE warnings_json != '[]' OR last_error_json IS NOT NULL
            ORDER BY path
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(path, doc_type, identifier, warnings_json, error_json)| {
                Ok(WarningEntry {
                    path,
                    doc_type: parse_doc_type(&doc_type)?,
                    identifier,
                    warnings: serde_json::from_str(&warnings_json)?,
                    error: error_json.map(|e| serde_json::from_str(&e)).transpose()?,
                })
            })
            .collect()
    }

    async fn dangling_references(&self) -> Result<Vec<DanglingReference>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT r.source_path, r.kind, r.target
            FROM doc_refs r
            WHERE NOT EXISTS (
                SELECT 1 FROM identifiers i
                WHERE i.doc_type = r.kind AND (i.identifier = r.target OR i.identifier = r.name)
            )
            ORDER BY r.source_path, r.target
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(source_path, kind, target)| {
                Ok(DanglingReference {
                    source_path,
                    kind: parse_doc_type(&kind)?,
                    target,
                })
            })
            .collect()
    }

    async fn references_from(&self, path: &str) -> Result<Vec<ResolvedReference>> {
        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT r.kind, r.target,
                   COALESCE(
                       (SELECT owner_path FROM identifiers WHERE doc_type = r.kind AND identifier = r.target),
                       (SELECT owner_path FROM identifiers WHERE doc_type = r.kind AND identifier = r.name)
                   ) AS resolved
            FROM doc_refs r
            WHERE r.source_path = ?
            "#,
        )
        .bind(path)
        .fetch_all(&self.pool)
        .await?;

        let mut refs = rows
            .into_iter()
            .map(|(kind, target, resolved_path)| {
                Ok(ResolvedReference {
                    kind: parse_doc_type(&kind)?,
                    target,
                    resolved_path,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        refs.sort_by(|a, b| (a.kind, &a.target).cmp(&(b.kind, &b.target)));
        Ok(refs)
    }

    async fn backlinks(&self, doc_type: DocType, identifier: &str) -> Result<Vec<Backlink>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT r.source_path, d.doc_type, d.identifier, r.target
            FROM doc_refs r
            JOIN documents d ON d.path = r.source_path
            WHERE r.kind = ?1 AND (r.target = ?2 OR r.name = ?2)
            ORDER BY r.source_path, r.target
            "#,
        )
        .bind(doc_type.as_str())
        .bind(identifier)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(source_path, source_type, source_identifier, target)| {
                Ok(Backlink {
                    source_path,
                    source_type: parse_doc_type(&source_type)?,
                    source_identifier,
                    target,
                })
            })
            .collect()
    }

    async fn upsert_vector(&self, vector: &StoredVector) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vectors (path, doc_type, identifier, model, dims, text_hash, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                doc_type = excluded.doc_type,
                identifier = excluded.identifier,
                model = excluded.model,
                dims = excluded.dims,
                text_hash = excluded.text_hash,
                embedding = excluded.embedding
            "#,
        )
        .bind(&vector.path)
        .bind(vector.doc_type.as_str())
        .bind(&vector.identifier)
        .bind(&vector.model)
        .bind(vector.dims as i64)
        .bind(&vector.text_hash)
        .bind(vec_to_blob(&vector.vector))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_vector(&self, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM vectors WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn vector_hash(&self, path: &str) -> Result<Option<String>> {
        let hash = sqlx::query_scalar("SELECT text_hash FROM vectors WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(hash)
    }

    async fn vectors(&self) -> Result<Vec<StoredVector>> {
        let rows = sqlx::query(
            "SELECT path, doc_type, identifier, model, dims, text_hash, embedding FROM vectors ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let blob: Vec<u8> = row.try_get("embedding")?;
                let dims: i64 = row.try_get("dims")?;
                Ok(StoredVector {
                    path: row.try_get("path")?,
                    doc_type: parse_doc_type(&row.try_get::<String, _>("doc_type")?)?,
                    identifier: row.try_get("identifier")?,
                    model: row.try_get("model")?,
                    dims: dims as usize,
                    text_hash: row.try_get("text_hash")?,
                    vector: blob_to_vec(&blob),
                })
            })
            .collect()
    }

    async fn stats(&self) -> Result<IndexStats> {
        let by_type_rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT doc_type, COUNT(*) FROM documents GROUP BY doc_type")
                .fetch_all(&self.pool)
                .await?;

        let count = |sql: &'static str| {
            let pool = self.pool.clone();
            async move {
                let n: i64 = sqlx::query_scalar(sql).fetch_one(&pool).await?;
                Ok::<usize, anyhow::Error>(n as usize)
            }
        };

        Ok(IndexStats {
            documents: by_type_rows.iter().map(|(_, n)| *n as usize).sum(),
            by_type: by_type_rows
                .into_iter()
                .map(|(t, n)| (t, n as usize))
                .collect(),
            references: count("SELECT COUNT(*) FROM doc_refs").await?,
            dangling_references: self.dangling_references().await?.len(),
            conflicts: self.conflicts().await?.len(),
            documents_with_warnings: count(
                "SELECT COUNT(*) FROM documents WHERE warnings_json != '[]' OR last_error_json IS NOT NULL",
            )
            .await?,
            vectors: count("SELECT COUNT(*) FROM vectors").await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate::run_migrations;
    use pmo_index_core::parse::parse;

    async fn open_store(dir: &tempfile::TempDir) -> SqliteStore {
        let pool = db::connect(&dir.path().join("index.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn risk(i: usize) -> Document {
        let raw = format!("---\nid: r{i}\nseverity: low\nstatus: open\n---\nrisk number {i}\n");
        parse(&raw, DocType::Risk, &format!("risks/r{i}.md")).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_to_distinct_paths_all_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut tasks = Vec::new();
        for i in 0..200 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move { store.upsert(&risk(i)).await }));
        }
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert!(outcome.owns_identifier);
        }
        assert_eq!(store.paths().await.unwrap().len(), 200);

        let mut tasks = Vec::new();
        for i in 0..100 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.delete(&format!("risks/r{i}.md")).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().unwrap().existed);
        }
        assert_eq!(store.paths().await.unwrap().len(), 100);
    }

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(fts_query("risk:vendor delay").as_deref(), Some("\"risk\" OR \"vendor\" OR \"delay\""));
        assert_eq!(fts_query("  :: "), None);
    }
}
