//! Schema creation.
//!
//! The index is a disposable cache of the workspace: when the stored
//! schema version differs from [`SCHEMA_VERSION`] every table is dropped
//! and recreated, and the next reconciliation sweep repopulates it.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

pub const SCHEMA_VERSION: &str = "1";

const TABLES: &[&str] = &[
    "documents_fts",
    "vectors",
    "doc_refs",
    "identifiers",
    "documents",
    "schema_meta",
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let version: Option<String> =
        sqlx::query_scalar("SELECT value FROM schema_meta WHERE key = 'schema_version'")
            .fetch_optional(pool)
            .await?;

    match version.as_deref() {
        Some(SCHEMA_VERSION) => return Ok(()),
        Some(other) => {
            info!(
                found = other,
                expected = SCHEMA_VERSION,
                "index schema version changed, rebuilding"
            );
            drop_all(pool).await?;
        }
        None => {}
    }

    create_all(pool).await
}

async fn drop_all(pool: &SqlitePool) -> Result<()> {
    for table in TABLES {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
            .execute(pool)
            .await?;
    }
    Ok(())
}

async fn create_all(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            path TEXT PRIMARY KEY,
            doc_type TEXT NOT NULL,
            identifier TEXT NOT NULL,
            title TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            body TEXT NOT NULL,
            sections_json TEXT NOT NULL DEFAULT '[]',
            warnings_json TEXT NOT NULL DEFAULT '[]',
            content_hash TEXT NOT NULL,
            indexed_at TEXT NOT NULL,
            last_error_json TEXT
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS doc_refs (
            source_path TEXT NOT NULL,
            kind TEXT NOT NULL,
            target TEXT NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (source_path, kind, target)
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS identifiers (
            doc_type TEXT NOT NULL,
            identifier TEXT NOT NULL,
            owner_path TEXT NOT NULL,
            PRIMARY KEY (doc_type, identifier)
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            path TEXT PRIMARY KEY,
            doc_type TEXT NOT NULL,
            identifier TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            text_hash TEXT NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
    )
    .fetch_one(&mut *tx)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                path UNINDEXED,
                doc_type UNINDEXED,
                title,
                identifier,
                body
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_type ON documents(doc_type)")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_ident ON documents(doc_type, identifier)",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_doc_refs_target ON doc_refs(kind, name)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(SCHEMA_VERSION)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
