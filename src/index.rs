//! The [`Index`] handle: an opened database plus the synchronizer and
//! query surface built on it.
//!
//! There is no process-wide instance. Callers `open` a handle, share it
//! (usually behind an `Arc`), and `close` it to flush the pool.

use anyhow::{anyhow, bail, Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pmo_index_core::models::{DocType, Document, DocumentSummary};
use pmo_index_core::search::{search, SearchMode, SearchParams, SearchRequest, SearchResultItem};
use pmo_index_core::store::{
    Backlink, Conflict, DanglingReference, IndexStats, ListFilter, ResolvedReference, Store,
    WarningEntry,
};

use crate::config::{validate, Config};
use crate::db;
use crate::embedding::EmbeddingIndex;
use crate::migrate::run_migrations;
use crate::scan::PathFilter;
use crate::sqlite_store::SqliteStore;
use crate::sync::{IndexEvent, ReconcileReport, SyncError, SyncOutcome, Synchronizer};

pub struct Index {
    config: Config,
    pool: Option<SqlitePool>,
    store: Arc<dyn Store>,
    embeddings: Option<EmbeddingIndex>,
    sync: Arc<Synchronizer>,
}

impl Index {
    /// Connect to the configured SQLite file (creating it if needed) and
    /// bring its schema up to date.
    pub async fn open(config: Config) -> Result<Self> {
        validate(&config)?;
        let db_path = config.db_path();
        let pool = db::connect(&db_path).await?;
        run_migrations(&pool)
            .await
            .with_context(|| format!("Failed to migrate {}", db_path.display()))?;
        info!(db = %db_path.display(), "index opened");

        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
        let mut index = Self::with_store(config, store)?;
        index.pool = Some(pool);
        Ok(index)
    }

    /// Build a handle over any [`Store`] implementation.
    pub fn with_store(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        let embeddings = if config.embedding.is_enabled() {
            Some(EmbeddingIndex::new(&config.embedding, Arc::clone(&store))?)
        } else {
            None
        };
        let filter = PathFilter::new(&config.workspace)?;
        let sync = Arc::new(Synchronizer::new(
            Arc::clone(&store),
            embeddings.clone(),
            filter,
            config.sync.clone(),
            config.watch.clone(),
        ));
        Ok(Self {
            config,
            pool: None,
            store,
            embeddings,
            sync,
        })
    }

    /// Let queued embedding work finish, then close the pool.
    pub async fn close(self) {
        self.sync.embeddings_idle().await;
        if let Some(pool) = self.pool {
            pool.close().await;
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.sync
    }

    // ============ Synchronization ============

    pub async fn notify_external_write(&self, path: &str) -> Result<SyncOutcome, SyncError> {
        self.sync.notify_external_write(path).await
    }

    pub async fn apply_patch(
        &self,
        path: &str,
        content: &str,
        backup: bool,
    ) -> Result<SyncOutcome, SyncError> {
        self.sync.apply_patch(path, content, backup).await
    }

    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<ReconcileReport, SyncError> {
        self.sync.reconcile(cancel).await
    }

    pub async fn watch(&self, cancel: CancellationToken) -> Result<()> {
        Arc::clone(&self.sync).watch(cancel).await
    }

    pub async fn embeddings_idle(&self) {
        self.sync.embeddings_idle().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.sync.subscribe()
    }

    // ============ Queries ============

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<DocumentSummary>> {
        self.store.list(filter).await
    }

    pub async fn get_by_path(&self, path: &str) -> Result<Option<Document>> {
        self.store.get_by_path(path).await
    }

    pub async fn get_by_identifier(&self, doc_type: DocType, identifier: &str) -> Result<Option<Document>> {
        self.store.get_by_identifier(doc_type, identifier).await
    }

    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        doc_type: Option<DocType>,
        limit: Option<i64>,
    ) -> Result<Vec<SearchResultItem>> {
        let mut params = SearchParams {
            hybrid_alpha: self.config.retrieval.hybrid_alpha,
            candidate_k: self.config.retrieval.candidate_k,
            final_limit: self.config.retrieval.final_limit,
        };
        if let Some(limit) = limit {
            if limit < 1 {
                bail!("limit must be >= 1");
            }
            params.final_limit = limit;
        }

        let query_vec = if mode.needs_vector() && !query.trim().is_empty() {
            let embeddings = self.embeddings.as_ref().ok_or_else(|| {
                anyhow!("{} search requires embeddings; embedding provider is disabled", mode)
            })?;
            Some(embeddings.embed_query(query).await?)
        } else {
            None
        };

        let req = SearchRequest {
            query,
            query_vec: query_vec.as_deref(),
            mode,
            doc_type,
            params,
            explain: false,
        };
        search(self.store.as_ref(), &req).await
    }

    /// Identifiers most similar to `query`.
    pub async fn nearest(&self, query: &str, k: usize) -> Result<Vec<(String, f32)>> {
        let embeddings = self
            .embeddings
            .as_ref()
            .ok_or_else(|| anyhow!("nearest requires embeddings; embedding provider is disabled"))?;
        Ok(embeddings.nearest(query, k).await?)
    }

    pub async fn references_from(&self, path: &str) -> Result<Vec<ResolvedReference>> {
        self.store.references_from(path).await
    }

    pub async fn backlinks(&self, doc_type: DocType, identifier: &str) -> Result<Vec<Backlink>> {
        self.store.backlinks(doc_type, identifier).await
    }

    pub async fn conflicts(&self) -> Result<Vec<Conflict>> {
        self.store.conflicts().await
    }

    pub async fn warnings(&self) -> Result<Vec<WarningEntry>> {
        self.store.warnings().await
    }

    pub async fn dangling_references(&self) -> Result<Vec<DanglingReference>> {
        self.store.dangling_references().await
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        self.store.stats().await
    }
}
