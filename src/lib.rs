//! # pmo-index
//!
//! Keeps a queryable SQLite index of a project-management workspace in
//! sync with the markdown files on disk.
//!
//! Documents live in typed directories (`projects/`, `epics/`,
//! `decisions/`, `risks/`, `meetings/`, `people/`, `logs/`) and carry YAML
//! front matter. Parsing, schemas, references and scoring are pure and live
//! in [`pmo_index_core`]; this crate adds the I/O.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐   ┌───────────┐
//! │  notify /  │──▶│   Debounce   │──▶│ Synchronizer │──▶│  SQLite   │
//! │  walkdir   │   │  + classify  │   │ (per path)   │   │ FTS5+Vec  │
//! └────────────┘   └──────────────┘   └──────┬───────┘   └─────┬─────┘
//!                                            │ best effort     │
//!                                            ▼                 ▼
//!                                     ┌──────────────┐   ┌───────────┐
//!                                     │  Embeddings  │   │ CLI / HTTP│
//!                                     └──────────────┘   └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation and version check |
//! | [`sqlite_store`] | SQLite implementation of the `Store` trait |
//! | [`scan`] | Path filtering and reconciliation sweeps |
//! | [`watcher`] | Filesystem change detection |
//! | [`sync`] | Change application, patching, reconciliation |
//! | [`embedding`] | Embedding providers and vector index |
//! | [`index`] | The `Index` handle |
//! | [`server`] | HTTP API |
//! | [`get`], [`search`], [`stats`] | CLI command output |

pub mod config;
pub mod db;
pub mod embedding;
pub mod get;
pub mod index;
pub mod migrate;
pub mod scan;
pub mod search;
pub mod server;
pub mod sqlite_store;
pub mod stats;
pub mod sync;
pub mod watcher;
