//! # pmo-index core
//!
//! I/O-free logic for the project-management document index: data
//! models, the markdown/front-matter parser, per-type schemas, the
//! reference grammar, the debounce table, the [`store::Store`] trait with
//! an in-memory backend, and hybrid search scoring.
//!
//! This crate contains no tokio, sqlx or filesystem access.

pub mod debounce;
pub mod embedding;
pub mod error;
pub mod models;
pub mod parse;
pub mod refs;
pub mod schema;
pub mod search;
pub mod store;
