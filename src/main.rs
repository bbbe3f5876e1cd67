//! # pmo CLI
//!
//! The `pmo` binary keeps a SQLite index of a project-management workspace
//! (markdown files with YAML front matter) in sync with disk, and queries it.
//!
//! ## Usage
//!
//! ```bash
//! pmo --config ./pmo.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pmo init` | Create the workspace directories and the index database |
//! | `pmo reconcile` | Sweep the workspace and bring the index in line with disk |
//! | `pmo watch [--serve]` | Reconcile, then follow filesystem changes (optionally serving the API) |
//! | `pmo serve` | Start the HTTP API |
//! | `pmo list` | List indexed documents |
//! | `pmo get <path>` | Show one document by path |
//! | `pmo id <type> <id>` | Show the document owning an identifier |
//! | `pmo search "<query>"` | Keyword, semantic or hybrid search |
//! | `pmo diagnostics` | Collisions, warnings and dangling references |
//! | `pmo stats` | Index counts |
//! | `pmo apply <path> <file>` | Replace a document's content and re-index it |
//!
//! Logs go to stderr and honour `RUST_LOG` (default `pmo_index=info`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pmo_index::config::{self, Config};
use pmo_index::index::Index;
use pmo_index::{get, search, server, stats};
use pmo_index_core::models::DocType;
use pmo_index_core::search::SearchMode;
use pmo_index_core::store::ListFilter;

const DEFAULT_CONFIG: &str = "./pmo.toml";

/// pmo: a file-backed project-management index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Without one, the current directory is the workspace root.
#[derive(Parser)]
#[command(name = "pmo", version, about = "Keep a queryable index of a markdown PM workspace")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Override `[workspace].root`.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the typed workspace directories and the index database.
    ///
    /// Idempotent: existing directories and tables are left alone.
    Init,

    /// Bring the index in line with disk.
    Reconcile,

    /// Reconcile, then follow filesystem changes until Ctrl-C.
    Watch {
        /// Also serve the HTTP API.
        #[arg(long)]
        serve: bool,
    },

    /// Start the HTTP API (no watching).
    Serve,

    /// List indexed documents.
    List {
        /// Document type (`project`, `risk`, ...).
        #[arg(long = "type")]
        doc_type: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        owner: Option<String>,
        /// Metadata `key=value` matches.
        #[arg(long = "meta", value_parser = parse_key_val)]
        meta: Vec<(String, String)>,
    },

    /// Show a document by workspace-relative path.
    Get { path: String },

    /// Show the document that owns an identifier.
    Id {
        doc_type: String,
        identifier: String,
    },

    /// Search indexed documents.
    Search {
        query: String,
        /// `keyword` (FTS5), `semantic` (vector) or `hybrid` (weighted merge).
        #[arg(long, default_value = "keyword")]
        mode: String,
        #[arg(long = "type")]
        doc_type: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
    },

    /// List identifier collisions, warnings and dangling references.
    Diagnostics,

    /// Show index statistics.
    Stats,

    /// Replace a document's content with the content of `file`.
    Apply {
        /// Workspace-relative target path.
        path: String,
        /// File holding the new content (`-` for stdin).
        file: PathBuf,
        /// Keep the previous content at `<path>.bak`.
        #[arg(long)]
        backup: bool,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn parse_doc_type(raw: &str) -> Result<DocType> {
    DocType::from_str(raw).map_err(anyhow::Error::msg)
}

fn resolve_config(path: &Path, root: Option<PathBuf>) -> Result<Config> {
    let mut cfg = if path.exists() {
        config::load_config(path)?
    } else if path == Path::new(DEFAULT_CONFIG) {
        Config::for_root(".")
    } else {
        anyhow::bail!("Config file not found: {}", path.display());
    };
    if let Some(root) = root {
        cfg.workspace.root = root;
        config::validate(&cfg)?;
    }
    Ok(cfg)
}

fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pmo_index=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = resolve_config(&cli.config, cli.root)?;

    if let Commands::Init = cli.command {
        for doc_type in DocType::TRACKED {
            if let Some(dir) = doc_type.directory() {
                let path = cfg.workspace.root.join(dir);
                std::fs::create_dir_all(&path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
            }
        }
    }

    let index = Index::open(cfg).await?;

    match cli.command {
        Commands::Init => {
            println!("Index initialized at {}", index.config().db_path().display());
        }
        Commands::Reconcile => {
            let report = index.reconcile(&shutdown_token()).await?;
            println!(
                "Reconciled {} path(s): {} indexed, {} unchanged, {} removed, {} retained, {} failed, {} conflict(s) in {} ms",
                report.scanned,
                report.indexed,
                report.unchanged,
                report.removed,
                report.retained,
                report.failed,
                report.conflicts,
                report.elapsed_ms
            );
        }
        Commands::Watch { serve } => {
            let cancel = shutdown_token();
            let index = Arc::new(index);
            let api = serve.then(|| {
                let index = Arc::clone(&index);
                let cancel = cancel.clone();
                tokio::spawn(async move { server::run_server(index, cancel).await })
            });

            let watched = index.watch(cancel.clone()).await;
            cancel.cancel();
            if let Some(api) = api {
                api.await??;
            }
            watched?;
            if let Ok(index) = Arc::try_unwrap(index) {
                index.close().await;
            }
            return Ok(());
        }
        Commands::Serve => {
            let index = Arc::new(index);
            server::run_server(Arc::clone(&index), shutdown_token()).await?;
            if let Ok(index) = Arc::try_unwrap(index) {
                index.close().await;
            }
            return Ok(());
        }
        Commands::List {
            doc_type,
            status,
            owner,
            meta,
        } => {
            let filter = ListFilter {
                doc_type: doc_type.as_deref().map(parse_doc_type).transpose()?,
                status,
                owner,
                metadata: meta,
            };
            get::run_list(&index, &filter).await?;
        }
        Commands::Get { path } => {
            get::run_get(&index, &path).await?;
        }
        Commands::Id {
            doc_type,
            identifier,
        } => {
            get::run_get_by_id(&index, parse_doc_type(&doc_type)?, &identifier).await?;
        }
        Commands::Search {
            query,
            mode,
            doc_type,
            limit,
        } => {
            let mode = SearchMode::from_str(&mode)?;
            let doc_type = doc_type.as_deref().map(parse_doc_type).transpose()?;
            search::run_search(&index, &query, mode, doc_type, limit).await?;
        }
        Commands::Diagnostics => {
            stats::run_diagnostics(&index).await?;
        }
        Commands::Stats => {
            stats::run_stats(&index).await?;
        }
        Commands::Apply { path, file, backup } => {
            let content = if file == Path::new("-") {
                let mut buf = String::new();
                std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf)
                    .context("Failed to read stdin")?;
                buf
            } else {
                std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?
            };
            let outcome = index.apply_patch(&path, &content, backup).await?;
            println!("Applied {}: {:?}", path, outcome);
        }
    }

    index.close().await;
    Ok(())
}
