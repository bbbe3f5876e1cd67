//! Document retrieval and listing for the `pmo get`, `pmo id` and
//! `pmo list` commands.

use anyhow::{bail, Result};

use pmo_index_core::models::{DocType, Document, DocumentSummary};
use pmo_index_core::store::ListFilter;

use crate::index::Index;

pub async fn run_list(index: &Index, filter: &ListFilter) -> Result<()> {
    let docs = index.list(filter).await?;
    if docs.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    print_summaries(&docs);
    println!();
    println!("{} document(s)", docs.len());
    Ok(())
}

fn print_summaries(docs: &[DocumentSummary]) {
    println!(
        "{:<36} {:<9} {:<24} {:<12} {}",
        "PATH", "TYPE", "ID", "STATUS", "TITLE"
    );
    println!("{}", "-".repeat(100));
    for d in docs {
        let flag = if d.warning_count > 0 { " (!)" } else { "" };
        println!(
            "{:<36} {:<9} {:<24} {:<12} {}{}",
            d.path,
            d.doc_type,
            d.identifier,
            d.status.as_deref().unwrap_or("-"),
            d.title,
            flag
        );
    }
}

pub async fn run_get(index: &Index, path: &str) -> Result<()> {
    let Some(doc) = index.get_by_path(path).await? else {
        bail!("document not found: {}", path);
    };
    print_document(index, &doc).await
}

pub async fn run_get_by_id(index: &Index, doc_type: DocType, identifier: &str) -> Result<()> {
    let Some(doc) = index.get_by_identifier(doc_type, identifier).await? else {
        bail!("no {} owns identifier {}", doc_type, identifier);
    };
    print_document(index, &doc).await
}

async fn print_document(index: &Index, doc: &Document) -> Result<()> {
    println!("--- Document ---");
    println!("path:         {}", doc.path);
    println!("type:         {}", doc.doc_type);
    println!("id:           {}", doc.identifier);
    println!("title:        {}", doc.title);
    println!("indexed_at:   {}", doc.indexed_at.format("%Y-%m-%dT%H:%M:%SZ"));
    println!("hash:         {}", doc.content_hash);
    println!(
        "metadata:     {}",
        serde_json::Value::Object(doc.metadata.clone())
    );
    if !doc.sections.is_empty() {
        println!("sections:     {}", doc.sections.join(", "));
    }
    for w in &doc.warnings {
        println!("warning:      [{}] {}", w.kind.as_str(), w.message);
    }
    println!();

    let references = index.references_from(&doc.path).await?;
    if !references.is_empty() {
        println!("--- References ({}) ---", references.len());
        for r in &references {
            match &r.resolved_path {
                Some(p) => println!("  {} -> {}", r.target, p),
                None => println!("  {} (dangling)", r.target),
            }
        }
        println!();
    }

    let backlinks = index.backlinks(doc.doc_type, &doc.identifier).await?;
    if !backlinks.is_empty() {
        println!("--- Backlinks ({}) ---", backlinks.len());
        for b in &backlinks {
            println!("  {} ({})", b.source_path, b.source_identifier);
        }
        println!();
    }

    println!("--- Body ---");
    println!("{}", doc.body);
    Ok(())
}
