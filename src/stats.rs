//! Index statistics and diagnostics overview.
//!
//! `pmo stats` summarizes what is indexed; `pmo diagnostics` lists
//! everything that needs a human: identifier collisions, documents with
//! warnings or a retained sync error, and dangling references.

use anyhow::Result;

use crate::index::Index;

/// Run the stats command: query the index and print a summary.
pub async fn run_stats(index: &Index) -> Result<()> {
    let stats = index.stats().await?;
    let db_path = index.config().db_path();
    let db_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    println!("pmo index stats");
    println!("===============");
    println!();
    println!("  Workspace:   {}", index.config().workspace.root.display());
    println!("  Database:    {}", db_path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  References:  {} ({} dangling)", stats.references, stats.dangling_references);
    println!("  Conflicts:   {}", stats.conflicts);
    println!("  Warnings:    {}", stats.documents_with_warnings);
    println!(
        "  Embedded:    {} / {} ({}%)",
        stats.vectors,
        stats.documents,
        if stats.documents > 0 {
            (stats.vectors * 100) / stats.documents
        } else {
            0
        }
    );

    if !stats.by_type.is_empty() {
        println!();
        println!("  By type:");
        println!("  {:<12} {:>6}", "TYPE", "DOCS");
        println!("  {}", "-".repeat(19));
        for (doc_type, count) in &stats.by_type {
            println!("  {:<12} {:>6}", doc_type, count);
        }
    }
    println!();
    Ok(())
}

pub async fn run_diagnostics(index: &Index) -> Result<()> {
    let conflicts = index.conflicts().await?;
    let warnings = index.warnings().await?;
    let dangling = index.dangling_references().await?;

    if conflicts.is_empty() && warnings.is_empty() && dangling.is_empty() {
        println!("No diagnostics.");
        return Ok(());
    }

    if !conflicts.is_empty() {
        println!("--- Identifier collisions ({}) ---", conflicts.len());
        for c in &conflicts {
            println!(
                "  {} {}: owned by {}, also claimed by {}",
                c.doc_type, c.identifier, c.owner_path, c.conflicting_path
            );
        }
        println!();
    }

    if !warnings.is_empty() {
        println!("--- Warnings ({}) ---", warnings.len());
        for entry in &warnings {
            println!("  {}", entry.path);
            if let Some(err) = &entry.error {
                println!("    error [{}] {}", err.kind.as_str(), err.message);
            }
            for w in &entry.warnings {
                println!("    [{}] {}", w.kind.as_str(), w.message);
            }
        }
        println!();
    }

    if !dangling.is_empty() {
        println!("--- Dangling references ({}) ---", dangling.len());
        for d in &dangling {
            println!("  {} -> {}", d.source_path, d.target);
        }
        println!();
    }
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
