//! The `pmo search` command.

use anyhow::Result;

use pmo_index_core::models::DocType;
use pmo_index_core::search::SearchMode;

use crate::index::Index;

pub async fn run_search(
    index: &Index,
    query: &str,
    mode: SearchMode,
    doc_type: Option<DocType>,
    limit: Option<i64>,
) -> Result<()> {
    let results = index.search(query, mode, doc_type, limit).await?;
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            result.score,
            result.doc_type,
            result.title
        );
        println!("    id: {}", result.identifier);
        if let Some(status) = &result.status {
            println!("    status: {}", status);
        }
        println!(
            "    excerpt: \"{}\"",
            result.snippet.replace('\n', " ").trim()
        );
        println!("    path: {}", result.path);
        println!();
    }
    Ok(())
}
