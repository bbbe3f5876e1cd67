//! Keyword, semantic and hybrid retrieval over a [`Store`].
//!
//! The caller embeds the query (if needed) and passes the vector in;
//! everything else goes through the store trait.
//!
//! # Hybrid scoring
//!
//! 1. Fetch `candidate_k` keyword candidates.
//! 2. Rank every stored vector by cosine similarity, keep `candidate_k`.
//! 3. Min-max normalize both candidate sets to `[0, 1]`.
//! 4. Merge per path: `score = (1 - α) × keyword + α × semantic`.
//! 5. Sort by score (desc), then path (asc), truncate to `final_limit`.

use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::embedding::cosine_similarity;
use crate::models::DocType;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Keyword,
    Semantic,
    Hybrid,
}

impl SearchMode {
    pub fn needs_vector(&self) -> bool {
        !matches!(self, SearchMode::Keyword)
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SearchMode::Keyword => "keyword",
            SearchMode::Semantic => "semantic",
            SearchMode::Hybrid => "hybrid",
        })
    }
}

impl FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keyword" => Ok(SearchMode::Keyword),
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => bail!(
                "Unknown search mode: {}. Use keyword, semantic, or hybrid.",
                other
            ),
        }
    }
}

/// Retrieval tuning parameters.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub hybrid_alpha: f64,
    pub candidate_k: i64,
    pub final_limit: i64,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            hybrid_alpha: 0.6,
            candidate_k: 40,
            final_limit: 12,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    /// Required for semantic and hybrid modes.
    pub query_vec: Option<&'a [f32]>,
    pub mode: SearchMode,
    pub doc_type: Option<DocType>,
    pub params: SearchParams,
    pub explain: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub path: String,
    pub doc_type: DocType,
    pub identifier: String,
    pub title: String,
    pub status: Option<String>,
    /// Relevance in `[0.0, 1.0]`.
    pub score: f64,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<ScoreExplanation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreExplanation {
    pub keyword_score: f64,
    pub semantic_score: f64,
    pub alpha: f64,
    pub keyword_candidates: usize,
    pub vector_candidates: usize,
}

/// A raw `(path, score)` candidate from either backend.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: String,
    pub raw_score: f64,
    pub snippet: String,
}

pub async fn search<S: Store + ?Sized>(
    store: &S,
    req: &SearchRequest<'_>,
) -> Result<Vec<SearchResultItem>> {
    if req.query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let keyword_candidates: Vec<Candidate> = if req.mode != SearchMode::Semantic {
        store
            .keyword_search(req.query, req.params.candidate_k, req.doc_type)
            .await?
            .into_iter()
            .map(|h| Candidate {
                path: h.path,
                raw_score: h.raw_score,
                snippet: h.snippet,
            })
            .collect()
    } else {
        Vec::new()
    };

    let vector_candidates: Vec<Candidate> = if req.mode.needs_vector() {
        let Some(qv) = req.query_vec else {
            bail!("query_vec is required for semantic/hybrid mode");
        };
        let mut scored: Vec<Candidate> = store
            .vectors()
            .await?
            .into_iter()
            .filter(|v| req.doc_type.map_or(true, |t| v.doc_type == t))
            .map(|v| Candidate {
                raw_score: cosine_similarity(qv, &v.vector) as f64,
                path: v.path,
                snippet: String::new(),
            })
            .collect();
        sort_candidates(&mut scored);
        scored.truncate(req.params.candidate_k.max(0) as usize);
        scored
    } else {
        Vec::new()
    };

    if keyword_candidates.is_empty() && vector_candidates.is_empty() {
        return Ok(Vec::new());
    }

    let effective_alpha = match req.mode {
        SearchMode::Keyword => 0.0,
        SearchMode::Semantic => 1.0,
        SearchMode::Hybrid => req.params.hybrid_alpha,
    };

    let kw_map: HashMap<&str, f64> = normalize_scores(&keyword_candidates)
        .into_iter()
        .map(|(c, s)| (c.path.as_str(), s))
        .collect();
    let vec_map: HashMap<&str, f64> = normalize_scores(&vector_candidates)
        .into_iter()
        .map(|(c, s)| (c.path.as_str(), s))
        .collect();

    let mut snippets: HashMap<&str, &str> = HashMap::new();
    for c in keyword_candidates.iter().chain(vector_candidates.iter()) {
        let entry = snippets.entry(c.path.as_str()).or_insert("");
        if entry.is_empty() {
            *entry = c.snippet.as_str();
        }
    }

    let mut results = Vec::new();
    for (path, snippet) in snippets {
        let Some(doc) = store.get_by_path(path).await? else {
            continue;
        };
        let k = kw_map.get(path).copied().unwrap_or(0.0);
        let v = vec_map.get(path).copied().unwrap_or(0.0);
        let score = (1.0 - effective_alpha) * k + effective_alpha * v;

        let snippet = if snippet.is_empty() {
            doc.body.trim().chars().take(240).collect()
        } else {
            snippet.to_string()
        };

        results.push(SearchResultItem {
            path: doc.path.clone(),
            doc_type: doc.doc_type,
            identifier: doc.identifier.clone(),
            title: doc.title.clone(),
            status: doc.status(),
            score,
            snippet,
            explain: req.explain.then(|| ScoreExplanation {
                keyword_score: k,
                semantic_score: v,
                alpha: effective_alpha,
                keyword_candidates: keyword_candidates.len(),
                vector_candidates: vector_candidates.len(),
            }),
        });
    }

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
    });
    results.truncate(req.params.final_limit.max(0) as usize);

    Ok(results)
}

fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
    });
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(candidates: &[Candidate]) -> Vec<(&Candidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;
    use crate::store::memory::InMemoryStore;
    use crate::store::StoredVector;

    fn make_candidate(path: &str, score: f64) -> Candidate {
        Candidate {
            path: path.to_string(),
            raw_score: score,
            snippet: String::new(),
        }
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_range() {
        let candidates = vec![
            make_candidate("a", 10.0),
            make_candidate("b", 5.0),
            make_candidate("c", 0.0),
        ];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!((result[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        let candidates = vec![make_candidate("a", 3.0), make_candidate("b", 3.0)];
        for (_, score) in normalize_scores(&candidates) {
            assert!((score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("hybrid".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert!("fuzzy".parse::<SearchMode>().is_err());
    }

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        for (path, body, vector) in [
            ("risks/a.md", "vendor delay vendor", vec![1.0f32, 0.0]),
            ("risks/b.md", "budget overrun", vec![0.0f32, 1.0]),
        ] {
            let raw = format!("---\nid: {}\nseverity: low\nstatus: open\n---\n{}\n", path, body);
            let doc = parse(&raw, DocType::Risk, path).unwrap();
            store.upsert(&doc).await.unwrap();
            store
                .upsert_vector(&StoredVector {
                    path: path.to_string(),
                    doc_type: DocType::Risk,
                    identifier: doc.identifier.clone(),
                    model: "test".into(),
                    dims: 2,
                    text_hash: "h".into(),
                    vector,
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_keyword_mode() {
        let store = seeded().await;
        let req = SearchRequest {
            query: "vendor",
            query_vec: None,
            mode: SearchMode::Keyword,
            doc_type: None,
            params: SearchParams::default(),
            explain: false,
        };
        let results = search(&store, &req).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "risks/a.md");
    }

    #[tokio::test]
    async fn test_semantic_mode_orders_by_similarity() {
        let store = seeded().await;
        let qv = [0.1f32, 0.9];
        let req = SearchRequest {
            query: "money",
            query_vec: Some(&qv),
            mode: SearchMode::Semantic,
            doc_type: Some(DocType::Risk),
            params: SearchParams::default(),
            explain: true,
        };
        let results = search(&store, &req).await.unwrap();
        assert_eq!(results[0].path, "risks/b.md");
        assert!(results[0].explain.is_some());
    }

    #[tokio::test]
    async fn test_semantic_without_vector_errors() {
        let store = seeded().await;
        let req = SearchRequest {
            query: "x",
            query_vec: None,
            mode: SearchMode::Hybrid,
            doc_type: None,
            params: SearchParams::default(),
            explain: false,
        };
        assert!(search(&store, &req).await.is_err());
    }
}
