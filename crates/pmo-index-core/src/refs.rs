//! Cross-reference grammar: `type:name` tokens.
//!
//! Only the tracked type prefixes are recognized. Anything else that
//! merely looks like `word:word` (URLs, times, YAML-ish prose) is ignored.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::models::{DocType, Metadata, Reference};

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(project|epic|decision|risk|meeting|person|log):([A-Za-z0-9][A-Za-z0-9_.\-]*)")
            .expect("reference pattern is valid")
    })
}

/// Collect references from the body and from every metadata string value
/// except `id` (a document does not reference itself by declaring its id).
pub fn extract_references(body: &str, metadata: &Metadata) -> Vec<Reference> {
    let mut found = BTreeSet::new();
    scan_text(body, &mut found);
    for (key, value) in metadata {
        if key == "id" {
            continue;
        }
        scan_value(value, &mut found);
    }
    found.into_iter().collect()
}

fn scan_value(value: &serde_json::Value, out: &mut BTreeSet<Reference>) {
    match value {
        serde_json::Value::String(s) => scan_text(s, out),
        serde_json::Value::Array(items) => items.iter().for_each(|v| scan_value(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| scan_value(v, out)),
        _ => {}
    }
}

pub fn scan_text(text: &str, out: &mut BTreeSet<Reference>) {
    for caps in reference_regex().captures_iter(text) {
        let (Some(prefix), Some(name)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        // Sentence punctuation after a token is not part of the name.
        let name = name.as_str().trim_end_matches(['.', '-', '_']);
        if name.is_empty() {
            continue;
        }
        let Ok(kind) = prefix.as_str().parse::<DocType>() else {
            continue;
        };
        out.insert(Reference::new(kind, format!("{}:{}", prefix.as_str(), name)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body_refs(text: &str) -> Vec<String> {
        extract_references(text, &Metadata::new())
            .into_iter()
            .map(|r| r.target)
            .collect()
    }

    #[test]
    fn test_extracts_body_tokens() {
        let refs = body_refs("Blocked by risk:vendor-delay and decision:adr-7.");
        assert_eq!(refs, vec!["decision:adr-7", "risk:vendor-delay"]);
    }

    #[test]
    fn test_ignores_unknown_prefixes_and_urls() {
        let refs = body_refs("see https://example.com and foo:bar and 10:30");
        assert!(refs.is_empty());
    }

    #[test]
    fn test_ignores_embedded_prefix() {
        assert!(body_refs("subproject:alpha").is_empty());
    }

    #[test]
    fn test_malformed_token_is_skipped() {
        assert!(body_refs("risk: with a space, risk:-x").is_empty());
    }

    #[test]
    fn test_deduplicates() {
        let refs = body_refs("risk:a risk:a risk:a.");
        assert_eq!(refs, vec!["risk:a"]);
    }

    #[test]
    fn test_scans_metadata_but_not_id() {
        let m = json!({
            "id": "project:self",
            "risks": ["risk:one", "risk:two"],
            "owner": "person:jane",
        });
        let refs = extract_references("", m.as_object().unwrap());
        let targets: Vec<_> = refs.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, vec!["risk:one", "risk:two", "person:jane"]);
        assert_eq!(refs[2].kind, DocType::Person);
    }
}
