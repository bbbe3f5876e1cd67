//! Per-type metadata schemas.
//!
//! Validation never rejects a document. Missing required keys, values
//! outside an enumerated set, and unparsable dates each produce a
//! [`DiagnosticKind::ValidationWarning`]; unknown keys are kept as-is.

use chrono::NaiveDate;

use crate::models::{DiagnosticKind, Diagnostic, DocType, Metadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Date,
    Enum(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub key: &'static str,
    pub required: bool,
    pub kind: FieldKind,
}

const fn required(key: &'static str, kind: FieldKind) -> FieldRule {
    FieldRule {
        key,
        required: true,
        kind,
    }
}

const fn optional(key: &'static str, kind: FieldKind) -> FieldRule {
    FieldRule {
        key,
        required: false,
        kind,
    }
}

#[derive(Debug)]
pub struct Schema {
    pub doc_type: DocType,
    pub fields: &'static [FieldRule],
}

impl Schema {
    pub fn field(&self, key: &str) -> Option<&FieldRule> {
        self.fields.iter().find(|f| f.key == key)
    }
}

pub const PROJECT_STATUS: &[&str] = &[
    "planned",
    "active",
    "on-hold",
    "at-risk",
    "completed",
    "cancelled",
];
pub const EPIC_STATUS: &[&str] = &["planned", "active", "blocked", "done", "cancelled"];
pub const DECISION_STATUS: &[&str] = &["proposed", "accepted", "rejected", "superseded"];
pub const RISK_STATUS: &[&str] = &["open", "mitigating", "closed", "accepted"];
pub const SEVERITY: &[&str] = &["low", "medium", "high", "critical"];
pub const PROBABILITY: &[&str] = &["low", "medium", "high"];

/// Date-typed keys checked on every document type.
pub const DATE_KEYS: &[&str] = &["date", "due", "start", "end", "target_date"];

static PROJECT: Schema = Schema {
    doc_type: DocType::Project,
    fields: &[
        required("id", FieldKind::Text),
        required("owner", FieldKind::Text),
        required("status", FieldKind::Enum(PROJECT_STATUS)),
        optional("title", FieldKind::Text),
        optional("start", FieldKind::Date),
        optional("target_date", FieldKind::Date),
    ],
};

static EPIC: Schema = Schema {
    doc_type: DocType::Epic,
    fields: &[
        required("id", FieldKind::Text),
        required("status", FieldKind::Enum(EPIC_STATUS)),
        optional("owner", FieldKind::Text),
        optional("project", FieldKind::Text),
        optional("due", FieldKind::Date),
    ],
};

static DECISION: Schema = Schema {
    doc_type: DocType::Decision,
    fields: &[
        required("id", FieldKind::Text),
        required("status", FieldKind::Enum(DECISION_STATUS)),
        optional("date", FieldKind::Date),
        optional("owner", FieldKind::Text),
    ],
};

static RISK: Schema = Schema {
    doc_type: DocType::Risk,
    fields: &[
        required("id", FieldKind::Text),
        required("severity", FieldKind::Enum(SEVERITY)),
        required("status", FieldKind::Enum(RISK_STATUS)),
        optional("probability", FieldKind::Enum(PROBABILITY)),
        optional("owner", FieldKind::Text),
    ],
};

static MEETING: Schema = Schema {
    doc_type: DocType::Meeting,
    fields: &[
        required("id", FieldKind::Text),
        required("date", FieldKind::Date),
    ],
};

static PERSON: Schema = Schema {
    doc_type: DocType::Person,
    fields: &[
        required("id", FieldKind::Text),
        optional("name", FieldKind::Text),
        optional("role", FieldKind::Text),
    ],
};

static LOG: Schema = Schema {
    doc_type: DocType::Log,
    fields: &[optional("date", FieldKind::Date)],
};

static UNKNOWN: Schema = Schema {
    doc_type: DocType::Unknown,
    fields: &[],
};

pub fn schema_for(doc_type: DocType) -> &'static Schema {
    match doc_type {
        DocType::Project => &PROJECT,
        DocType::Epic => &EPIC,
        DocType::Decision => &DECISION,
        DocType::Risk => &RISK,
        DocType::Meeting => &MEETING,
        DocType::Person => &PERSON,
        DocType::Log => &LOG,
        DocType::Unknown => &UNKNOWN,
    }
}

/// Validate `metadata` against the schema for `doc_type`.
///
/// An entirely empty metadata block (a freeform note) skips the
/// required-key check; such documents are expected and still index.
pub fn validate(doc_type: DocType, metadata: &Metadata) -> Vec<Diagnostic> {
    let schema = schema_for(doc_type);
    let mut warnings = Vec::new();

    if !metadata.is_empty() {
        for rule in schema.fields.iter().filter(|r| r.required) {
            if !metadata.contains_key(rule.key) {
                warnings.push(Diagnostic::for_field(
                    DiagnosticKind::ValidationWarning,
                    rule.key,
                    format!("missing required field for {}", doc_type),
                ));
            }
        }
    }

    for (key, value) in metadata {
        let kind = match schema.field(key) {
            Some(rule) => rule.kind,
            None if DATE_KEYS.contains(&key.as_str()) => FieldKind::Date,
            None => continue,
        };

        match kind {
            FieldKind::Text => {}
            FieldKind::Enum(allowed) => match value.as_str() {
                Some(s) => {
                    let normalized = s.trim().to_ascii_lowercase();
                    if !allowed.contains(&normalized.as_str()) {
                        warnings.push(Diagnostic::for_field(
                            DiagnosticKind::ValidationWarning,
                            key,
                            format!("unrecognized value '{}' (expected one of: {})", s, allowed.join(", ")),
                        ));
                    }
                }
                None => warnings.push(Diagnostic::for_field(
                    DiagnosticKind::ValidationWarning,
                    key,
                    "expected a string value",
                )),
            },
            FieldKind::Date => {
                let ok = value
                    .as_str()
                    .map(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").is_ok())
                    .unwrap_or(false);
                if !ok {
                    warnings.push(Diagnostic::for_field(
                        DiagnosticKind::ValidationWarning,
                        key,
                        format!("expected a YYYY-MM-DD date, got {}", value),
                    ));
                }
            }
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(v: serde_json::Value) -> Metadata {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_valid_risk_has_no_warnings() {
        let m = meta(json!({"id": "risk:x", "severity": "high", "status": "open", "probability": "low"}));
        assert!(validate(DocType::Risk, &m).is_empty());
    }

    #[test]
    fn test_unknown_enum_value_warns_but_is_kept() {
        let m = meta(json!({"id": "risk:x", "severity": "apocalyptic", "status": "open"}));
        let w = validate(DocType::Risk, &m);
        assert_eq!(w.len(), 1);
        assert_eq!(w[0].field.as_deref(), Some("severity"));
        assert_eq!(m["severity"], "apocalyptic");
    }

    #[test]
    fn test_enum_is_case_insensitive() {
        let m = meta(json!({"id": "p", "owner": "a", "status": "Active"}));
        assert!(validate(DocType::Project, &m).is_empty());
    }

    #[test]
    fn test_missing_required_fields() {
        let m = meta(json!({"id": "proj-a"}));
        let w = validate(DocType::Project, &m);
        let fields: Vec<_> = w.iter().filter_map(|d| d.field.as_deref()).collect();
        assert_eq!(fields, vec!["owner", "status"]);
    }

    #[test]
    fn test_empty_metadata_skips_required_check() {
        assert!(validate(DocType::Risk, &Metadata::new()).is_empty());
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let m = meta(json!({"id": "person:a", "favourite_color": "teal"}));
        assert!(validate(DocType::Person, &m).is_empty());
    }

    #[test]
    fn test_bad_date_warns_on_any_type() {
        let m = meta(json!({"due": "next tuesday"}));
        let w = validate(DocType::Unknown, &m);
        assert_eq!(w.len(), 1);
        assert_eq!(w[0].kind, DiagnosticKind::ValidationWarning);
    }
}
