//! Parsing of REL segment data: code relationships embedded in documents.
//!
//! Terminology documents carry a `REL` field listing related codes with a
//! relationship type (`PAR`, `CHD`, `RO`, `SY`, `RQ`). This module extracts
//! those entries and derives parent/child hierarchies and ICD-to-SNOMED
//! mappings from them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::search::SearchHit;

/// Relationship types recognized in REL data.
pub const DEFAULT_REL_TYPES: &[&str] = &["PAR", "CHD", "RO", "SY", "RQ"];

/// One parsed relationship entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelEntry {
    /// Relationship type (PAR = parent, CHD = child, ...)
    pub rel: String,
    /// Related code
    pub code: String,
    /// Related code's display string
    pub label: String,
    /// Source vocabulary abbreviation
    pub sab: String,
}

/// Parent/child hierarchy derived for one code.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Hierarchy {
    pub query_code: String,
    pub parents: Vec<RelEntry>,
    pub children: Vec<RelEntry>,
}

/// One ICD code mapped to a SNOMED concept.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnomedMapping {
    pub icd_code: String,
    pub icd_label: String,
    pub snomed_code: String,
    pub snomed_label: String,
    pub relationship: String,
}

/// Parses the `REL` field of a document into relationship entries.
///
/// The field is either a JSON array of objects or a JSON string encoding
/// one; anything else yields no entries.
pub fn parse_rel_entries(document: &Value) -> Vec<RelEntry> {
    let Some(rel) = document.get("REL") else {
        return Vec::new();
    };

    let parsed;
    let rel = match rel {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(value) => {
                parsed = value;
                &parsed
            }
            Err(_) => return Vec::new(),
        },
        other => other,
    };

    let Some(entries) = rel.as_array() else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            Some(RelEntry {
                rel: entry.get("REL").and_then(Value::as_str)?.to_string(),
                code: entry.get("CODE").and_then(Value::as_str)?.to_string(),
                label: entry
                    .get("STR")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                sab: entry
                    .get("SAB")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            })
        })
        .filter(|entry| DEFAULT_REL_TYPES.contains(&entry.rel.as_str()))
        .collect()
}

/// Hits that carry any relationship data, paired with their parsed entries.
pub fn hits_with_relationships(hits: &[SearchHit]) -> Vec<(&SearchHit, Vec<RelEntry>)> {
    hits.iter()
        .filter_map(|hit| {
            let entries = parse_rel_entries(&hit.document);
            if entries.is_empty() {
                None
            } else {
                Some((hit, entries))
            }
        })
        .collect()
}

/// Derives the parent/child hierarchy for a code from search hits.
///
/// Entries on the code's own document contribute directly (`PAR` entries
/// are its parents, `CHD` its children); other documents whose `CHD`/`PAR`
/// entries point back at the code contribute the inverse edge.
pub fn hierarchy_for(hits: &[SearchHit], code: &str) -> Hierarchy {
    let mut hierarchy = Hierarchy {
        query_code: code.to_string(),
        ..Hierarchy::default()
    };

    for hit in hits {
        let doc_code = hit.code().unwrap_or_default();
        for entry in parse_rel_entries(&hit.document) {
            if doc_code == code {
                if entry.rel == "PAR" {
                    hierarchy.parents.push(entry);
                } else if entry.rel == "CHD" {
                    hierarchy.children.push(entry);
                }
            } else if entry.code == code {
                // The related document points at our code; invert the edge
                let inverse = RelEntry {
                    rel: String::new(),
                    code: doc_code.to_string(),
                    label: hit.label().unwrap_or("").to_string(),
                    sab: entry.sab.clone(),
                };
                match entry.rel.as_str() {
                    "CHD" => hierarchy.parents.push(RelEntry {
                        rel: "PAR".to_string(),
                        ..inverse
                    }),
                    "PAR" => hierarchy.children.push(RelEntry {
                        rel: "CHD".to_string(),
                        ..inverse
                    }),
                    _ => {}
                }
            }
        }
    }

    debug!(
        "Hierarchy for {code}: {} parents, {} children",
        hierarchy.parents.len(),
        hierarchy.children.len()
    );
    hierarchy
}

/// Extracts ICD-to-SNOMED mappings for a code from search hits.
///
/// Mappings come from the `OHDSI` maps of the code's document plus any REL
/// entries sourced from SNOMED vocabularies.
pub fn snomed_mappings_for(hits: &[SearchHit], code: &str) -> Vec<SnomedMapping> {
    let mut mappings = Vec::new();

    for hit in hits {
        if hit.code() != Some(code) {
            continue;
        }
        let icd_label = hit.label().unwrap_or("").to_string();

        for (snomed_code, snomed_label) in
            crate::extract::ohdsi_concept_codes(&hit.document, "SNOMED")
        {
            mappings.push(SnomedMapping {
                icd_code: code.to_string(),
                icd_label: icd_label.clone(),
                snomed_code,
                snomed_label,
                relationship: "Maps to".to_string(),
            });
        }

        for entry in parse_rel_entries(&hit.document) {
            if entry.sab.to_uppercase().contains("SNOMED") {
                mappings.push(SnomedMapping {
                    icd_code: code.to_string(),
                    icd_label: icd_label.clone(),
                    snomed_code: entry.code,
                    snomed_label: entry.label,
                    relationship: entry.rel,
                });
            }
        }
    }

    mappings
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hit_with_rel(code: &str, label: &str, rel: Value) -> SearchHit {
        SearchHit::new(1.0, json!({"CODE": code, "STR": label, "REL": rel}))
    }

    #[test]
    fn test_parse_rel_array() {
        let document = json!({
            "REL": [
                {"REL": "PAR", "CODE": "I10-I16", "STR": "Hypertensive diseases", "SAB": "ICD10CM"},
                {"REL": "XX", "CODE": "ignored", "STR": "", "SAB": ""}
            ]
        });

        let entries = parse_rel_entries(&document);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rel, "PAR");
        assert_eq!(entries[0].code, "I10-I16");
    }

    #[test]
    fn test_parse_rel_json_string() {
        let document = json!({
            "REL": "[{\"REL\": \"CHD\", \"CODE\": \"I10.1\", \"STR\": \"child\", \"SAB\": \"ICD10CM\"}]"
        });

        let entries = parse_rel_entries(&document);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rel, "CHD");
    }

    #[test]
    fn test_parse_rel_missing_or_malformed() {
        assert!(parse_rel_entries(&json!({"CODE": "I10"})).is_empty());
        assert!(parse_rel_entries(&json!({"REL": "oops"})).is_empty());
        assert!(parse_rel_entries(&json!({"REL": 42})).is_empty());
    }

    #[test]
    fn test_hierarchy_direct_edges() {
        let hits = vec![hit_with_rel(
            "I10",
            "Essential hypertension",
            json!([
                {"REL": "PAR", "CODE": "I10-I16", "STR": "Hypertensive diseases", "SAB": "ICD10CM"},
                {"REL": "CHD", "CODE": "I10.1", "STR": "Benign hypertension", "SAB": "ICD10CM"}
            ]),
        )];

        let hierarchy = hierarchy_for(&hits, "I10");
        assert_eq!(hierarchy.parents.len(), 1);
        assert_eq!(hierarchy.parents[0].code, "I10-I16");
        assert_eq!(hierarchy.children.len(), 1);
        assert_eq!(hierarchy.children[0].code, "I10.1");
    }

    #[test]
    fn test_hierarchy_inverted_edges() {
        // Another document claims I10 as its child: it is a parent of I10
        let hits = vec![hit_with_rel(
            "I10-I16",
            "Hypertensive diseases",
            json!([{"REL": "CHD", "CODE": "I10", "STR": "Essential hypertension", "SAB": "ICD10CM"}]),
        )];

        let hierarchy = hierarchy_for(&hits, "I10");
        assert_eq!(hierarchy.parents.len(), 1);
        assert_eq!(hierarchy.parents[0].code, "I10-I16");
        assert!(hierarchy.children.is_empty());
    }

    #[test]
    fn test_snomed_mappings_from_ohdsi_and_rel() {
        let hits = vec![SearchHit::new(
            1.0,
            json!({
                "CODE": "I10",
                "STR": "Essential hypertension",
                "OHDSI": {"maps": [{"vocabulary_id": "SNOMED", "concept_code": "59621000", "concept_name": "Essential hypertension (disorder)"}]},
                "REL": [{"REL": "RO", "CODE": "38341003", "STR": "Hypertensive disorder", "SAB": "SNOMEDCT_US"}]
            }),
        )];

        let mappings = snomed_mappings_for(&hits, "I10");
        assert_eq!(mappings.len(), 2);
        assert!(mappings.iter().any(|m| m.snomed_code == "59621000"));
        assert!(mappings.iter().any(|m| m.snomed_code == "38341003"));
        assert!(snomed_mappings_for(&hits, "E11").is_empty());
    }
}
