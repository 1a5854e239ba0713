//! Search request and hit models.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters for one query against a search index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    /// Name of the index to query
    pub index: String,
    /// Free-text query (keyword and semantic ranking input)
    pub query: String,
    /// Maximum number of hits to return
    pub top: usize,
    /// Semantic ranking configuration, when the index defines one
    pub semantic_config: Option<String>,
    /// Restrict keyword matching to these fields
    pub search_fields: Option<Vec<String>>,
}

impl SearchRequest {
    pub fn new(index: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            query: query.into(),
            top: 20,
            semantic_config: None,
            search_fields: None,
        }
    }

    pub fn with_top(mut self, top: usize) -> Self {
        self.top = top;
        self
    }

    pub fn with_semantic_config(mut self, config: impl Into<String>) -> Self {
        self.semantic_config = Some(config.into());
        self
    }

    pub fn with_search_fields(mut self, fields: Vec<String>) -> Self {
        self.search_fields = Some(fields);
        self
    }
}

/// One hit returned by the search backend.
///
/// `document` carries every index field of the hit; the commonly used ones
/// (`CODE`, `STR`) have typed accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub score: f64,
    pub document: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlights: Option<Value>,
}

impl SearchHit {
    pub fn new(score: f64, document: Value) -> Self {
        Self {
            score,
            document,
            highlights: None,
        }
    }

    /// String field of the document, if present.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.document.get(name).and_then(Value::as_str)
    }

    /// The document's code (`CODE` field).
    pub fn code(&self) -> Option<&str> {
        self.field_str("CODE")
    }

    /// The document's display label (`STR` field).
    pub fn label(&self) -> Option<&str> {
        self.field_str("STR")
    }

    /// The document id, falling back to the code.
    pub fn doc_id(&self) -> Option<&str> {
        self.field_str("id").or_else(|| self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builder() {
        let request = SearchRequest::new("pcornet-icd-index", "hypertension")
            .with_top(10)
            .with_semantic_config("defaultSemanticConfig");

        assert_eq!(request.index, "pcornet-icd-index");
        assert_eq!(request.top, 10);
        assert_eq!(request.semantic_config.as_deref(), Some("defaultSemanticConfig"));
        assert!(request.search_fields.is_none());
    }

    #[test]
    fn test_hit_accessors() {
        let hit = SearchHit::new(
            2.17,
            json!({"CODE": "I10", "STR": "Essential hypertension", "SAB": "ICD10CM"}),
        );

        assert_eq!(hit.code(), Some("I10"));
        assert_eq!(hit.label(), Some("Essential hypertension"));
        assert_eq!(hit.doc_id(), Some("I10"));
        assert_eq!(hit.field_str("SAB"), Some("ICD10CM"));
        assert_eq!(hit.field_str("missing"), None);
    }

    #[test]
    fn test_hit_serde_round_trip() {
        let hit = SearchHit::new(1.5, json!({"CODE": "E11", "STR": "Type 2 diabetes"}));
        let encoded = serde_json::to_string(&hit).unwrap();
        let decoded: SearchHit = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, hit);
    }
}
