//! Extraction of flat concept records from raw search results.
//!
//! The concept-set workflow passes raw JSON between stages; this module
//! turns that JSON back into `Code: …, Label: …, Score: …` lines for the
//! formatting LLM. Parse failures are reported as errors, never panics.

use serde_json::Value;
use tracing::warn;

use crate::error::{MedtermError, Result};
use crate::search::SearchHit;

/// Message returned when the input parses but contains no hits.
pub const NO_CONCEPTS_MESSAGE: &str = "No concepts found in the provided data.";

/// Formats one hit as a flat record line.
pub fn record_line(hit: &SearchHit) -> String {
    format!(
        "Code: {}, Label: {}, Score: {:.4}",
        hit.code().unwrap_or("N/A"),
        hit.label().unwrap_or("N/A"),
        hit.score
    )
}

/// Flattens scored hits into record lines.
pub fn flatten_hits(hits: &[SearchHit]) -> Vec<String> {
    hits.iter().map(record_line).collect()
}

/// Extracts concept records from a raw JSON string of search hits.
///
/// Returns the record lines joined under a header, or
/// [`NO_CONCEPTS_MESSAGE`] when the list is empty.
///
/// # Errors
///
/// Returns a `Serialization` error when the input is not a JSON list of
/// hits; callers surface it as an empty result, not a failure.
pub fn extract_concept_records(context_data: &str) -> Result<String> {
    let hits: Vec<SearchHit> = serde_json::from_str(context_data).map_err(|err| {
        warn!("Extractor failed to decode JSON context: {err}");
        MedtermError::from(err)
    })?;

    if hits.is_empty() {
        return Ok(NO_CONCEPTS_MESSAGE.to_string());
    }

    let mut lines = vec!["Here are the extracted ICD concepts for the concept set:".to_string()];
    lines.extend(flatten_hits(&hits));
    Ok(lines.join("\n"))
}

/// Serializes hits back to the raw JSON form carried between workflow steps.
pub fn hits_to_json(hits: &[SearchHit]) -> String {
    serde_json::to_string(hits).unwrap_or_else(|err| {
        warn!("Failed to serialize search hits: {err}");
        "[]".to_string()
    })
}

/// Parses the raw JSON form back into hits, degrading to an empty list.
pub fn hits_from_json(raw: &str) -> Vec<SearchHit> {
    match serde_json::from_str(raw) {
        Ok(hits) => hits,
        Err(err) => {
            warn!("Failed to parse search hits from JSON: {err}");
            Vec::new()
        }
    }
}

/// Cross-vocabulary mappings embedded in a document's `OHDSI` field.
///
/// The field holds either a JSON object with a `maps` array or a plain
/// string; each map carries `vocabulary_id`, `concept_code`, and
/// `concept_name`.
pub fn ohdsi_concept_codes(document: &Value, vocabulary: &str) -> Vec<(String, String)> {
    let Some(ohdsi) = document.get("OHDSI") else {
        return Vec::new();
    };

    // The field is sometimes stored as a JSON string
    let parsed;
    let ohdsi = match ohdsi {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(value) => {
                parsed = value;
                &parsed
            }
            Err(_) => return Vec::new(),
        },
        other => other,
    };

    let Some(maps) = ohdsi.get("maps").and_then(Value::as_array) else {
        return Vec::new();
    };

    maps.iter()
        .filter(|map| {
            map.get("vocabulary_id").and_then(Value::as_str) == Some(vocabulary)
        })
        .filter_map(|map| {
            let code = map.get("concept_code").and_then(Value::as_str)?;
            let name = map.get("concept_name").and_then(Value::as_str)?;
            Some((code.to_string(), name.to_string()))
        })
        .collect()
}
