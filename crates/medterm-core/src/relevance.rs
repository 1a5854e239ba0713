//! Semantic relevance filtering of session items against a query.
//!
//! A pure filter: embed the query, embed each item's text form, keep items
//! at or above the cosine-similarity threshold, sorted best-first. Any
//! failure to embed the query degrades to "return everything" so a broken
//! embedding backend never hides session data.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::session::DataItem;

/// Produces embedding vectors for arbitrary text.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 for mismatched lengths or zero-norm inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Filters session items by semantic similarity to a query.
pub struct RelevanceFilter {
    embedder: Arc<dyn TextEmbedder>,
    threshold: f32,
}

impl RelevanceFilter {
    pub fn new(embedder: Arc<dyn TextEmbedder>, threshold: f32) -> Self {
        Self {
            embedder,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Returns the items relevant to `query`, most similar first.
    ///
    /// Fallback behavior: an empty query or a failed query embedding
    /// returns every item unchanged; an item whose embedding fails is
    /// skipped.
    pub async fn filter(&self, query: &str, items: Vec<DataItem>) -> Vec<DataItem> {
        if items.is_empty() || query.trim().is_empty() {
            return items;
        }

        let query_embedding = match self.embedder.embed(query).await {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!("Failed to embed query, returning all items unfiltered: {err}");
                return items;
            }
        };

        let total = items.len();
        let mut scored: Vec<(DataItem, f32)> = Vec::with_capacity(total);
        for item in items {
            let item_embedding = match self.embedder.embed(&item.searchable_text()).await {
                Ok(embedding) => embedding,
                Err(err) => {
                    warn!("Failed to embed item {}, skipping: {err}", item.key);
                    continue;
                }
            };

            let similarity = cosine_similarity(&query_embedding, &item_embedding);
            if similarity >= self.threshold {
                debug!("{}: similarity={similarity:.3} (relevant)", item.key);
                scored.push((item, similarity));
            } else {
                debug!("{}: similarity={similarity:.3} (filtered out)", item.key);
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        debug!(
            "Semantic filtering: {total} total -> {} relevant (threshold {})",
            scored.len(),
            self.threshold
        );
        scored.into_iter().map(|(item, _)| item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MedtermError;
    use std::collections::HashMap;

    /// Embedder backed by a fixed text->vector table; unknown text errors.
    struct FixedEmbedder {
        vectors: HashMap<String, Vec<f32>>,
    }

    #[async_trait]
    impl TextEmbedder for FixedEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.vectors
                .get(text)
                .cloned()
                .ok_or_else(|| MedtermError::embedding(format!("no vector for '{text}'")))
        }
    }

    /// Embedder that always fails.
    struct BrokenEmbedder;

    #[async_trait]
    impl TextEmbedder for BrokenEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(MedtermError::embedding("backend offline"))
        }
    }

    fn item(key: &str, value: &str) -> DataItem {
        DataItem::new("icd_code", key, value)
    }

    fn fixture() -> (FixedEmbedder, Vec<DataItem>) {
        let mut vectors = HashMap::new();
        vectors.insert("hypertension".to_string(), vec![1.0, 0.0]);
        // searchable_text() is "<key> <value>"
        vectors.insert("I10 high blood pressure".to_string(), vec![0.9, 0.1]);
        vectors.insert("E11 diabetes".to_string(), vec![0.1, 0.9]);
        vectors.insert("I15 secondary hypertension".to_string(), vec![0.7, 0.3]);

        let items = vec![
            item("E11", "diabetes"),
            item("I15", "secondary hypertension"),
            item("I10", "high blood pressure"),
        ];
        (FixedEmbedder { vectors }, items)
    }

    #[test]
    fn test_cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn test_filter_excludes_below_threshold_and_sorts() {
        let (embedder, items) = fixture();
        let filter = RelevanceFilter::new(Arc::new(embedder), 0.5);

        let relevant = filter.filter("hypertension", items).await;

        let keys: Vec<&str> = relevant.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["I10", "I15"]);
    }

    #[tokio::test]
    async fn test_zero_threshold_returns_all_sorted() {
        let (embedder, items) = fixture();
        let filter = RelevanceFilter::new(Arc::new(embedder), 0.0);

        let relevant = filter.filter("hypertension", items).await;

        assert_eq!(relevant.len(), 3);
        assert_eq!(relevant[0].key, "I10");
        assert_eq!(relevant[2].key, "E11");
    }

    #[tokio::test]
    async fn test_embedding_failure_returns_all_unfiltered() {
        let items = vec![item("I10", "a"), item("E11", "b")];
        let filter = RelevanceFilter::new(Arc::new(BrokenEmbedder), 0.5);

        let result = filter.filter("hypertension", items.clone()).await;

        assert_eq!(result, items);
    }

    #[tokio::test]
    async fn test_empty_query_returns_all() {
        let (embedder, items) = fixture();
        let filter = RelevanceFilter::new(Arc::new(embedder), 0.5);

        let result = filter.filter("  ", items.clone()).await;
        assert_eq!(result, items);
    }

    #[tokio::test]
    async fn test_item_embed_failure_skips_item() {
        let mut vectors = HashMap::new();
        vectors.insert("hypertension".to_string(), vec![1.0, 0.0]);
        vectors.insert("I10 high blood pressure".to_string(), vec![1.0, 0.0]);
        // no vector for E11 -> its embedding fails and it is skipped
        let embedder = FixedEmbedder { vectors };
        let filter = RelevanceFilter::new(Arc::new(embedder), 0.5);

        let items = vec![item("I10", "high blood pressure"), item("E11", "diabetes")];
        let relevant = filter.filter("hypertension", items).await;

        assert_eq!(relevant.len(), 1);
        assert_eq!(relevant[0].key, "I10");
    }
}
