//! Search service trait definition.

use async_trait::async_trait;

use crate::error::Result;
use crate::search::{SearchHit, SearchRequest};

/// Service for executing hybrid (keyword + semantic) searches against a
/// terminology index.
///
/// Implementations talk to the real backend; tests substitute canned hits.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Executes a search and returns the scored hits.
    ///
    /// # Errors
    ///
    /// Returns a `Search` error for configuration or HTTP failures.
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>>;
}
