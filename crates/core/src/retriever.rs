//! Retriever trait: the knowledge store seen from the orchestration loop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CollaboratorError;

/// A single retrieval hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    /// Stable id a response cites this passage by
    pub citation_id: String,

    pub content: String,

    /// Where the passage came from (document title, URL, ...)
    pub source: String,

    /// Relevance score, higher is better
    pub score: f64,
}

/// Queries an external knowledge store.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Return at most `limit` passages relevant to `query`.
    ///
    /// `filters` is an opaque JSON object passed through from the step input.
    async fn query(
        &self,
        query: &str,
        filters: Option<&Value>,
        limit: usize,
    ) -> Result<Vec<Passage>, CollaboratorError>;
}
