//! Retrieval backends for Stepline.
//!
//! The orchestration loop only sees the `Retriever` trait from
//! `stepline-core`. This crate ships the in-memory keyword retriever used
//! by the binary; production deployments plug in their own knowledge store.

pub mod keyword;

use std::sync::Arc;

use stepline_config::RetrievalConfig;
use stepline_core::retriever::Retriever;

pub use keyword::{KeywordRetriever, extract_keywords};

/// Build the configured retriever, or `None` when retrieval is disabled.
pub fn from_config(config: &RetrievalConfig) -> Option<Arc<dyn Retriever>> {
    if !config.enabled {
        return None;
    }
    Some(Arc::new(KeywordRetriever::from_config(config)))
}
