//! In-memory keyword retriever.
//!
//! Ranks configured passages by how well they overlap with the query:
//! a full phrase match, the share of query words found in the passage, and
//! the share of query words among the passage's extracted keywords.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use stepline_config::RetrievalConfig;
use stepline_core::error::CollaboratorError;
use stepline_core::retriever::{Passage, Retriever};
use tracing::debug;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is",
    "are", "was", "were", "be", "been", "have", "has", "had", "do", "does", "did", "will", "would",
    "could", "should", "this", "that", "these", "those", "i", "you", "he", "she", "it", "we",
    "they", "what", "how", "can", "my", "your",
];

/// Most frequent keywords kept per passage.
const MAX_KEYWORDS: usize = 10;

/// Lowercased words of `text` with punctuation stripped.
fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect::<String>()
        .split_whitespace()
        .map(String::from)
        .collect()
}

/// The most frequent non-stop-words longer than two characters, most
/// frequent first, ties in first-seen order.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for word in words(text) {
        if word.chars().count() <= 2 || STOP_WORDS.contains(&word.as_str()) {
            continue;
        }
        let count = counts.entry(word.clone()).or_insert(0);
        if *count == 0 {
            order.push(word);
        }
        *count += 1;
    }
    // Stable sort keeps first-seen order among equal counts
    order.sort_by(|a, b| counts[b].cmp(&counts[a]));
    order.truncate(MAX_KEYWORDS);
    order
}

#[derive(Debug, Clone)]
struct IndexedPassage {
    citation_id: String,
    source: String,
    content: String,
    content_lower: String,
    words: HashSet<String>,
    keywords: Vec<String>,
    metadata: serde_json::Map<String, Value>,
}

impl IndexedPassage {
    fn score(&self, query_lower: &str, query_words: &HashSet<String>) -> f64 {
        if query_words.is_empty() {
            return 0.0;
        }
        let total = query_words.len() as f64;
        let mut score = 0.0;

        if !query_lower.is_empty() && self.content_lower.contains(query_lower) {
            score += 1.0;
        }

        let overlap = query_words.intersection(&self.words).count() as f64;
        score += (overlap / total) * 0.5;

        let keyword_hits = query_words
            .iter()
            .filter(|w| self.keywords.contains(w))
            .count() as f64;
        score += (keyword_hits / total) * 0.3;

        score
    }

    /// Every filter key must equal the passage's `source` or metadata value.
    fn matches_filters(&self, filters: Option<&Value>) -> bool {
        let Some(Value::Object(filters)) = filters else {
            return true;
        };
        filters.iter().all(|(key, expected)| match key.as_str() {
            "source" => expected.as_str() == Some(self.source.as_str()),
            _ => self.metadata.get(key) == Some(expected),
        })
    }
}

/// A retriever over the passages configured at startup.
pub struct KeywordRetriever {
    passages: Vec<IndexedPassage>,
    min_score: f64,
}

impl KeywordRetriever {
    /// Build from `[retrieval]`. Passages without an id are numbered
    /// `passage-<n>` from 1.
    pub fn from_config(config: &RetrievalConfig) -> Self {
        let passages = config
            .passages
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let id = p.id.clone().unwrap_or_else(|| format!("passage-{}", i + 1));
                index(id, p.source.clone(), p.content.clone(), p.metadata.clone())
            })
            .collect();
        Self {
            passages,
            min_score: config.min_score,
        }
    }
}

fn index(
    citation_id: String,
    source: String,
    content: String,
    metadata: serde_json::Map<String, Value>,
) -> IndexedPassage {
    IndexedPassage {
        content_lower: content.to_lowercase(),
        words: words(&content).into_iter().collect(),
        keywords: extract_keywords(&content),
        citation_id,
        source,
        content,
        metadata,
    }
}

#[async_trait]
impl Retriever for KeywordRetriever {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn query(
        &self,
        query: &str,
        filters: Option<&Value>,
        limit: usize,
    ) -> Result<Vec<Passage>, CollaboratorError> {
        if filters.is_some_and(|f| !f.is_object() && !f.is_null()) {
            return Err(CollaboratorError::Failed(
                "retrieval filters must be an object".into(),
            ));
        }

        let query_lower = query.trim().to_lowercase();
        let query_words: HashSet<String> = words(query)
            .into_iter()
            .filter(|w| !STOP_WORDS.contains(&w.as_str()))
            .collect();

        let mut results: Vec<Passage> = self
            .passages
            .iter()
            .filter(|p| p.matches_filters(filters))
            .map(|p| (p, p.score(&query_lower, &query_words)))
            .filter(|(_, score)| *score > 0.0 && *score >= self.min_score)
            .map(|(p, score)| Passage {
                citation_id: p.citation_id.clone(),
                content: p.content.clone(),
                source: p.source.clone(),
                score,
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);

        debug!(query = %query, hits = results.len(), "Keyword retrieval");
        Ok(results)
    }
}
