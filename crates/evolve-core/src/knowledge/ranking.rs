//! Relevance ranking for knowledge queries.

use std::sync::Arc;

use super::entry::KnowledgeEntry;
use crate::config::RankingMode;

/// A parsed query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankQuery {
    pub text: String,
    /// Lowercased, de-duplicated terms.
    pub terms: Vec<String>,
    pub embedding: Option<Vec<f32>>,
}

impl RankQuery {
    pub fn new(text: &str) -> Self {
        let mut terms: Vec<String> = Vec::new();
        for term in text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
        {
            if !terms.contains(&term) {
                terms.push(term);
            }
        }
        Self {
            text: text.to_string(),
            terms,
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// No terms and no embedding: results rank by stored relevance.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.embedding.is_none()
    }
}

/// Scores an entry against a query. Higher is more relevant; `0.0` means no match.
pub trait RelevanceRanker: Send + Sync {
    fn name(&self) -> &'static str;

    fn score(&self, query: &RankQuery, entry: &KnowledgeEntry) -> f64;
}

/// Fraction of query terms present in the entry's key terms or content.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordRanker;

impl RelevanceRanker for KeywordRanker {
    fn name(&self) -> &'static str {
        "keyword"
    }

    fn score(&self, query: &RankQuery, entry: &KnowledgeEntry) -> f64 {
        if query.terms.is_empty() {
            return 0.0;
        }
        let text = entry.searchable_text();
        let hits = query.terms.iter().filter(|t| text.contains(t.as_str())).count();
        hits as f64 / query.terms.len() as f64
    }
}

/// Cosine similarity between embeddings, falling back to keyword overlap
/// when either side has no embedding.
#[derive(Debug, Default, Clone, Copy)]
pub struct CosineRanker;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return None;
    }
    Some(dot / (na.sqrt() * nb.sqrt()))
}

impl RelevanceRanker for CosineRanker {
    fn name(&self) -> &'static str {
        "cosine"
    }

    fn score(&self, query: &RankQuery, entry: &KnowledgeEntry) -> f64 {
        match (&query.embedding, &entry.embedding) {
            (Some(q), Some(e)) => cosine_similarity(q, e).map(|s| s.max(0.0)).unwrap_or(0.0),
            _ => KeywordRanker.score(query, entry),
        }
    }
}

pub fn ranker_for(mode: RankingMode) -> Arc<dyn RelevanceRanker> {
    match mode {
        RankingMode::Keyword => Arc::new(KeywordRanker),
        RankingMode::Cosine => Arc::new(CosineRanker),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::KnowledgeKind;
    use serde_json::json;

    fn entry(terms: &[&str]) -> KnowledgeEntry {
        KnowledgeEntry::new("a1", KnowledgeKind::Experience, json!({})).with_key_terms(terms.iter().copied())
    }

    #[test]
    fn query_terms_are_normalized() {
        let q = RankQuery::new("Caching, caching  LATENCY!");
        assert_eq!(q.terms, vec!["caching", "latency"]);
        assert!(RankQuery::new("  ").is_empty());
    }

    #[test]
    fn keyword_overlap_fraction() {
        let q = RankQuery::new("caching latency");
        assert_eq!(KeywordRanker.score(&q, &entry(&["caching"])), 0.5);
        assert_eq!(KeywordRanker.score(&q, &entry(&["caching", "latency"])), 1.0);
        assert_eq!(KeywordRanker.score(&q, &entry(&["reports"])), 0.0);
    }

    #[test]
    fn cosine_prefers_aligned_embeddings() {
        let q = RankQuery::new("").with_embedding(vec![1.0, 0.0]);
        let aligned = entry(&[]).with_embedding(vec![2.0, 0.0]);
        let orthogonal = entry(&[]).with_embedding(vec![0.0, 1.0]);
        assert!((CosineRanker.score(&q, &aligned) - 1.0).abs() < 1e-9);
        assert_eq!(CosineRanker.score(&q, &orthogonal), 0.0);
    }

    #[test]
    fn cosine_falls_back_to_keywords() {
        let q = RankQuery::new("caching");
        assert_eq!(CosineRanker.score(&q, &entry(&["caching"])), 1.0);
    }

    #[test]
    fn mismatched_dimensions_have_no_similarity() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), None);
    }
}
