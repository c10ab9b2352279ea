use crate::error::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

/// Scores how well a text answers a query; higher is better.
///
/// Implementations may be slow (cross-encoders); callers bound them with a
/// timeout and fall back to retrieval order.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    async fn score(&self, query: &str, text: &str) -> Result<f32>;

    /// Score a candidate list; the result is aligned with `texts`.
    async fn score_batch(&self, query: &str, texts: &[&str]) -> Result<Vec<f32>> {
        let mut scores = Vec::with_capacity(texts.len());
        for text in texts {
            scores.push(self.score(query, text).await?);
        }
        Ok(scores)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Config {
    pub k1: f32,
    pub b: f32,
    /// Only the first `window` matching tokens of a text are considered.
    pub window: usize,
    /// Added once when every query term occurs in the text.
    pub coverage_bonus: f32,
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            window: 512,
            coverage_bonus: 0.5,
        }
    }
}

/// BM25 over identifier-aware tokens, computed across the candidate set.
///
/// `paginate_queryset`, `PaginateQueryset` and `paginate queryset` all
/// produce the terms `paginate` and `queryset`.
#[derive(Debug, Clone, Default)]
pub struct LexicalReranker {
    cfg: Bm25Config,
}

impl LexicalReranker {
    #[must_use]
    pub const fn new(cfg: Bm25Config) -> Self {
        Self { cfg }
    }

    fn score_all(&self, query: &str, texts: &[&str]) -> Vec<f32> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return vec![0.0; texts.len()];
        }
        let bm25 = Bm25Context::build(self.cfg, texts, &terms);
        (0..texts.len()).map(|idx| bm25.score(idx, &terms)).collect()
    }
}

#[async_trait]
impl Reranker for LexicalReranker {
    fn name(&self) -> &str {
        "lexical-bm25"
    }

    async fn score(&self, query: &str, text: &str) -> Result<f32> {
        Ok(self.score_all(query, &[text]).first().copied().unwrap_or(0.0))
    }

    async fn score_batch(&self, query: &str, texts: &[&str]) -> Result<Vec<f32>> {
        Ok(self.score_all(query, texts))
    }
}

struct Bm25Context {
    cfg: Bm25Config,
    docs: Vec<Vec<String>>,
    doc_freq: HashMap<String, usize>,
    avg_len: f32,
}

impl Bm25Context {
    fn build(cfg: Bm25Config, texts: &[&str], query_terms: &[String]) -> Self {
        let allow: HashSet<&str> = query_terms.iter().map(String::as_str).collect();
        let mut doc_freq = HashMap::new();
        let mut total_len = 0usize;
        let mut docs = Vec::with_capacity(texts.len());

        for text in texts {
            let tokens: Vec<String> = identifier_terms(text)
                .filter(|t| allow.contains(t.as_str()))
                .take(cfg.window)
                .collect();
            total_len += tokens.len();
            let mut seen = HashSet::new();
            for token in &tokens {
                if seen.insert(token.as_str()) {
                    *doc_freq.entry(token.clone()).or_insert(0) += 1;
                }
            }
            docs.push(tokens);
        }

        let doc_count = docs.len().max(1);
        let avg_len = total_len as f32 / doc_count as f32;
        Self {
            cfg,
            docs,
            doc_freq,
            avg_len,
        }
    }

    fn score(&self, idx: usize, query_terms: &[String]) -> f32 {
        let Some(doc) = self.docs.get(idx) else {
            return 0.0;
        };
        if doc.is_empty() {
            return 0.0;
        }

        let dl = doc.len() as f32;
        let total_docs = self.docs.len().max(1) as f32;
        let mut score = 0.0;
        let mut matched = 0usize;

        for term in query_terms {
            let freq = doc.iter().filter(|t| *t == term).count() as f32;
            if freq <= 0.0 {
                continue;
            }
            matched += 1;
            let df = self.doc_freq.get(term).copied().unwrap_or(0) as f32;
            let idf = bm25_idf(total_docs, df);
            let denom = freq
                + self.cfg.k1 * (1.0 - self.cfg.b + self.cfg.b * dl / self.avg_len.max(1e-3));
            if denom > 0.0 {
                score += idf * (freq * (self.cfg.k1 + 1.0)) / denom;
            }
        }

        if matched == query_terms.len() {
            score += self.cfg.coverage_bonus;
        }
        score
    }
}

fn bm25_idf(total_docs: f32, df: f32) -> f32 {
    ((total_docs - df + 0.5) / (df + 0.5) + 1.0).ln()
}

/// Distinct query terms in first-seen order.
fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    identifier_terms(query)
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Lowercase terms of at least two characters, split on punctuation,
/// underscores and camelCase humps.
fn identifier_terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .flat_map(split_camel)
        .filter(|t| t.chars().count() >= 2)
}

fn split_camel(word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in word.chars() {
        if ch.is_uppercase() && prev_lower && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn identifiers_are_split() {
        let terms: Vec<String> = identifier_terms("def paginateQueryset(self, page_size):").collect();
        assert_eq!(terms, vec!["def", "paginate", "queryset", "self", "page", "size"]);
    }

    #[tokio::test]
    async fn matching_identifier_outranks_unrelated_text() {
        let reranker = LexicalReranker::default();
        let texts = [
            "def render_page(request):\n    return render(request, 'page.html')",
            "def paginate_queryset(queryset, page_size):\n    return queryset[:page_size]",
        ];
        let scores = reranker
            .score_batch("paginate queryset", &texts)
            .await
            .unwrap();
        assert_eq!(scores[0], 0.0);
        assert!(scores[1] > 0.0);
    }

    #[tokio::test]
    async fn full_coverage_beats_partial() {
        let reranker = LexicalReranker::default();
        let scores = reranker
            .score_batch(
                "load config",
                &["def load_config(path): ...", "def load_model(path): ..."],
            )
            .await
            .unwrap();
        assert!(scores[0] > scores[1]);
        assert!(scores[1] > 0.0);
    }

    #[tokio::test]
    async fn single_score_matches_batch_of_one() {
        let reranker = LexicalReranker::default();
        let text = "class QuerySet:\n    def filter(self): ...";
        let single = reranker.score("queryset filter", text).await.unwrap();
        let batch = reranker
            .score_batch("queryset filter", &[text])
            .await
            .unwrap();
        assert_eq!(single, batch[0]);
    }
}
