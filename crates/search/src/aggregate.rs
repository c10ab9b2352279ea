use crate::tokens::TokenCounter;
use crate::types::{ContextBlock, ContextResult, ContextSummary, SearchHit};

/// Outcome of offering one hit to a [`ContextAggregator`].
#[derive(Debug)]
pub enum Admission {
    Included(ContextBlock),
    /// Fully inside an already included chunk of the same file.
    Nested,
    /// The budget is spent; later hits are not considered.
    Exhausted,
}

/// Packs ranked hits into a token budget.
///
/// Hits are offered in rank order. A hit that would overflow the budget ends
/// aggregation, except for the very first one, which is truncated to fit.
/// Token accounting covers chunk bodies; headers are not counted.
pub struct ContextAggregator<'a> {
    counter: &'a dyn TokenCounter,
    budget: usize,
    used: usize,
    spans: Vec<SearchHit>,
    skipped_nested: usize,
    truncated: bool,
    exhausted: bool,
}

impl<'a> ContextAggregator<'a> {
    pub fn new(counter: &'a dyn TokenCounter, budget: usize) -> Self {
        Self {
            counter,
            budget,
            used: 0,
            spans: Vec::new(),
            skipped_nested: 0,
            truncated: false,
            exhausted: false,
        }
    }

    pub fn offer(&mut self, hit: &SearchHit) -> Admission {
        if self.exhausted {
            return Admission::Exhausted;
        }
        if self.spans.iter().any(|included| included.contains(hit)) {
            self.skipped_nested += 1;
            log::debug!(
                "Skipping {}:{}-{} nested in an included chunk",
                hit.path,
                hit.start_line,
                hit.end_line
            );
            return Admission::Nested;
        }

        let remaining = self.budget - self.used;
        let tokens = self.counter.count(&hit.text);
        if tokens <= remaining {
            return self.admit(hit, hit.text.clone(), tokens, false);
        }

        self.exhausted = true;
        if !self.spans.is_empty() {
            return Admission::Exhausted;
        }
        let text = fit_to_budget(self.counter, &hit.text, remaining);
        if text.is_empty() {
            return Admission::Exhausted;
        }
        let tokens = self.counter.count(&text);
        self.truncated = true;
        self.admit(hit, text, tokens, true)
    }

    fn admit(&mut self, hit: &SearchHit, text: String, tokens: usize, truncated: bool) -> Admission {
        self.used += tokens;
        self.spans.push(hit.clone());
        Admission::Included(ContextBlock {
            hit: hit.clone(),
            text,
            tokens,
            truncated,
        })
    }

    #[must_use]
    pub fn summary(&self) -> ContextSummary {
        ContextSummary {
            token_count: self.used,
            budget: self.budget,
            included: self.spans.len(),
            skipped_nested: self.skipped_nested,
            truncated: self.truncated,
        }
    }
}

/// Aggregate `results` in order into a complete [`ContextResult`].
pub fn aggregate(results: Vec<SearchHit>, counter: &dyn TokenCounter, budget: usize) -> ContextResult {
    let mut aggregator = ContextAggregator::new(counter, budget);
    let mut blocks = Vec::new();
    for hit in &results {
        match aggregator.offer(hit) {
            Admission::Included(block) => blocks.push(block),
            Admission::Nested => {}
            Admission::Exhausted => break,
        }
    }

    let summary = aggregator.summary();
    let aggregated_text = blocks
        .iter()
        .map(ContextBlock::render)
        .collect::<Vec<_>>()
        .join("\n\n");

    ContextResult {
        results,
        blocks,
        aggregated_text,
        token_count: summary.token_count,
        budget: summary.budget,
        included: summary.included,
        skipped_nested: summary.skipped_nested,
        truncated: summary.truncated,
    }
}

fn fit_to_budget(counter: &dyn TokenCounter, text: &str, budget: usize) -> String {
    let mut limit = budget;
    loop {
        let cut = counter.truncate(text, limit);
        if counter.count(&cut) <= budget {
            return cut;
        }
        if limit == 0 {
            return String::new();
        }
        limit -= 1;
    }
}
