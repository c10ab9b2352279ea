use unicode_segmentation::UnicodeSegmentation;

/// Measures text against a token budget.
///
/// `truncate(text, max)` returns a prefix of `text`; counting it may still
/// exceed `max` for counters whose segmentation depends on context, so
/// callers re-check.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    fn truncate(&self, text: &str, max_tokens: usize) -> String;
}

/// Roughly four characters per token, which tracks BPE tokenizers on code.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

const CHARS_PER_TOKEN: usize = 4;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(CHARS_PER_TOKEN)
    }

    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if self.count(text) <= max_tokens {
            return text.to_string();
        }
        let max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
        let end = text
            .char_indices()
            .nth(max_chars)
            .map_or(text.len(), |(idx, _)| idx);
        let prefix = &text[..end];

        // Prefer ending on a line break when it keeps most of the allowance.
        match prefix.rfind('\n') {
            Some(cut) if cut >= prefix.len() * 3 / 4 => prefix[..cut].to_string(),
            _ => prefix.to_string(),
        }
    }
}

/// Counts Unicode word-boundary segments, ignoring whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordTokenCounter;

impl TokenCounter for WordTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.split_word_bounds()
            .filter(|segment| !segment.trim().is_empty())
            .count()
    }

    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        let mut seen = 0usize;
        for (idx, segment) in text.split_word_bound_indices() {
            if segment.trim().is_empty() {
                continue;
            }
            if seen == max_tokens {
                return text[..idx].trim_end().to_string();
            }
            seen += 1;
        }
        text.to_string()
    }
}
