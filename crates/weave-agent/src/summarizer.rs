use crate::chunker::first_sentence_end;

/// Pluggable strategy for shortening a message that no longer fits verbatim.
pub trait Summarizer: Send + Sync + 'static {
    /// Produce text no longer than `text`.
    fn summarize(&self, text: &str) -> String;
}

/// Keeps the leading sentence and notes how much was elided.
///
/// `"First point. More detail here."` becomes
/// `"First point. [... 17 chars elided]"` when that is shorter than the input;
/// otherwise the input is returned unchanged.
#[derive(Debug, Clone)]
pub struct LeadSentenceSummarizer {
    max_lead_chars: usize,
}

impl LeadSentenceSummarizer {
    pub fn new(max_lead_chars: usize) -> Self {
        Self {
            max_lead_chars: max_lead_chars.max(1),
        }
    }
}

impl Default for LeadSentenceSummarizer {
    fn default() -> Self {
        Self::new(200)
    }
}

impl Summarizer for LeadSentenceSummarizer {
    fn summarize(&self, text: &str) -> String {
        let trimmed = text.trim_start();
        let lead_end = first_sentence_end(trimmed).unwrap_or(trimmed.len());
        let lead = truncate_chars(trimmed[..lead_end].trim_end(), self.max_lead_chars);

        let total_chars = text.chars().count();
        let elided = total_chars.saturating_sub(lead.chars().count());
        if elided == 0 {
            return text.to_string();
        }

        let summary = format!("{} [... {} chars elided]", lead, elided);
        if summary.len() < text.len() && summary.chars().count() < total_chars {
            summary
        } else {
            text.to_string()
        }
    }
}

/// Truncate to at most `max` chars, respecting char boundaries.
fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
