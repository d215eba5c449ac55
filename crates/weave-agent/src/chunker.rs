use std::iter::FusedIterator;
use std::sync::OnceLock;

use regex::Regex;

use crate::tokens::TokenEstimator;

/// A blank line (possibly holding spaces) plus any whitespace that follows it.
fn paragraph_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n[ \t\r]*\n\s*").expect("valid paragraph regex"))
}

/// Terminal punctuation, optional closing quotes/brackets, then whitespace.
fn sentence_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[.!?]+["')\]]*\s+"#).expect("valid sentence regex"))
}

/// Byte offset just past the first sentence (including trailing whitespace).
pub(crate) fn first_sentence_end(text: &str) -> Option<usize> {
    sentence_break()
        .find(text)
        .map(|m| m.end())
        .filter(|&end| end < text.len())
}

/// Last separator end in `text[..=limit]`, not counting the start of `text`.
///
/// Only the window just past `limit` is scanned. A match that reaches the end
/// of the window may be cut short, so it is ignored; its true end lies past
/// `limit` anyway.
fn last_split_within(text: &str, limit: usize, re: &Regex) -> Option<usize> {
    let window = next_boundary(text, limit + 1);
    re.find_iter(&text[..window])
        .map(|m| m.end())
        .filter(|&end| end > 0 && end <= limit && end < window)
        .last()
}

/// Smallest char boundary of `text` at or after `i`, capped at its length.
fn next_boundary(text: &str, mut i: usize) -> usize {
    while i < text.len() && !text.is_char_boundary(i) {
        i += 1;
    }
    i.min(text.len())
}

/// Lazy sequence of document chunks.
///
/// Each chunk is a contiguous slice of the source document, so concatenating
/// every chunk yields the document exactly. Splits prefer paragraph
/// boundaries, then sentence boundaries, then the longest prefix that fits.
/// A chunk only exceeds the budget when it is a single character.
///
/// Work per chunk is bounded by the chunk's own size, not the remaining
/// document, so chunking a document is linear up to a log factor.
///
/// Cloning, or calling [`Chunks::restart`], yields an independent sequence.
#[derive(Clone)]
pub struct Chunks<'a> {
    doc: &'a str,
    pos: usize,
    budget: usize,
    estimator: &'a dyn TokenEstimator,
}

impl<'a> Chunks<'a> {
    pub fn new(doc: &'a str, budget: usize, estimator: &'a dyn TokenEstimator) -> Self {
        Self {
            doc,
            pos: 0,
            budget,
            estimator,
        }
    }

    /// A fresh sequence over the same document from the beginning.
    pub fn restart(&self) -> Self {
        Self { pos: 0, ..self.clone() }
    }

    fn fits(&self, text: &str) -> bool {
        self.estimator.estimate(text) <= self.budget
    }

    /// Byte length of the longest char-boundary prefix of `text` that fits.
    ///
    /// Gallops with doubling probes until one overshoots, then bisects. Only
    /// prefixes up to twice the answer are ever estimated, which relies on
    /// the estimate being monotonic in length.
    fn fitting_prefix(&self, text: &str) -> usize {
        let mut lo = 0;
        let mut step = 1;
        let mut hi = loop {
            let probe = next_boundary(text, lo + step);
            if !self.fits(&text[..probe]) {
                break probe;
            }
            lo = probe;
            if probe == text.len() {
                return lo;
            }
            step *= 2;
        };

        // `lo` fits, `hi` does not.
        loop {
            let mut mid = next_boundary(text, lo + (hi - lo) / 2);
            if mid == lo {
                mid = next_boundary(text, lo + 1);
            }
            if mid >= hi {
                return lo;
            }
            if self.fits(&text[..mid]) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
    }

    fn next_end(&self, rest: &str) -> usize {
        let limit = self.fitting_prefix(rest);
        if limit == rest.len() {
            return limit;
        }
        if limit == 0 {
            return next_boundary(rest, 1);
        }

        // Every paragraph break inside the fitting prefix ends the chunk at
        // a paragraph; otherwise the first paragraph overflows and is split
        // by sentence, then by character.
        last_split_within(rest, limit, paragraph_break())
            .or_else(|| last_split_within(rest, limit, sentence_break()))
            .unwrap_or(limit)
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.pos >= self.doc.len() {
            return None;
        }
        let rest = &self.doc[self.pos..];
        let end = self.next_end(rest);
        self.pos += end;
        Some(&rest[..end])
    }
}

impl FusedIterator for Chunks<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::tokens::CharEstimator;

    fn collect(doc: &str, budget: usize, chars_per_token: usize) -> Vec<String> {
        let est = CharEstimator::new(chars_per_token);
        Chunks::new(doc, budget, &est).map(str::to_string).collect()
    }

    #[test]
    fn test_empty_document() {
        assert!(collect("", 10, 1).is_empty());
    }

    #[test]
    fn test_small_document_single_chunk() {
        let doc = "One paragraph.\n\nAnother one.";
        assert_eq!(collect(doc, 100, 1), vec![doc.to_string()]);
    }

    #[test]
    fn test_splits_on_paragraphs_first() {
        let doc = "alpha beta.\n\ngamma delta.\n\nepsilon.";
        let chunks = collect(doc, 15, 1);
        assert_eq!(
            chunks,
            vec!["alpha beta.\n\n", "gamma delta.\n\n", "epsilon."]
        );
    }

    #[test]
    fn test_packs_multiple_paragraphs() {
        let doc = "a.\n\nb.\n\nc.\n\nd.";
        let chunks = collect(doc, 8, 1);
        assert_eq!(chunks, vec!["a.\n\nb.\n\n", "c.\n\nd."]);
    }

    #[test]
    fn test_long_paragraph_splits_on_sentences() {
        let doc = "First sentence here. Second sentence here. Third one.";
        let chunks = collect(doc, 25, 1);
        assert_eq!(
            chunks,
            vec!["First sentence here. ", "Second sentence here. ", "Third one."]
        );
    }

    #[test]
    fn test_long_sentence_splits_into_fragments() {
        let doc = "abcdefghijklmnopqrstuvwxyz";
        let chunks = collect(doc, 10, 1);
        assert_eq!(chunks, vec!["abcdefghij", "klmnopqrst", "uvwxyz"]);
    }

    #[test]
    fn test_zero_budget_emits_single_chars() {
        let chunks = collect("héy", 0, 1);
        assert_eq!(chunks, vec!["h", "é", "y"]);
    }

    #[test]
    fn test_reconstructs_and_respects_budget() {
        let doc = "# Title\n\nIntro paragraph with a few words. It has two sentences!\n\n\
                   A much longer paragraph follows, and it keeps going with clauses and \
                   more clauses so that it certainly exceeds the budget. Then a short one. \
                   Finally, averyveryveryverylongwordthatcannotbesplitonanyboundaryatall.\n\n\
                   Outro.";
        for budget in [1usize, 3, 5, 8, 13, 40, 1000] {
            let est = CharEstimator::new(4);
            let chunks: Vec<&str> = Chunks::new(doc, budget, &est).collect();
            assert_eq!(chunks.concat(), doc, "budget {}", budget);
            for chunk in &chunks {
                assert!(
                    est.estimate(chunk) <= budget || chunk.chars().count() == 1,
                    "chunk {:?} over budget {}",
                    chunk,
                    budget
                );
            }
        }
    }

    #[test]
    fn test_restartable() {
        let est = CharEstimator::new(1);
        let doc = "one. two. three. four.";
        let mut chunks = Chunks::new(doc, 6, &est);
        let first: Vec<&str> = chunks.by_ref().take(2).collect();
        let again: Vec<&str> = chunks.restart().collect();
        assert_eq!(again.len(), 4);
        assert_eq!(&again[..2], &first[..]);
        assert_eq!(chunks.count(), 2);
    }

    /// Sums the length of every text it is asked to estimate.
    struct MeteredEstimator {
        inner: CharEstimator,
        scanned: AtomicUsize,
    }

    impl TokenEstimator for MeteredEstimator {
        fn estimate(&self, text: &str) -> usize {
            self.scanned.fetch_add(text.len(), Ordering::Relaxed);
            self.inner.estimate(text)
        }
    }

    fn scanned_for(doc: &str, budget: usize) -> usize {
        let est = MeteredEstimator {
            inner: CharEstimator::new(1),
            scanned: AtomicUsize::new(0),
        };
        let chunks: Vec<&str> = Chunks::new(doc, budget, &est).collect();
        assert_eq!(chunks.concat(), doc);
        est.scanned.load(Ordering::Relaxed)
    }

    #[test]
    fn test_work_grows_linearly_with_document() {
        let small = scanned_for(&"x".repeat(50_000), 10);
        let large = scanned_for(&"x".repeat(100_000), 10);
        assert!(small < 50_000 * 8, "scanned {} chars", small);
        assert!(large <= 2 * small + 100, "scanned {} vs {}", large, small);

        let paragraphs = "Short paragraph here.\n\n".repeat(8_000);
        let scanned = scanned_for(&paragraphs, 500);
        assert!(
            scanned < paragraphs.len() * 40,
            "scanned {} chars for {}",
            scanned,
            paragraphs.len()
        );
    }

    #[test]
    fn test_sentence_split_inside_long_paragraph() {
        let doc = "One two. Three four five six seven.\n\nTail.";
        let chunks = collect(doc, 12, 1);
        assert_eq!(chunks[0], "One two. ");
        assert_eq!(chunks.concat(), doc);
    }

    #[test]
    fn test_first_sentence_end() {
        assert_eq!(first_sentence_end("Hi. There."), Some(4));
        assert_eq!(first_sentence_end("No terminator"), None);
        assert_eq!(first_sentence_end("Only one."), None);
    }
}
