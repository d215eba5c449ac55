//! Context window management: fits prior conversation into a bounded budget
//! before it is handed to an agent, and splits large documents into
//! budget-sized chunks.

use std::sync::Arc;

use tracing::debug;

use weave_core::config::ContextConfig;
use weave_core::types::{Message, Role};

use crate::chunker::Chunks;
use crate::summarizer::{LeadSentenceSummarizer, Summarizer};
use crate::tokens::{CharEstimator, TokenEstimator};

/// Fits message history into a token budget.
///
/// Every operation degrades to an empty or shortened result instead of failing.
#[derive(Clone)]
pub struct ContextWindowManager {
    estimator: Arc<dyn TokenEstimator>,
    summarizer: Arc<dyn Summarizer>,
}

impl ContextWindowManager {
    pub fn new(estimator: Arc<dyn TokenEstimator>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            estimator,
            summarizer,
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(
            Arc::new(CharEstimator::new(config.chars_per_token)),
            Arc::new(LeadSentenceSummarizer::default()),
        )
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    pub fn cost(&self, text: &str) -> usize {
        self.estimator.estimate(text)
    }

    pub fn summarize(&self, text: &str) -> String {
        self.summarizer.summarize(text)
    }

    /// Split a document into chunks of at most `max_chunk_budget`.
    pub fn chunk<'a>(&'a self, document: &'a str, max_chunk_budget: usize) -> Chunks<'a> {
        Chunks::new(document, max_chunk_budget, self.estimator.as_ref())
    }

    /// Select (and possibly summarize) prior messages so that they fit
    /// alongside the preamble and current input.
    ///
    /// The available budget is `max_budget - cost(preamble) - cost(current_input) - reserve`.
    /// Messages that already fit are returned unchanged. The output is always
    /// a subsequence of the input order.
    pub fn optimize(
        &self,
        messages: &[Message],
        preamble: &str,
        current_input: &str,
        max_budget: usize,
        reserve: usize,
        prioritize_recent: bool,
    ) -> Vec<Message> {
        let overhead = self
            .cost(preamble)
            .saturating_add(self.cost(current_input))
            .saturating_add(reserve);
        if overhead >= max_budget {
            debug!(max_budget, overhead, "No budget left for history");
            return Vec::new();
        }
        self.fit(messages, max_budget - overhead, prioritize_recent)
    }

    /// Fit `messages` into `available` budget units.
    pub fn fit(&self, messages: &[Message], available: usize, prioritize_recent: bool) -> Vec<Message> {
        let total: usize = messages.iter().map(|m| self.estimator.message_cost(m)).sum();
        if total <= available {
            return messages.to_vec();
        }

        let kept = if prioritize_recent {
            self.recency_first(messages, available)
        } else {
            self.pair_preserving(messages, available)
        };
        debug!(
            original = messages.len(),
            kept = kept.len(),
            total,
            available,
            prioritize_recent,
            "Pruned history to budget"
        );
        kept
    }

    /// Newest to oldest: keep what fits, fall back to a summary, skip the rest.
    fn recency_first(&self, messages: &[Message], available: usize) -> Vec<Message> {
        let mut used = 0usize;
        let mut kept = Vec::new();

        for msg in messages.iter().rev() {
            let cost = self.estimator.message_cost(msg);
            if used + cost <= available {
                used += cost;
                kept.push(msg.clone());
                continue;
            }

            let summary = self.summarizer.summarize(&msg.content);
            if summary.len() >= msg.content.len() {
                continue;
            }
            let shortened = Message::new(msg.role, summary);
            let cost = self.estimator.message_cost(&shortened);
            if used + cost <= available {
                used += cost;
                kept.push(shortened);
            }
        }

        kept.reverse();
        kept
    }

    /// Keep whole user/assistant pairs from the most recent backward, stopping
    /// at the first pair that does not fit.
    fn pair_preserving(&self, messages: &[Message], available: usize) -> Vec<Message> {
        let mut groups = Vec::new();
        let mut i = 0;
        while i < messages.len() {
            let paired = messages[i].role == Role::User
                && messages
                    .get(i + 1)
                    .is_some_and(|next| next.role == Role::Assistant);
            let len = if paired { 2 } else { 1 };
            groups.push(i..i + len);
            i += len;
        }

        let mut used = 0usize;
        let mut start = messages.len();
        for group in groups.iter().rev() {
            let cost: usize = messages[group.clone()]
                .iter()
                .map(|m| self.estimator.message_cost(m))
                .sum();
            if used + cost > available {
                break;
            }
            used += cost;
            start = group.start;
        }

        messages[start..].to_vec()
    }
}

impl Default for ContextWindowManager {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}

/// One retained entry of a [`ContextWindow`].
#[derive(Debug, Clone, PartialEq)]
pub struct ContextEntry {
    pub role: Role,
    pub content: String,
    pub cost: usize,
}

/// Append-only message window with a fixed capacity.
///
/// After [`optimize`](ContextWindow::optimize), the retained cost never
/// exceeds `capacity - reserved`.
#[derive(Clone)]
pub struct ContextWindow {
    entries: Vec<ContextEntry>,
    capacity: usize,
    reserved: usize,
    manager: ContextWindowManager,
}

impl ContextWindow {
    pub fn new(manager: ContextWindowManager, capacity: usize, reserved: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            reserved,
            manager,
        }
    }

    pub fn push(&mut self, message: Message) {
        let cost = self.manager.estimator().message_cost(&message);
        self.entries.push(ContextEntry {
            role: message.role,
            content: message.content,
            cost,
        });
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn used(&self) -> usize {
        self.entries.iter().map(|e| e.cost).sum()
    }

    /// Budget usable by entries: `capacity - reserved`.
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.reserved)
    }

    pub fn is_over_budget(&self) -> bool {
        self.used() > self.available()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries
            .iter()
            .map(|e| Message::new(e.role, e.content.clone()))
            .collect()
    }

    /// Prune or summarize entries until they fit. Returns how many entries were dropped.
    pub fn optimize(&mut self, prioritize_recent: bool) -> usize {
        let before = self.entries.len();
        let kept = self
            .manager
            .fit(&self.messages(), self.available(), prioritize_recent);
        self.entries.clear();
        for msg in kept {
            self.push(msg);
        }
        before - self.entries.len()
    }
}
