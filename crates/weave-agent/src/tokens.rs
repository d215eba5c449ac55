use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;
use tracing::warn;

use weave_core::types::Message;

/// Fixed cost added per message for role and framing.
pub const MESSAGE_OVERHEAD: usize = 4;

/// Estimates the budget cost of a piece of text.
///
/// Implementations must be deterministic and monotonic in text length so
/// budget comparisons stay meaningful.
pub trait TokenEstimator: Send + Sync + 'static {
    fn estimate(&self, text: &str) -> usize;

    /// Cost of a whole message: content plus framing overhead.
    fn message_cost(&self, msg: &Message) -> usize {
        self.estimate(&msg.content) + MESSAGE_OVERHEAD
    }
}

/// Character-ratio estimate: `ceil(chars / chars_per_token)`.
#[derive(Debug, Clone, Copy)]
pub struct CharEstimator {
    chars_per_token: usize,
}

impl CharEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

/// Get or initialize the cl100k_base tokenizer. `None` if it cannot be loaded.
fn tokenizer() -> Option<&'static CoreBPE> {
    static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    TOKENIZER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!(error = %e, "Failed to load cl100k_base tokenizer, using char estimate");
                None
            }
        })
        .as_ref()
}

/// BPE token count (cl100k_base).
///
/// Accurate for reporting, but BPE counts are not strictly monotonic in
/// length, so budget decisions use [`CharEstimator`] by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct BpeEstimator;

impl TokenEstimator for BpeEstimator {
    fn estimate(&self, text: &str) -> usize {
        match tokenizer() {
            Some(bpe) => bpe.encode_ordinary(text).len(),
            None => CharEstimator::default().estimate(text),
        }
    }
}
