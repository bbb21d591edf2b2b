//! Speculative decoding configuration.

use serde::{Deserialize, Serialize};

use crate::config::{Architecture, ModelConfig};

/// Configuration for speculative decoding.
///
/// A cheap draft model proposes K tokens per round; the target model scores
/// all of them in one batched call and rejection sampling decides how many
/// survive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculativeConfig {
    /// Number of tokens to speculate per round (K).
    /// Higher values pay off when the draft agrees with the target often,
    /// and waste target compute otherwise.
    pub num_speculative_tokens: usize,

    /// Draft model executor. Must share the target vocabulary.
    pub draft_model: ModelConfig,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            num_speculative_tokens: 4,
            draft_model: ModelConfig::new(Architecture::Uniform, ModelConfig::default().vocab_size),
        }
    }
}

impl SpeculativeConfig {
    /// Create a new speculative config with the given draft model.
    pub fn new(draft_model: ModelConfig) -> Self {
        Self {
            draft_model,
            ..Default::default()
        }
    }

    /// Set the number of speculative tokens.
    pub fn num_tokens(mut self, k: usize) -> Self {
        self.num_speculative_tokens = k;
        self
    }
}
