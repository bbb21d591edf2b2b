//! Configuration types for nano-serve.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::speculative::SpeculativeConfig;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Paged KV cache pool.
    pub cache: CacheConfig,
    /// Admission and batch selection.
    pub scheduler: SchedulerConfig,
    /// Target model executor.
    pub model: ModelConfig,
    /// Shard layout of the target model.
    pub parallel: ParallelConfig,
    /// Draft model and lookahead. `None` disables speculative decoding.
    pub speculative: Option<SpeculativeConfig>,
}

impl EngineConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the cache geometry.
    pub fn cache(mut self, page_size: usize, num_pages: usize) -> Self {
        self.cache = CacheConfig {
            page_size,
            num_pages,
        };
        self
    }

    /// Enable speculative decoding.
    pub fn speculative(mut self, speculative: SpeculativeConfig) -> Self {
        self.speculative = Some(speculative);
        self
    }

    /// Set the tensor parallel degree.
    pub fn tensor_parallel(mut self, size: usize) -> Self {
        self.parallel.tensor_parallel_size = size;
        self
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.cache.page_size == 0 || self.cache.num_pages == 0 {
            return Err(Error::Config(
                "page_size and num_pages must be positive".to_string(),
            ));
        }
        let s = &self.scheduler;
        if s.max_num_seqs == 0 || s.max_num_batched_tokens == 0 || s.max_queued_requests == 0 {
            return Err(Error::Config(
                "scheduler limits must be positive".to_string(),
            ));
        }
        if s.enable_chunked_prefill && s.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".to_string()));
        }
        self.model.validate()?;

        let tp = self.parallel.tensor_parallel_size;
        if tp == 0 {
            return Err(Error::Config(
                "tensor_parallel_size must be at least 1".to_string(),
            ));
        }
        if tp > 1 {
            if self.model.architecture != Architecture::Mlp {
                return Err(Error::Config(format!(
                    "architecture {:?} cannot be sharded",
                    self.model.architecture
                )));
            }
            if self.model.hidden_size % tp != 0 {
                return Err(Error::Config(format!(
                    "hidden_size {} is not divisible by tensor_parallel_size {tp}",
                    self.model.hidden_size
                )));
            }
        }

        if let Some(spec) = &self.speculative {
            if spec.num_speculative_tokens == 0 {
                return Err(Error::Config(
                    "num_speculative_tokens must be at least 1".to_string(),
                ));
            }
            spec.draft_model.validate()?;
            if spec.draft_model.vocab_size != self.model.vocab_size {
                return Err(Error::Config(format!(
                    "draft vocab {} differs from target vocab {}",
                    spec.draft_model.vocab_size, self.model.vocab_size
                )));
            }
        }
        Ok(())
    }
}

/// Paged KV cache pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Tokens per page.
    pub page_size: usize,
    /// Pages in the pool.
    pub num_pages: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: 16,
            num_pages: 1024,
        }
    }
}

/// What happens to a sequence evicted under page pressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreemptionMode {
    /// Finish the request with an error and a preemption notice.
    #[default]
    Abort,
    /// Drop the pages, keep the tokens, recompute on readmission.
    Suspend,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of sequences in one step.
    pub max_num_seqs: usize,
    /// Token budget of one step (prefill chunks, decodes and lookahead).
    pub max_num_batched_tokens: usize,
    /// Requests accepted but not yet admitted before `accept` refuses.
    pub max_queued_requests: usize,
    /// Longest prompt plus output a request may ask for.
    pub max_model_len: usize,
    /// Split long prompts across steps.
    pub enable_chunked_prefill: bool,
    /// Prefill chunk size when chunked prefill is enabled.
    pub chunk_size: usize,
    /// Evict lower-priority sequences when pages run out.
    pub enable_preemption: bool,
    /// How evicted sequences are treated.
    pub preemption_mode: PreemptionMode,
    /// Suspensions a request survives before it is aborted.
    pub max_suspensions: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 256,
            max_num_batched_tokens: 4096,
            max_queued_requests: 1024,
            max_model_len: 4096,
            enable_chunked_prefill: true,
            chunk_size: 512,
            enable_preemption: true,
            preemption_mode: PreemptionMode::Abort,
            max_suspensions: 3,
        }
    }
}

/// Per-request sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Maximum tokens to generate per sample.
    pub max_tokens: usize,
    /// Generation stops after emitting any of these tokens.
    pub stop_token_ids: Vec<u32>,
    /// Seed for reproducible sampling. Sample `i` uses `seed + i`.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            max_tokens: 256,
            stop_token_ids: Vec::new(),
            seed: None,
        }
    }
}

impl SamplingConfig {
    /// Greedy decoding for `max_tokens` tokens.
    pub fn greedy(max_tokens: usize) -> Self {
        Self {
            temperature: 0.0,
            max_tokens,
            ..Default::default()
        }
    }

    /// Set the seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Add a stop token.
    pub fn stop_token(mut self, token: u32) -> Self {
        self.stop_token_ids.push(token);
        self
    }

    /// Reject parameters no sampler can turn into a distribution.
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::InvalidRequest(format!(
                "temperature must be finite and non-negative, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::InvalidRequest(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

/// Toy model architectures shipped with the crate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// Constant logits.
    Uniform,
    /// Seeded random transition table on the current token.
    #[default]
    Bigram,
    /// Strongly predicts `token + 1 (mod vocab)`.
    Successor,
    /// Two-layer perceptron over the current and previous token embeddings.
    Mlp,
}

/// Model executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Which architecture to build.
    pub architecture: Architecture,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension (`Mlp` only).
    pub hidden_size: usize,
    /// Logit scale; higher values make the model more confident.
    pub sharpness: f32,
    /// Weight initialization seed.
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::Bigram,
            vocab_size: 64,
            hidden_size: 32,
            sharpness: 1.0,
            seed: 0,
        }
    }
}

impl ModelConfig {
    /// Config for the given architecture with default sizes.
    pub fn new(architecture: Architecture, vocab_size: usize) -> Self {
        Self {
            architecture,
            vocab_size,
            ..Default::default()
        }
    }

    /// Set the weight seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the logit scale.
    pub fn sharpness(mut self, sharpness: f32) -> Self {
        self.sharpness = sharpness;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.vocab_size < 2 {
            return Err(Error::Config("vocab_size must be at least 2".to_string()));
        }
        if self.architecture == Architecture::Mlp && self.hidden_size == 0 {
            return Err(Error::Config("hidden_size must be positive".to_string()));
        }
        if !self.sharpness.is_finite() {
            return Err(Error::Config("sharpness must be finite".to_string()));
        }
        Ok(())
    }
}

/// Tensor parallel layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Number of shards (1 = single device).
    pub tensor_parallel_size: usize,
    /// Longest a collective barrier waits for a shard.
    pub collective_timeout_ms: u64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            tensor_parallel_size: 1,
            collective_timeout_ms: 5_000,
        }
    }
}

impl ParallelConfig {
    /// Barrier timeout as a duration.
    pub fn collective_timeout(&self) -> Duration {
        Duration::from_millis(self.collective_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_sharding_requires_mlp() {
        let config = EngineConfig::default().tensor_parallel(2);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = EngineConfig::default().tensor_parallel(2);
        config.model.architecture = Architecture::Mlp;
        config.validate().unwrap();

        config.model.hidden_size = 33;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_draft_vocab_must_match() {
        let draft = ModelConfig::new(Architecture::Uniform, 7);
        let config = EngineConfig::default().speculative(SpeculativeConfig::new(draft));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_defaults_fill_missing_fields() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"cache": {"page_size": 4}, "scheduler": {"preemption_mode": "suspend"}}"#,
        )
        .unwrap();
        assert_eq!(config.cache.page_size, 4);
        assert_eq!(config.cache.num_pages, 1024);
        assert_eq!(config.scheduler.preemption_mode, PreemptionMode::Suspend);
        assert!(config.speculative.is_none());
    }
}
