//! Token sampling strategies.
//!
//! This module turns logits into the *processed distribution* a token is
//! drawn from:
//!
//! - **Temperature**: Controls randomness (0 = greedy, a one-hot argmax)
//! - **Top-k**: Limits choices to k most likely tokens
//! - **Top-p (nucleus)**: Limits choices to tokens covering p probability mass
//!
//! Speculative decoding compares draft and target models on exactly these
//! processed distributions, so they are exposed as full-vocabulary vectors.
//!
//! ## Sampling Pipeline
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Temperature scaling
//! Logits / temperature
//!     │
//!     ▼ Top-k filtering (optional)
//! Keep top k tokens
//!     │
//!     ▼ Softmax
//! Probabilities
//!     │
//!     ▼ Top-p filtering (optional)
//! Cumulative prob ≤ p
//!     │
//!     ▼ Renormalize
//! Processed distribution [vocab_size] ──► Sample
//! ```

use candle_core::{Device, Tensor, D};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingConfig;
use crate::error::{Error, Result};

/// Token sampler with configurable sampling strategies.
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Temperature for scaling logits.
    temperature: f32,
    /// Top-k value (0 = disabled).
    top_k: usize,
    /// Top-p value (1.0 = disabled).
    top_p: f32,
    /// Random number generator.
    rng: StdRng,
}

impl Sampler {
    /// Creates a new sampler, seeded from `config.seed` when present.
    pub fn new(config: &SamplingConfig) -> Self {
        match config.seed {
            Some(seed) => Self::with_seed(config, seed),
            None => Self::from_rng(config, StdRng::from_entropy()),
        }
    }

    /// Creates a new sampler with a specific seed for reproducibility.
    pub fn with_seed(config: &SamplingConfig, seed: u64) -> Self {
        Self::from_rng(config, StdRng::seed_from_u64(seed))
    }

    /// Sampler for sample `index` of a request: seeded with `seed + index`.
    pub fn for_sample(config: &SamplingConfig, index: usize) -> Self {
        match config.seed {
            Some(seed) => Self::with_seed(config, seed.wrapping_add(index as u64)),
            None => Self::new(config),
        }
    }

    fn from_rng(config: &SamplingConfig, rng: StdRng) -> Self {
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng,
        }
    }

    /// Whether this sampler always picks the argmax.
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Processed distribution of 1D logits, over the full vocabulary.
    pub fn distribution(&self, logits: &Tensor) -> Result<Vec<f32>> {
        let values: Vec<f32> = logits.to_vec1()?;
        self.process(&values, logits.device())
    }

    /// Processed distribution of every row of 2D logits.
    pub fn distributions(&self, logits: &Tensor) -> Result<Vec<Vec<f32>>> {
        let rows: Vec<Vec<f32>> = logits.to_vec2()?;
        rows.iter()
            .map(|row| self.process(row, logits.device()))
            .collect()
    }

    /// Sample a token from logits.
    ///
    /// # Arguments
    ///
    /// * `logits` - Raw logits from the model [vocab_size] or [batch, vocab_size]
    ///
    /// # Returns
    ///
    /// Sampled token ID(s)
    pub fn sample(&mut self, logits: &Tensor) -> Result<Vec<u32>> {
        match logits.rank() {
            1 => {
                let probs = self.distribution(logits)?;
                Ok(vec![self.sample_from(&probs)?])
            }
            2 => {
                let probs = self.distributions(logits)?;
                probs.iter().map(|p| self.sample_from(p)).collect()
            }
            rank => Err(Error::Tensor(candle_core::Error::Msg(format!(
                "Expected 1D or 2D logits, got {rank}D"
            )))),
        }
    }

    /// Draw a token from a processed distribution using the stored RNG.
    pub fn sample_from(&mut self, probs: &[f32]) -> Result<u32> {
        let dist = WeightedIndex::new(probs).map_err(|e| {
            Error::Tensor(candle_core::Error::Msg(format!(
                "Failed to create distribution: {e}"
            )))
        })?;
        Ok(dist.sample(&mut self.rng) as u32)
    }

    fn process(&self, logits: &[f32], device: &Device) -> Result<Vec<f32>> {
        let vocab_size = logits.len();
        if logits.iter().all(|v| !v.is_finite()) {
            return Err(Error::Tensor(candle_core::Error::Msg(
                "logits contain no finite value".to_string(),
            )));
        }

        // For temperature = 0, use greedy decoding (argmax)
        if self.is_greedy() {
            let mut probs = vec![0.0; vocab_size];
            probs[argmax(logits)] = 1.0;
            return Ok(probs);
        }

        // Apply temperature, then top-k filtering
        let mut scaled: Vec<f32> = logits.iter().map(|v| v / self.temperature).collect();
        if self.top_k > 0 && self.top_k < vocab_size {
            let mut order: Vec<usize> = (0..vocab_size).collect();
            order.sort_by(|&a, &b| scaled[b].total_cmp(&scaled[a]));
            for &index in &order[self.top_k..] {
                scaled[index] = f32::NEG_INFINITY;
            }
        }

        // Compute probabilities with softmax
        let scaled = Tensor::from_vec(scaled, vocab_size, device)?;
        let mut probs: Vec<f32> = candle_nn::ops::softmax(&scaled, D::Minus1)?.to_vec1()?;

        // Apply top-p filtering: keep tokens until cumulative probability exceeds p
        if self.top_p > 0.0 && self.top_p < 1.0 {
            let mut order: Vec<usize> = (0..vocab_size).collect();
            order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
            let mut cumulative = 0.0f32;
            let mut cutoff = vocab_size;
            for (i, &index) in order.iter().enumerate() {
                cumulative += probs[index];
                if cumulative > self.top_p {
                    cutoff = i + 1;
                    break;
                }
            }
            for &index in &order[cutoff..] {
                probs[index] = 0.0;
            }
        }

        // Renormalize
        let sum: f32 = probs.iter().sum();
        if sum <= 0.0 || !sum.is_finite() {
            return Err(Error::Tensor(candle_core::Error::Msg(
                "processed distribution has no mass".to_string(),
            )));
        }
        probs.iter_mut().for_each(|p| *p /= sum);
        Ok(probs)
    }

    /// Set temperature.
    pub fn set_temperature(&mut self, temperature: f32) {
        self.temperature = temperature;
    }

    /// Set top-k.
    pub fn set_top_k(&mut self, top_k: usize) {
        self.top_k = top_k;
    }

    /// Set top-p.
    pub fn set_top_p(&mut self, top_p: f32) {
        self.top_p = top_p;
    }
}

/// Index of the largest finite value; ties go to the lowest index.
fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] || (!values[best].is_finite() && v.is_finite()) {
            best = i;
        }
    }
    best
}
