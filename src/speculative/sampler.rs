//! Rejection sampling for speculative decoding.
//!
//! Given `k` drafted tokens with their draft distributions `q_1..q_k` and the
//! target distributions `p_1..p_{k+1}` over the same positions, the sampler
//! decides how many drafts survive and which token closes the round:
//!
//! ```text
//! for i in 1..=k:
//!     u ~ U(0, 1)
//!     if u < min(1, p_i(x_i) / q_i(x_i)):  accept x_i
//!     else:                               emit x ~ norm(max(0, p_i - q_i)), stop
//! all accepted:                           emit bonus x ~ p_{k+1}
//! ```
//!
//! The emitted tokens are distributed exactly as if they had been sampled
//! from `p` one at a time. When both distributions are one-hot (greedy
//! decoding) this degenerates to exact-match acceptance.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

/// Result of verifying one round of drafts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectionOutcome {
    /// Accepted draft tokens, a prefix of the proposal.
    pub accepted: Vec<u32>,
    /// Resampled token on rejection, bonus token on full acceptance.
    pub final_token: u32,
}

impl RejectionOutcome {
    /// Number of accepted drafts.
    pub fn num_accepted(&self) -> usize {
        self.accepted.len()
    }

    /// Tokens to append: the accepted prefix followed by the final token.
    pub fn tokens(&self) -> Vec<u32> {
        let mut tokens = self.accepted.clone();
        tokens.push(self.final_token);
        tokens
    }
}

/// Rejection sampler for speculative decoding.
#[derive(Debug, Clone)]
pub struct RejectionSampler {
    rng: StdRng,
}

impl Default for RejectionSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl RejectionSampler {
    /// Create a sampler seeded from the OS.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a sampler with a fixed seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Verify drafted tokens against the target distributions.
    ///
    /// # Arguments
    ///
    /// * `draft_tokens` - The `k` drafted tokens
    /// * `draft_probs` - Draft distribution of every drafted position, `k` rows
    /// * `target_probs` - Target distribution of every drafted position plus
    ///   the bonus position, `k + 1` rows
    ///
    /// # Errors
    ///
    /// [`Error::SpeculationInvariantViolation`] when the inputs break the
    /// preconditions of rejection sampling: mismatched shapes, values that
    /// are not finite probabilities, a drafted token the draft gave zero
    /// probability, or an empty residual distribution.
    pub fn verify(
        &mut self,
        draft_tokens: &[u32],
        draft_probs: &[Vec<f32>],
        target_probs: &[Vec<f32>],
    ) -> Result<RejectionOutcome> {
        let k = draft_tokens.len();
        if draft_probs.len() != k || target_probs.len() != k + 1 {
            return Err(violation(format!(
                "expected {k} draft and {} target rows, got {} and {}",
                k + 1,
                draft_probs.len(),
                target_probs.len()
            )));
        }
        let vocab_size = target_probs[0].len();
        for row in draft_probs.iter().chain(target_probs) {
            check_distribution(row, vocab_size)?;
        }

        let mut accepted = Vec::with_capacity(k);
        for (i, &token) in draft_tokens.iter().enumerate() {
            let index = token as usize;
            if index >= vocab_size {
                return Err(violation(format!(
                    "drafted token {token} outside vocabulary of {vocab_size}"
                )));
            }
            let q = draft_probs[i][index];
            if q <= 0.0 {
                return Err(violation(format!(
                    "drafted token {token} has zero draft probability at position {i}"
                )));
            }
            let p = target_probs[i][index];

            let u: f32 = self.rng.gen();
            if u < (p / q).min(1.0) {
                accepted.push(token);
                continue;
            }

            let residual: Vec<f32> = target_probs[i]
                .iter()
                .zip(&draft_probs[i])
                .map(|(p, q)| (p - q).max(0.0))
                .collect();
            let final_token = self.draw(&residual).map_err(|_| {
                violation(format!("empty residual distribution at position {i}"))
            })?;
            return Ok(RejectionOutcome {
                accepted,
                final_token,
            });
        }

        let final_token = self.draw(&target_probs[k])?;
        Ok(RejectionOutcome {
            accepted,
            final_token,
        })
    }

    fn draw(&mut self, weights: &[f32]) -> Result<u32> {
        let dist = WeightedIndex::new(weights)
            .map_err(|e| violation(format!("cannot sample distribution: {e}")))?;
        Ok(dist.sample(&mut self.rng) as u32)
    }
}

fn violation(message: String) -> Error {
    Error::SpeculationInvariantViolation(message)
}

fn check_distribution(row: &[f32], vocab_size: usize) -> Result<()> {
    if row.len() != vocab_size {
        return Err(violation(format!(
            "distribution over {} tokens, expected {vocab_size}",
            row.len()
        )));
    }
    if row.iter().any(|p| !p.is_finite() || *p < 0.0) {
        return Err(violation("distribution has invalid probabilities".to_string()));
    }
    if row.iter().sum::<f32>() <= 0.0 {
        return Err(violation("distribution has no mass".to_string()));
    }
    Ok(())
}
