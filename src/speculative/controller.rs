//! Speculative decoding controller.
//!
//! Wraps one step of the batch executor with a draft model. Every decode
//! entry the scheduler gave a lookahead goes through one round:
//!
//! ```text
//! Propose   draft catches up on tokens it has not cached, then proposes
//!           d_1..d_k one call at a time (all sequences batched per call)
//! Verify    one target call feeds [last, d_1..d_k] and scores k + 1 positions
//! Resolve   rejection sampling keeps a prefix of the drafts plus one token
//! ```
//!
//! Entries without a lookahead (prefill chunks, sequences with speculation
//! turned off) ride along in the same verify call and are sampled as usual.

use std::collections::HashMap;

use candle_core::Tensor;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::sequence::SequenceId;
use crate::engine::batch::{contain, BatchExecutor};
use crate::error::{Error, Result};
use crate::model::{ExecutorBatch, ModelExecutor, SequenceInput};
use crate::scheduler::batch::{Batch, BatchEntry, SequenceOutput};

use super::config::SpeculativeConfig;
use super::sampler::RejectionSampler;

/// Mixed into request seeds for draft sampling.
pub const DRAFT_SEED_SALT: u64 = 0x9e37_79b9_7f4a_7c15;
/// Mixed into request seeds for acceptance draws.
const VERIFY_SEED_SALT: u64 = 0xc2b2_ae3d_27d4_eb4f;

/// Phase of a sequence's speculation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpecPhase {
    Propose,
    Verify,
    Resolve,
}

impl SpecPhase {
    /// Phase that follows this one.
    pub fn next(self) -> Self {
        match self {
            Self::Propose => Self::Verify,
            Self::Verify => Self::Resolve,
            Self::Resolve => Self::Propose,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Propose => "propose",
            Self::Verify => "verify",
            Self::Resolve => "resolve",
        }
    }
}

/// Per-sequence speculation state.
#[derive(Debug)]
struct SpecState {
    phase: SpecPhase,
    rejection: RejectionSampler,
    /// Set after an invariant violation; the scheduler stops asking for
    /// lookahead from then on.
    fallback: bool,
}

impl SpecState {
    fn new(entry: &BatchEntry) -> Self {
        let rejection = match entry.sampling.seed {
            Some(seed) => RejectionSampler::with_seed(
                seed.wrapping_add(entry.sample_index as u64) ^ VERIFY_SEED_SALT,
            ),
            None => RejectionSampler::new(),
        };
        Self {
            phase: SpecPhase::Propose,
            rejection,
            fallback: false,
        }
    }
}

/// Counters over all speculation rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpeculationStats {
    /// Completed verify rounds.
    pub rounds: u64,
    /// Draft tokens sent to verification.
    pub proposed: u64,
    /// Draft tokens accepted.
    pub accepted: u64,
    /// Rounds resolved by the fallback path.
    pub fallbacks: u64,
    /// Steps where the draft executor failed.
    pub draft_failures: u64,
}

impl SpeculationStats {
    /// Fraction of proposed drafts that were accepted.
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }
}

/// Drafts of one sequence in the current round.
#[derive(Debug, Default)]
struct Proposal {
    tokens: Vec<u32>,
    probs: Vec<Vec<f32>>,
}

/// Draft-propose, target-verify controller.
pub struct SpeculativeController {
    draft: BatchExecutor,
    num_speculative_tokens: usize,
    states: HashMap<SequenceId, SpecState>,
    stats: SpeculationStats,
}

impl std::fmt::Debug for SpeculativeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeculativeController")
            .field("num_speculative_tokens", &self.num_speculative_tokens)
            .field("sequences", &self.states.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl SpeculativeController {
    /// Create a controller around a draft executor.
    pub fn new(draft: Box<dyn ModelExecutor>, config: &SpeculativeConfig) -> Self {
        Self {
            draft: BatchExecutor::new(draft).with_seed_salt(DRAFT_SEED_SALT),
            num_speculative_tokens: config.num_speculative_tokens,
            states: HashMap::new(),
            stats: SpeculationStats::default(),
        }
    }

    /// Lookahead `k` per round.
    pub fn num_speculative_tokens(&self) -> usize {
        self.num_speculative_tokens
    }

    pub fn stats(&self) -> SpeculationStats {
        self.stats
    }

    /// Current phase of a sequence, if it ever speculated.
    pub fn phase(&self, seq_id: SequenceId) -> Option<SpecPhase> {
        self.states.get(&seq_id).map(|s| s.phase)
    }

    /// Whether a sequence fell back to plain decoding.
    pub fn is_fallback(&self, seq_id: SequenceId) -> bool {
        self.states.get(&seq_id).is_some_and(|s| s.fallback)
    }

    /// The draft executor.
    pub fn draft(&self) -> &BatchExecutor {
        &self.draft
    }

    /// Forget a finished sequence.
    pub fn release(&mut self, seq_id: SequenceId) {
        self.states.remove(&seq_id);
        self.draft.release(seq_id);
    }

    /// Bring the draft executor back after a fault.
    pub fn recover(&mut self) -> Result<()> {
        self.draft.recover()
    }

    /// Execute one step of `batch`, speculating where the scheduler asked
    /// for a lookahead.
    ///
    /// Errors of the target call are returned as-is. Draft failures only
    /// turn speculation off for this step.
    pub fn execute(&mut self, batch: &Batch, target: &mut BatchExecutor) -> Result<Vec<SequenceOutput>> {
        let speculative: Vec<&BatchEntry> = batch.entries.iter().filter(|e| e.is_speculative()).collect();

        let drafted = if speculative.is_empty() {
            self.sync_draft(batch)
        } else {
            self.propose(batch, &speculative)
        };
        let (proposals, draft_ok) = match drafted {
            Ok(proposals) => (proposals, true),
            Err(err) => {
                warn!(step = batch.step, %err, "draft executor failed, decoding without speculation");
                self.stats.draft_failures += 1;
                if let Err(err) = self.draft.recover() {
                    warn!(%err, "draft executor did not recover");
                }
                for entry in &speculative {
                    if let Some(state) = self.states.get_mut(&entry.seq_id) {
                        state.phase = SpecPhase::Propose;
                    }
                }
                (HashMap::new(), false)
            }
        };

        self.verify(batch, target, proposals, draft_ok)
    }

    /// Mirror the step's page copies into the draft cache when no draft
    /// call carries them.
    fn sync_draft(&mut self, batch: &Batch) -> Result<HashMap<SequenceId, Proposal>> {
        if !batch.copies.is_empty() {
            self.draft.forward(&ExecutorBatch {
                inputs: Vec::new(),
                copies: batch.copies.clone(),
            })?;
        }
        Ok(HashMap::new())
    }

    fn propose(
        &mut self,
        batch: &Batch,
        speculative: &[&BatchEntry],
    ) -> Result<HashMap<SequenceId, Proposal>> {
        for entry in speculative {
            self.transition(entry, SpecPhase::Propose)?;
        }

        let rounds = speculative.iter().map(|e| e.lookahead).max().unwrap_or(0);
        let mut proposals: HashMap<SequenceId, Proposal> = HashMap::new();
        for round in 0..rounds {
            let mut inputs = Vec::new();
            let mut active = Vec::new();
            for &entry in speculative.iter().filter(|e| e.lookahead > round) {
                let input = if round == 0 {
                    SequenceInput::new(
                        entry.seq_id,
                        entry.draft_token_ids.clone(),
                        entry.draft_start,
                        entry.page_table.clone(),
                    )?
                } else {
                    let last = proposals
                        .get(&entry.seq_id)
                        .and_then(|p| p.tokens.last().copied())
                        .ok_or(Error::SequenceNotFound(entry.seq_id))?;
                    SequenceInput::new(
                        entry.seq_id,
                        vec![last],
                        entry.context_len + round - 1,
                        entry.page_table.clone(),
                    )?
                };
                inputs.push(input);
                active.push(entry);
            }

            let copies = if round == 0 { batch.copies.clone() } else { Vec::new() };
            let output = self.draft.forward(&ExecutorBatch { inputs, copies })?;
            for (entry, logits) in active.into_iter().zip(&output.logits) {
                let last = logits.get(logits.dim(0)? - 1)?;
                let sampler = self.draft.sampler(entry);
                let probs = sampler.distribution(&last)?;
                let token = sampler.sample_from(&probs)?;
                let proposal = proposals.entry(entry.seq_id).or_default();
                proposal.tokens.push(token);
                proposal.probs.push(probs);
            }
        }

        for entry in speculative {
            self.transition(entry, SpecPhase::Verify)?;
        }
        Ok(proposals)
    }

    fn verify(
        &mut self,
        batch: &Batch,
        target: &mut BatchExecutor,
        mut proposals: HashMap<SequenceId, Proposal>,
        draft_ok: bool,
    ) -> Result<Vec<SequenceOutput>> {
        let inputs = batch
            .entries
            .iter()
            .map(|entry| {
                let mut tokens = entry.token_ids.clone();
                if let Some(proposal) = proposals.get(&entry.seq_id) {
                    tokens.extend_from_slice(&proposal.tokens);
                }
                SequenceInput::new(entry.seq_id, tokens, entry.start, entry.page_table.clone())
            })
            .collect::<Result<Vec<_>>>()?;
        let output = target.forward(&ExecutorBatch {
            inputs,
            copies: batch.copies.clone(),
        })?;

        let mut outputs = Vec::with_capacity(batch.len());
        for (entry, logits) in batch.entries.iter().zip(&output.logits) {
            let result = match proposals.remove(&entry.seq_id) {
                Some(proposal) => self.resolve(entry, proposal, logits, target),
                None => {
                    let draft_cached = if draft_ok { entry.draft_start } else { 0 };
                    target.plain_output(entry, logits, draft_cached)
                }
            };
            outputs.push(contain(entry, result));
        }
        Ok(outputs)
    }

    fn resolve(
        &mut self,
        entry: &BatchEntry,
        proposal: Proposal,
        logits: &Tensor,
        target: &mut BatchExecutor,
    ) -> Result<SequenceOutput> {
        self.transition(entry, SpecPhase::Resolve)?;
        // Row 0 is the plain decode position; it must be usable either way.
        let sampler = target.sampler(entry);
        let mut target_probs = vec![sampler.distribution(&logits.get(0)?)?];
        let mut broken_row = None;
        for row in 1..logits.dim(0)? {
            match sampler.distribution(&logits.get(row)?) {
                Ok(probs) => target_probs.push(probs),
                Err(err) => {
                    broken_row = Some(format!("target row {row}: {err}"));
                    break;
                }
            }
        }
        let len = entry.context_len;
        let k = proposal.tokens.len();
        self.stats.rounds += 1;
        self.stats.proposed += k as u64;

        let state = self
            .states
            .get_mut(&entry.seq_id)
            .ok_or(Error::SequenceNotFound(entry.seq_id))?;
        let verdict = match broken_row {
            Some(reason) => Err(Error::SpeculationInvariantViolation(reason)),
            None => state
                .rejection
                .verify(&proposal.tokens, &proposal.probs, &target_probs),
        };
        match verdict {
            Ok(outcome) => {
                let accepted = outcome.num_accepted();
                self.stats.accepted += accepted as u64;
                debug!(seq_id = entry.seq_id, proposed = k, accepted, "speculation round");
                Ok(SequenceOutput {
                    seq_id: entry.seq_id,
                    new_tokens: outcome.tokens(),
                    num_cached: len + accepted,
                    num_draft_cached: (len + k - 1).min(len + accepted),
                    proposed: k,
                    accepted,
                    ..Default::default()
                })
            }
            Err(Error::SpeculationInvariantViolation(reason)) => {
                warn!(seq_id = entry.seq_id, %reason, "speculation invariant violated, falling back");
                state.fallback = true;
                self.stats.fallbacks += 1;
                let first = target_probs
                    .first()
                    .ok_or_else(|| Error::SpeculationInvariantViolation("no target rows".to_string()))?;
                let token = target.sampler(entry).sample_from(first)?;
                Ok(SequenceOutput {
                    seq_id: entry.seq_id,
                    new_tokens: vec![token],
                    num_cached: len,
                    num_draft_cached: len,
                    proposed: k,
                    speculation_fallback: true,
                    ..Default::default()
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Move a sequence to `to`. A new round may start from any phase, since
    /// a failed step leaves its round unfinished.
    fn transition(&mut self, entry: &BatchEntry, to: SpecPhase) -> Result<()> {
        let state = self
            .states
            .entry(entry.seq_id)
            .or_insert_with(|| SpecState::new(entry));
        if to != SpecPhase::Propose && state.phase.next() != to {
            return Err(Error::InvalidStateTransition {
                from: state.phase.as_str(),
                to: to.as_str(),
            });
        }
        state.phase = to;
        Ok(())
    }
}
