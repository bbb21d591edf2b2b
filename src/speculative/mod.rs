//! Speculative decoding.
//!
//! This module implements draft-verify speculative decoding
//! on top of the continuous batch executor.
//!
//! ## How it works
//!
//! 1. **Propose**: A cheap draft executor catches up on the tokens its cache
//!    lacks and proposes K tokens, one batched call per token.
//!
//! 2. **Verify**: The target executor scores all K+1 positions of every
//!    speculating sequence in the step's single batched call.
//!
//! 3. **Resolve**: Each draft token is accepted or rejected based on the
//!    probability ratio between target and draft distributions.
//!
//! ## Example
//!
//! ```text
//! Draft (K=4):     [context] -> t1 -> t2 -> t3 -> t4
//! Target verify:   [last, t1, t2, t3, t4] -> logits for all 5 positions
//! Rejection:       Accept t1, t2, reject t3, resample -> final: t1, t2, t3'
//! ```
//!
//! ## Configuration
//!
//! - Draft model: any [`crate::config::Architecture`] sharing the target vocabulary
//! - K (num_speculative_tokens): 4 (typical range: 2-8), capped per round by
//!   the tokens a sequence may still emit

pub mod config;
pub mod controller;
pub mod sampler;

pub use config::SpeculativeConfig;
pub use controller::{SpecPhase, SpeculationStats, SpeculativeController};
pub use sampler::{RejectionOutcome, RejectionSampler};
