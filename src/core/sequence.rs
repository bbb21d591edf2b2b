//! Sequence tracking for inference requests.
//!
//! A sequence is one sample of a request: the token history it grows, how
//! much of that history is already in the KV cache, and where it is in its
//! lifecycle. Its pages live in the
//! [`PageAllocator`](crate::core::allocator::PageAllocator), keyed by id.

use serde::{Deserialize, Serialize};

use crate::core::request::{FinishReason, RequestId};
use crate::error::{Error, Result};

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Priority level for scheduling.
///
/// Higher values mean higher priority.
pub type Priority = i32;

/// Default priority for new sequences.
pub const DEFAULT_PRIORITY: Priority = 0;

/// Status of a sequence in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceStatus {
    /// Waiting in queue to be scheduled. Holds no pages.
    Waiting,
    /// Holds pages and is advanced by the engine.
    Running,
    /// Evicted under page pressure; pages dropped, tokens kept.
    Suspended,
    /// Finished; pages released.
    Finished,
}

impl SequenceStatus {
    /// Check if the sequence is active (not finished).
    pub fn is_active(&self) -> bool {
        !self.is_finished()
    }

    /// Check if the sequence is finished.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Suspended => "Suspended",
            Self::Finished => "Finished",
        }
    }
}

/// A single sample being generated.
///
/// # Example
///
/// ```
/// use nano_serve::core::sequence::{Sequence, SequenceStatus};
///
/// let mut seq = Sequence::new(1, 7, vec![1, 2, 3, 4]);
/// assert_eq!(seq.status(), SequenceStatus::Waiting);
/// assert_eq!(seq.num_uncached(), 4);
///
/// seq.mark_cached(4);
/// seq.append_token(5);
/// assert_eq!(seq.output_len(), 1);
/// assert_eq!(seq.num_uncached(), 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    seq_id: SequenceId,
    request_id: RequestId,
    /// Index of this sample within its request.
    sample_index: usize,
    /// Sequence this one was forked from.
    parent: Option<SequenceId>,
    prompt_len: usize,
    /// Prompt followed by generated tokens.
    token_ids: Vec<u32>,
    /// Leading positions whose KV is in the target cache.
    num_cached: usize,
    /// Leading positions whose KV is in the draft cache.
    num_draft_cached: usize,
    status: SequenceStatus,
    priority: Priority,
    /// Admission order for FIFO ordering within the same priority.
    arrival_order: u64,
    /// Last engine step that advanced this sequence.
    last_advanced_step: u64,
    num_suspensions: usize,
    /// Cleared after a speculation invariant violation.
    speculation_enabled: bool,
    finish_reason: Option<FinishReason>,
}

impl Sequence {
    /// Create a new sequence with the given prompt tokens.
    pub fn new(seq_id: SequenceId, request_id: RequestId, prompt_token_ids: Vec<u32>) -> Self {
        Self {
            seq_id,
            request_id,
            sample_index: 0,
            parent: None,
            prompt_len: prompt_token_ids.len(),
            token_ids: prompt_token_ids,
            num_cached: 0,
            num_draft_cached: 0,
            status: SequenceStatus::Waiting,
            priority: DEFAULT_PRIORITY,
            arrival_order: 0,
            last_advanced_step: 0,
            num_suspensions: 0,
            speculation_enabled: true,
            finish_reason: None,
        }
    }

    /// Set priority and arrival order.
    pub fn with_order(mut self, priority: Priority, arrival_order: u64) -> Self {
        self.priority = priority;
        self.arrival_order = arrival_order;
        self
    }

    /// A running copy of this sequence sharing its history and cache state.
    ///
    /// The caller is responsible for forking the page table.
    pub fn fork(&self, child_id: SequenceId, sample_index: usize) -> Self {
        Self {
            seq_id: child_id,
            sample_index,
            parent: Some(self.seq_id),
            ..self.clone()
        }
    }

    // ========== Getters ==========

    /// Get the sequence ID.
    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    /// Get the owning request.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Index of this sample within its request.
    pub fn sample_index(&self) -> usize {
        self.sample_index
    }

    /// Sequence this one was forked from.
    pub fn parent(&self) -> Option<SequenceId> {
        self.parent
    }

    /// Prompt followed by generated tokens.
    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    /// Get the prompt token IDs.
    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.token_ids[..self.prompt_len]
    }

    /// Get the output token IDs.
    pub fn output_token_ids(&self) -> &[u32] {
        &self.token_ids[self.prompt_len..]
    }

    /// Get the current status.
    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    /// Get the priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Get the arrival order.
    pub fn arrival_order(&self) -> u64 {
        self.arrival_order
    }

    /// Last engine step that advanced this sequence.
    pub fn last_advanced_step(&self) -> u64 {
        self.last_advanced_step
    }

    /// Times this sequence was suspended.
    pub fn num_suspensions(&self) -> usize {
        self.num_suspensions
    }

    /// Whether the sequence may still speculate.
    pub fn speculation_enabled(&self) -> bool {
        self.speculation_enabled
    }

    /// Get the finish reason (if finished).
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    // ========== Length queries ==========

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    /// Get the output length.
    pub fn output_len(&self) -> usize {
        self.token_ids.len() - self.prompt_len
    }

    /// Get the total length (prompt + output).
    pub fn total_len(&self) -> usize {
        self.token_ids.len()
    }

    /// Positions cached in the target cache.
    pub fn num_cached(&self) -> usize {
        self.num_cached
    }

    /// Positions cached in the draft cache.
    pub fn num_draft_cached(&self) -> usize {
        self.num_draft_cached
    }

    /// Tokens the target has not processed yet.
    pub fn num_uncached(&self) -> usize {
        self.total_len() - self.num_cached
    }

    /// More than one token awaits the target: the prompt or a recompute.
    pub fn is_prefill(&self) -> bool {
        self.num_uncached() > 1
    }

    /// Get the last token ID.
    pub fn last_token_id(&self) -> Option<u32> {
        self.token_ids.last().copied()
    }

    // ========== Token operations ==========

    /// Append a generated token.
    pub fn append_token(&mut self, token_id: u32) {
        self.token_ids.push(token_id);
    }

    /// Record that the first `num_tokens` positions are in the target cache.
    pub fn mark_cached(&mut self, num_tokens: usize) {
        self.num_cached = num_tokens.min(self.total_len());
    }

    /// Record that the first `num_tokens` positions are in the draft cache.
    pub fn mark_draft_cached(&mut self, num_tokens: usize) {
        self.num_draft_cached = num_tokens.min(self.total_len());
    }

    /// Record progress made in `step`.
    pub fn mark_advanced(&mut self, step: u64) {
        self.last_advanced_step = step;
    }

    /// Stop speculating for the rest of this sequence's life.
    pub fn disable_speculation(&mut self) {
        self.speculation_enabled = false;
    }

    // ========== State transitions ==========

    /// Transition to running state.
    ///
    /// # Errors
    ///
    /// Returns error if current state doesn't allow this transition.
    pub fn set_running(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Waiting | SequenceStatus::Suspended => {
                self.status = SequenceStatus::Running;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Running",
            }),
        }
    }

    /// Transition to suspended state, forgetting all cached positions.
    ///
    /// # Errors
    ///
    /// Returns error if current state doesn't allow this transition.
    pub fn set_suspended(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Suspended;
                self.num_cached = 0;
                self.num_draft_cached = 0;
                self.num_suspensions += 1;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Suspended",
            }),
        }
    }

    /// Mark the sequence as finished.
    pub fn set_finished(&mut self, reason: FinishReason) {
        self.status = SequenceStatus::Finished;
        self.finish_reason = Some(reason);
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.seq_id == other.seq_id
    }
}

impl Eq for Sequence {}
