//! Model executor boundary.
//!
//! The serving core never looks inside a model. It hands a
//! [`ModelExecutor`] one batch per call: token ids, positions and the page
//! tables that say where each position's key/value state lives. The executor
//! answers with logits and the cache slots it wrote.
//!
//! This module contains:
//! - The executor capability and its batch/output types
//! - Toy executors for tests and demos
//! - A configuration-driven factory over the closed set of architectures

pub mod slots;
pub mod toy;

use candle_core::Tensor;

use crate::config::{CacheConfig, ModelConfig, ParallelConfig};
use crate::core::page::{PageCopy, PageTable};
use crate::core::sequence::SequenceId;
use crate::error::{Error, Result};
use crate::parallel::TensorParallelExecutor;

pub use slots::PagedSlotStore;
pub use toy::{MlpWeights, ToyExecutor};

/// Geometry of the cache an executor was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheShape {
    /// Tokens per page.
    pub page_size: usize,
    /// Pages the executor can address.
    pub num_pages: usize,
    /// Values stored per slot.
    pub slot_width: usize,
}

impl CacheShape {
    /// Whether a pool with this configuration fits the executor's cache.
    pub fn fits(&self, cache: &CacheConfig) -> bool {
        self.page_size == cache.page_size && self.num_pages >= cache.num_pages
    }
}

/// One sequence's share of an executor call.
#[derive(Debug, Clone)]
pub struct SequenceInput {
    pub seq_id: SequenceId,
    /// Tokens to feed, at consecutive positions.
    pub token_ids: Vec<u32>,
    pub positions: Vec<usize>,
    pub page_table: PageTable,
    /// Physical cache slot of every fed token.
    pub slot_mapping: Vec<usize>,
    /// Positions visible after this call (last position + 1).
    pub context_len: usize,
}

impl SequenceInput {
    /// Build an input feeding `token_ids` from position `start`.
    ///
    /// Fails if the page table does not cover every fed position.
    pub fn new(
        seq_id: SequenceId,
        token_ids: Vec<u32>,
        start: usize,
        page_table: PageTable,
    ) -> Result<Self> {
        let slot_mapping = page_table
            .slot_mapping(start, token_ids.len())
            .ok_or_else(|| {
                Error::ExecutorFault(format!(
                    "sequence {seq_id} has no page for positions {start}..{}",
                    start + token_ids.len()
                ))
            })?;
        let positions = (start..start + token_ids.len()).collect();
        Ok(Self {
            seq_id,
            context_len: start + token_ids.len(),
            token_ids,
            positions,
            page_table,
            slot_mapping,
        })
    }

    /// Number of fed tokens.
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    /// Check if no tokens are fed.
    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }
}

/// Everything one executor call needs.
#[derive(Debug, Clone, Default)]
pub struct ExecutorBatch {
    pub inputs: Vec<SequenceInput>,
    /// Page copies to apply before any write.
    pub copies: Vec<PageCopy>,
}

impl ExecutorBatch {
    /// Total tokens fed across all inputs.
    pub fn num_tokens(&self) -> usize {
        self.inputs.iter().map(SequenceInput::len).sum()
    }
}

/// Result of one executor call.
#[derive(Debug, Clone)]
pub struct ExecutorOutput {
    /// Per input, logits of shape `[fed tokens, vocab]`.
    pub logits: Vec<Tensor>,
    /// Per input, the cache slots written.
    pub cache_writes: Vec<Vec<usize>>,
}

/// A model behind the serving core.
///
/// Implementations own their KV cache storage, laid out in the pages the
/// allocator hands out.
pub trait ModelExecutor: Send {
    /// Run one batched forward pass.
    ///
    /// # Errors
    ///
    /// [`Error::ExecutorOutOfMemory`] when the batch does not fit (a
    /// capacity condition, nothing is lost), [`Error::ExecutorFault`] or
    /// [`Error::ShardDesync`] when the executor failed.
    fn forward(&mut self, batch: &ExecutorBatch) -> Result<ExecutorOutput>;

    /// Cache geometry this executor was built for.
    fn cache_shape(&self) -> CacheShape;

    /// Vocabulary size of the logits.
    fn vocab_size(&self) -> usize;

    /// Bring the executor back after a fault.
    fn recover(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Build the executor a configuration describes.
///
/// `tensor_parallel_size > 1` shards the model across worker threads.
pub fn build_executor(
    model: &ModelConfig,
    cache: &CacheConfig,
    parallel: &ParallelConfig,
) -> Result<Box<dyn ModelExecutor>> {
    if parallel.tensor_parallel_size > 1 {
        let executor = TensorParallelExecutor::new(model, cache, parallel)?;
        return Ok(Box::new(executor));
    }
    Ok(Box::new(ToyExecutor::new(model, cache)?))
}
