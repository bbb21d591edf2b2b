//! Continuous batch executor.
//!
//! Turns a scheduler [`Batch`] into one [`ExecutorBatch`], makes a single
//! forward call, checks what the executor reports back and samples the next
//! token of every entry whose chunk completed its context.

use std::collections::{HashMap, HashSet};

use candle_core::Tensor;
use tracing::{trace, warn};

use crate::config::SamplingConfig;
use crate::core::sequence::SequenceId;
use crate::engine::sampler::Sampler;
use crate::error::{Error, Result};
use crate::model::{CacheShape, ExecutorBatch, ExecutorOutput, ModelExecutor, SequenceInput};
use crate::scheduler::batch::{Batch, BatchEntry, ForkedToken, SequenceOutput};

/// Runs batches on a model executor and samples from its logits.
pub struct BatchExecutor {
    executor: Box<dyn ModelExecutor>,
    /// Sampler of every live sequence.
    samplers: HashMap<SequenceId, Sampler>,
    /// Mixed into request seeds so two executors sampling for the same
    /// sequence draw from different streams.
    seed_salt: u64,
    calls: u64,
}

impl std::fmt::Debug for BatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchExecutor")
            .field("cache_shape", &self.executor.cache_shape())
            .field("samplers", &self.samplers.len())
            .field("calls", &self.calls)
            .finish()
    }
}

impl BatchExecutor {
    pub fn new(executor: Box<dyn ModelExecutor>) -> Self {
        Self {
            executor,
            samplers: HashMap::new(),
            seed_salt: 0,
            calls: 0,
        }
    }

    /// Derive sampler seeds with `salt`.
    pub fn with_seed_salt(mut self, salt: u64) -> Self {
        self.seed_salt = salt;
        self
    }

    pub fn vocab_size(&self) -> usize {
        self.executor.vocab_size()
    }

    pub fn cache_shape(&self) -> CacheShape {
        self.executor.cache_shape()
    }

    /// Forward calls made so far.
    pub fn num_calls(&self) -> u64 {
        self.calls
    }

    /// Bring the executor back after a fault.
    pub fn recover(&mut self) -> Result<()> {
        self.executor.recover()
    }

    /// Forget the sampler of a finished sequence.
    pub fn release(&mut self, seq_id: SequenceId) {
        self.samplers.remove(&seq_id);
    }

    /// Execute `batch` with one forward call.
    pub fn execute(&mut self, batch: &Batch) -> Result<Vec<SequenceOutput>> {
        let inputs = batch
            .entries
            .iter()
            .map(|e| SequenceInput::new(e.seq_id, e.token_ids.clone(), e.start, e.page_table.clone()))
            .collect::<Result<Vec<_>>>()?;
        let output = self.forward(&ExecutorBatch {
            inputs,
            copies: batch.copies.clone(),
        })?;

        Ok(batch
            .entries
            .iter()
            .zip(&output.logits)
            .map(|(entry, logits)| {
                let result = self.plain_output(entry, logits, entry.draft_start);
                contain(entry, result)
            })
            .collect())
    }

    /// One checked forward call.
    ///
    /// Every input must get logits of shape `[tokens, vocab]`, and every
    /// reported cache write must land in a slot reserved for that input;
    /// anything else is an [`Error::ExecutorFault`].
    pub fn forward(&mut self, batch: &ExecutorBatch) -> Result<ExecutorOutput> {
        self.calls += 1;
        let output = self.executor.forward(batch)?;
        verify_output(batch, &output, self.executor.vocab_size())?;
        trace!(
            inputs = batch.inputs.len(),
            tokens = batch.num_tokens(),
            copies = batch.copies.len(),
            "forward"
        );
        Ok(output)
    }

    /// Output of an entry decoded without speculation.
    pub(crate) fn plain_output(
        &mut self,
        entry: &BatchEntry,
        logits: &Tensor,
        num_draft_cached: usize,
    ) -> Result<SequenceOutput> {
        let mut output = SequenceOutput {
            seq_id: entry.seq_id,
            num_cached: entry.context_len,
            num_draft_cached,
            ..Default::default()
        };
        if !entry.samples_next {
            return Ok(output);
        }

        let last = logits.get(entry.token_ids.len() - 1)?;
        let sampler = self.sampler(entry);
        let probs = sampler.distribution(&last)?;
        output.new_tokens.push(sampler.sample_from(&probs)?);

        for fork in &entry.fork_samples {
            let sampler = self.sampler_for(fork.seq_id, &entry.sampling, fork.sample_index);
            output.fork_tokens.push(ForkedToken {
                seq_id: fork.seq_id,
                sample_index: fork.sample_index,
                token: sampler.sample_from(&probs)?,
            });
        }
        Ok(output)
    }

    /// Sampler of a batch entry's sequence.
    pub(crate) fn sampler(&mut self, entry: &BatchEntry) -> &mut Sampler {
        self.sampler_for(entry.seq_id, &entry.sampling, entry.sample_index)
    }

    fn sampler_for(
        &mut self,
        seq_id: SequenceId,
        config: &SamplingConfig,
        sample_index: usize,
    ) -> &mut Sampler {
        let salt = self.seed_salt;
        self.samplers
            .entry(seq_id)
            .or_insert_with(|| match config.seed {
                Some(seed) if salt != 0 => {
                    Sampler::with_seed(config, seed.wrapping_add(sample_index as u64) ^ salt)
                }
                _ => Sampler::for_sample(config, sample_index),
            })
    }
}

/// Keep a failure to sample one entry from failing the whole batch.
pub(crate) fn contain(entry: &BatchEntry, result: Result<SequenceOutput>) -> SequenceOutput {
    result.unwrap_or_else(|err| {
        warn!(seq_id = entry.seq_id, %err, "entry failed after the forward call");
        SequenceOutput::failed(entry.seq_id, &err)
    })
}

fn verify_output(batch: &ExecutorBatch, output: &ExecutorOutput, vocab_size: usize) -> Result<()> {
    if output.logits.len() != batch.inputs.len() || output.cache_writes.len() != batch.inputs.len() {
        return Err(Error::ExecutorFault(format!(
            "executor answered {} logits and {} write sets for {} inputs",
            output.logits.len(),
            output.cache_writes.len(),
            batch.inputs.len()
        )));
    }
    for ((input, logits), writes) in batch.inputs.iter().zip(&output.logits).zip(&output.cache_writes) {
        if logits.dims() != [input.len(), vocab_size] {
            return Err(Error::ExecutorFault(format!(
                "sequence {} got logits of shape {:?}, expected [{}, {vocab_size}]",
                input.seq_id,
                logits.dims(),
                input.len()
            )));
        }
        let reserved: HashSet<usize> = input.slot_mapping.iter().copied().collect();
        if let Some(stray) = writes.iter().find(|slot| !reserved.contains(slot)) {
            return Err(Error::ExecutorFault(format!(
                "sequence {} wrote slot {stray} outside its reservation",
                input.seq_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Architecture, CacheConfig, ModelConfig};
    use crate::core::page::PageTable;
    use crate::model::ToyExecutor;
    use crate::scheduler::batch::ForkSlot;
    use candle_core::{DType, Device};

    fn cache() -> CacheConfig {
        CacheConfig {
            page_size: 4,
            num_pages: 8,
        }
    }

    fn entry(seq_id: SequenceId, tokens: Vec<u32>, pages: Vec<usize>) -> BatchEntry {
        let len = tokens.len();
        BatchEntry {
            seq_id,
            request_id: seq_id,
            sample_index: 0,
            sampling: SamplingConfig::greedy(8),
            token_ids: tokens,
            start: 0,
            page_table: PageTable::from_pages(4, pages),
            context_len: len,
            samples_next: true,
            lookahead: 0,
            fork_samples: Vec::new(),
            draft_token_ids: Vec::new(),
            draft_start: 0,
        }
    }

    /// Writes every token one slot past where it was told to.
    struct StrayWriter(ToyExecutor);

    impl ModelExecutor for StrayWriter {
        fn forward(&mut self, batch: &ExecutorBatch) -> Result<ExecutorOutput> {
            let mut output = self.0.forward(batch)?;
            for writes in &mut output.cache_writes {
                writes.iter_mut().for_each(|slot| *slot += 1);
            }
            Ok(output)
        }

        fn cache_shape(&self) -> CacheShape {
            self.0.cache_shape()
        }

        fn vocab_size(&self) -> usize {
            self.0.vocab_size()
        }
    }

    /// Answers with logits of the wrong width.
    struct WrongShape;

    impl ModelExecutor for WrongShape {
        fn forward(&mut self, batch: &ExecutorBatch) -> Result<ExecutorOutput> {
            let logits = batch
                .inputs
                .iter()
                .map(|i| Tensor::zeros((i.len(), 3), DType::F32, &Device::Cpu))
                .collect::<candle_core::Result<Vec<_>>>()?;
            Ok(ExecutorOutput {
                logits,
                cache_writes: batch.inputs.iter().map(|i| i.slot_mapping.clone()).collect(),
            })
        }

        fn cache_shape(&self) -> CacheShape {
            CacheShape {
                page_size: 4,
                num_pages: 8,
                slot_width: 1,
            }
        }

        fn vocab_size(&self) -> usize {
            16
        }
    }

    #[test]
    fn test_execute_samples_completed_chunks() {
        let model = ModelConfig::new(Architecture::Successor, 16);
        let mut executor = BatchExecutor::new(Box::new(ToyExecutor::new(&model, &cache()).unwrap()));

        let mut partial = entry(2, vec![1, 2, 3], vec![1]);
        partial.samples_next = false;
        let batch = Batch {
            step: 1,
            entries: vec![entry(1, vec![5, 6], vec![0]), partial],
            copies: Vec::new(),
        };

        let outputs = executor.execute(&batch).unwrap();
        assert_eq!(outputs[0].new_tokens, vec![7]);
        assert_eq!(outputs[0].num_cached, 2);
        assert!(outputs[1].new_tokens.is_empty());
        assert_eq!(outputs[1].num_cached, 3);
        assert_eq!(executor.num_calls(), 1);
    }

    #[test]
    fn test_forks_sample_from_parent_logits() {
        let model = ModelConfig::new(Architecture::Successor, 16);
        let mut executor = BatchExecutor::new(Box::new(ToyExecutor::new(&model, &cache()).unwrap()));
        let mut parent = entry(1, vec![3], vec![0]);
        parent.fork_samples = vec![ForkSlot {
            seq_id: 9,
            sample_index: 1,
        }];
        let batch = Batch {
            step: 1,
            entries: vec![parent],
            copies: Vec::new(),
        };

        let outputs = executor.execute(&batch).unwrap();
        assert_eq!(outputs[0].new_tokens, vec![4]);
        assert_eq!(
            outputs[0].fork_tokens,
            vec![ForkedToken {
                seq_id: 9,
                sample_index: 1,
                token: 4
            }]
        );
    }

    #[test]
    fn test_stray_cache_write_is_a_fault() {
        let model = ModelConfig::new(Architecture::Uniform, 16);
        let inner = ToyExecutor::new(&model, &cache()).unwrap();
        let mut executor = BatchExecutor::new(Box::new(StrayWriter(inner)));
        let batch = Batch {
            step: 1,
            entries: vec![entry(1, vec![1, 2], vec![0])],
            copies: Vec::new(),
        };
        assert!(matches!(executor.execute(&batch), Err(Error::ExecutorFault(_))));
    }

    #[test]
    fn test_wrong_logits_shape_is_a_fault() {
        let mut executor = BatchExecutor::new(Box::new(WrongShape));
        let batch = Batch {
            step: 1,
            entries: vec![entry(1, vec![1], vec![0])],
            copies: Vec::new(),
        };
        assert!(matches!(executor.execute(&batch), Err(Error::ExecutorFault(_))));
    }

    #[test]
    fn test_seeded_samplers_are_reproducible() {
        let model = ModelConfig::new(Architecture::Uniform, 16);
        let mut sampling = SamplingConfig::default().seed(5);
        sampling.max_tokens = 4;
        let draw = |salt: u64| {
            let toy = ToyExecutor::new(&model, &cache()).unwrap();
            let mut executor = BatchExecutor::new(Box::new(toy)).with_seed_salt(salt);
            let mut e = entry(1, vec![1], vec![0]);
            e.sampling = sampling.clone();
            let batch = Batch {
                step: 1,
                entries: vec![e],
                copies: Vec::new(),
            };
            (0..8)
                .map(|_| executor.execute(&batch).unwrap()[0].new_tokens[0])
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(0), draw(0));
        assert_ne!(draw(0), draw(77));
    }
}
