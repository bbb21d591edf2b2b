//! Model executor over a tensor parallel shard group.

use std::sync::atomic::{AtomicU64, Ordering};

use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::config::{Architecture, CacheConfig, ModelConfig, ParallelConfig};
use crate::error::{Error, Result};
use crate::model::{CacheShape, ExecutorBatch, ExecutorOutput, MlpWeights, ModelExecutor, PagedSlotStore};
use crate::parallel::coordinator::{GroupStatus, ShardCoordinator};
use crate::parallel::shard::{mlp_worker_factory, partition_mlp, WorkerFactory, MLP_BOUNDARIES};

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// Sharded `Mlp` executor.
///
/// The embedding lookup and the paged cache stay on the calling thread; the
/// two projections run on the shard group. Logits match the single-device
/// [`ToyExecutor`](crate::model::ToyExecutor) built from the same config, up
/// to float summation order.
#[derive(Debug)]
pub struct TensorParallelExecutor {
    weights: MlpWeights,
    coordinator: ShardCoordinator,
    store: PagedSlotStore,
    vocab_size: usize,
}

impl TensorParallelExecutor {
    /// Partition the model and start one worker per shard.
    pub fn new(model: &ModelConfig, cache: &CacheConfig, parallel: &ParallelConfig) -> Result<Self> {
        Self::with_factory(model, cache, parallel, mlp_worker_factory())
    }

    /// Like [`new`](Self::new), with custom shard workers.
    pub fn with_factory(
        model: &ModelConfig,
        cache: &CacheConfig,
        parallel: &ParallelConfig,
        factory: WorkerFactory,
    ) -> Result<Self> {
        if model.architecture != Architecture::Mlp {
            return Err(Error::Config(format!(
                "architecture {:?} cannot be sharded",
                model.architecture
            )));
        }
        let weights = MlpWeights::random(model, &Device::Cpu)?;
        let group_id = NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed);
        let contexts = partition_mlp(&weights, parallel.tensor_parallel_size, group_id)?;
        let coordinator = ShardCoordinator::new(
            contexts,
            MLP_BOUNDARIES.to_vec(),
            factory,
            parallel.collective_timeout(),
        )?;
        info!(
            group = group_id,
            shards = parallel.tensor_parallel_size,
            "tensor parallel executor ready"
        );
        Ok(Self {
            weights,
            coordinator,
            store: PagedSlotStore::new(cache.page_size, cache.num_pages),
            vocab_size: model.vocab_size,
        })
    }

    /// The shard group.
    pub fn coordinator(&self) -> &ShardCoordinator {
        &self.coordinator
    }
}

impl ModelExecutor for TensorParallelExecutor {
    fn forward(&mut self, batch: &ExecutorBatch) -> Result<ExecutorOutput> {
        let cache_writes = self.store.ingest(batch, self.vocab_size)?;

        let mut current = Vec::with_capacity(batch.num_tokens());
        let mut previous = Vec::with_capacity(batch.num_tokens());
        for input in &batch.inputs {
            let (cur, prev) = self.store.context(input)?;
            current.extend(cur);
            previous.extend(prev);
        }

        let logits = if current.is_empty() {
            Tensor::zeros((0, self.vocab_size), DType::F32, &Device::Cpu)?
        } else {
            let h0 = self.weights.input_activations(&current, &previous)?;
            self.coordinator.run(h0)?
        };

        let mut offset = 0;
        let mut per_input = Vec::with_capacity(batch.inputs.len());
        for input in &batch.inputs {
            per_input.push(logits.narrow(0, offset, input.len())?);
            offset += input.len();
        }
        Ok(ExecutorOutput {
            logits: per_input,
            cache_writes,
        })
    }

    fn cache_shape(&self) -> CacheShape {
        CacheShape {
            page_size: self.store.page_size(),
            num_pages: self.store.num_pages(),
            slot_width: 1,
        }
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn recover(&mut self) -> Result<()> {
        if self.coordinator.status() == GroupStatus::Faulted {
            self.coordinator.restart()?;
        }
        Ok(())
    }
}
