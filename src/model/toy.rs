//! Toy model executors.
//!
//! Small, seeded models with the full executor contract: they read and
//! write a paged cache, honour page copies and produce `[tokens, vocab]`
//! logits. They stand in for real models in tests, demos and benchmarks of
//! the serving core.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Linear;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{Architecture, CacheConfig, ModelConfig};
use crate::error::{Error, Result};
use crate::model::{CacheShape, ExecutorBatch, ExecutorOutput, ModelExecutor, PagedSlotStore};

/// Logit height of the `Successor` model's preferred token.
const SUCCESSOR_PEAK: f32 = 8.0;

/// Uniform random tensor in `[-scale, scale)`.
fn seeded_tensor(rng: &mut StdRng, shape: (usize, usize), scale: f32, device: &Device) -> Result<Tensor> {
    let values: Vec<f32> = (0..shape.0 * shape.1)
        .map(|_| rng.gen_range(-1.0f32..1.0) * scale)
        .collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

/// Weights of the two-layer `Mlp` toy.
///
/// `h0 = embed[t] + 0.5 * embed[t_prev]`, `logits = down(relu(up(h0)))`.
/// The up projection is the column-parallel layer and the down projection
/// the row-parallel layer when the model is sharded.
#[derive(Debug, Clone)]
pub struct MlpWeights {
    /// `[vocab, hidden]`
    embed: Tensor,
    /// Weight `[hidden, hidden]`.
    up: Linear,
    /// Weight `[vocab, hidden]`.
    down: Linear,
}

impl MlpWeights {
    /// Seeded weights for `config`.
    pub fn random(config: &ModelConfig, device: &Device) -> Result<Self> {
        let (v, d) = (config.vocab_size, config.hidden_size);
        let mut rng = StdRng::seed_from_u64(config.seed);
        let scale = 1.0 / (d as f32).sqrt();
        let embed = seeded_tensor(&mut rng, (v, d), 1.0, device)?;
        let up = seeded_tensor(&mut rng, (d, d), 2.0 * scale, device)?;
        let down = seeded_tensor(&mut rng, (v, d), 2.0 * scale * config.sharpness, device)?;
        Ok(Self {
            embed,
            up: Linear::new(up, None),
            down: Linear::new(down, None),
        })
    }

    /// Hidden dimension.
    pub fn hidden_size(&self) -> usize {
        self.up.weight().dims()[0]
    }

    /// Up projection weight `[hidden, hidden]`.
    pub fn up_weight(&self) -> &Tensor {
        self.up.weight()
    }

    /// Down projection weight `[vocab, hidden]`.
    pub fn down_weight(&self) -> &Tensor {
        self.down.weight()
    }

    /// First-layer input for each fed token.
    pub fn input_activations(&self, current: &[u32], previous: &[Option<u32>]) -> Result<Tensor> {
        let device = self.embed.device();
        let n = current.len();
        let cur_ids = Tensor::from_vec(current.to_vec(), n, device)?;
        let prev_ids: Vec<u32> = previous.iter().map(|p| p.unwrap_or(0)).collect();
        let prev_ids = Tensor::from_vec(prev_ids, n, device)?;
        let mask: Vec<f32> = previous
            .iter()
            .map(|p| if p.is_some() { 0.5 } else { 0.0 })
            .collect();
        let mask = Tensor::from_vec(mask, (n, 1), device)?;

        let cur = self.embed.index_select(&cur_ids, 0)?;
        let prev = self.embed.index_select(&prev_ids, 0)?.broadcast_mul(&mask)?;
        Ok((cur + prev)?)
    }

    /// Dense forward from first-layer input to logits.
    pub fn forward(&self, h0: &Tensor) -> Result<Tensor> {
        let h1 = self.up.forward(h0)?.relu()?;
        Ok(self.down.forward(&h1)?)
    }
}

#[derive(Debug, Clone)]
enum ToyModel {
    Uniform,
    /// `[vocab, vocab]` transition logits.
    Bigram(Tensor),
    Successor { peak: f32 },
    Mlp(MlpWeights),
}

/// Single-device executor over one of the toy architectures.
///
/// # Example
///
/// ```
/// use nano_serve::config::{Architecture, CacheConfig, ModelConfig};
/// use nano_serve::core::page::PageTable;
/// use nano_serve::model::{ExecutorBatch, ModelExecutor, SequenceInput, ToyExecutor};
///
/// let cache = CacheConfig { page_size: 4, num_pages: 8 };
/// let model = ModelConfig::new(Architecture::Successor, 16);
/// let mut executor = ToyExecutor::new(&model, &cache).unwrap();
///
/// let input = SequenceInput::new(1, vec![3, 4], 0, PageTable::from_pages(4, vec![0])).unwrap();
/// let batch = ExecutorBatch { inputs: vec![input], copies: vec![] };
/// let output = executor.forward(&batch).unwrap();
/// assert_eq!(output.logits[0].dims(), &[2, 16]);
/// ```
#[derive(Debug)]
pub struct ToyExecutor {
    model: ToyModel,
    vocab_size: usize,
    store: PagedSlotStore,
    device: Device,
    /// Simulated device memory: batches feeding more tokens fail.
    max_batch_tokens: Option<usize>,
}

impl ToyExecutor {
    /// Build the architecture named in `config` over a cache of `cache`'s shape.
    pub fn new(config: &ModelConfig, cache: &CacheConfig) -> Result<Self> {
        let device = Device::Cpu;
        let v = config.vocab_size;
        let model = match config.architecture {
            Architecture::Uniform => ToyModel::Uniform,
            Architecture::Bigram => {
                let mut rng = StdRng::seed_from_u64(config.seed);
                ToyModel::Bigram(seeded_tensor(&mut rng, (v, v), 2.0 * config.sharpness, &device)?)
            }
            Architecture::Successor => ToyModel::Successor {
                peak: SUCCESSOR_PEAK * config.sharpness,
            },
            Architecture::Mlp => ToyModel::Mlp(MlpWeights::random(config, &device)?),
        };
        Ok(Self {
            model,
            vocab_size: v,
            store: PagedSlotStore::new(cache.page_size, cache.num_pages),
            device,
            max_batch_tokens: None,
        })
    }

    /// Fail batches larger than `limit` tokens with
    /// [`Error::ExecutorOutOfMemory`].
    pub fn with_token_limit(mut self, limit: usize) -> Self {
        self.max_batch_tokens = Some(limit);
        self
    }

    /// The `Mlp` weights, if this is an `Mlp` executor.
    pub fn mlp_weights(&self) -> Option<&MlpWeights> {
        match &self.model {
            ToyModel::Mlp(weights) => Some(weights),
            _ => None,
        }
    }

    fn logits(&self, current: &[u32], previous: &[Option<u32>]) -> Result<Tensor> {
        let n = current.len();
        let v = self.vocab_size;
        let logits = match &self.model {
            ToyModel::Uniform => Tensor::zeros((n, v), DType::F32, &self.device)?,
            ToyModel::Bigram(table) => {
                let ids = Tensor::from_vec(current.to_vec(), n, &self.device)?;
                table.index_select(&ids, 0)?
            }
            ToyModel::Successor { peak } => {
                let mut values = vec![0.0f32; n * v];
                for (row, &token) in current.iter().enumerate() {
                    values[row * v + (token as usize + 1) % v] = *peak;
                }
                Tensor::from_vec(values, (n, v), &self.device)?
            }
            ToyModel::Mlp(weights) => weights.forward(&weights.input_activations(current, previous)?)?,
        };
        Ok(logits)
    }
}

impl ModelExecutor for ToyExecutor {
    fn forward(&mut self, batch: &ExecutorBatch) -> Result<ExecutorOutput> {
        if let Some(limit) = self.max_batch_tokens {
            if batch.num_tokens() > limit {
                return Err(Error::ExecutorOutOfMemory);
            }
        }
        let cache_writes = self.store.ingest(batch, self.vocab_size)?;

        let mut logits = Vec::with_capacity(batch.inputs.len());
        for input in &batch.inputs {
            if input.is_empty() {
                logits.push(Tensor::zeros((0, self.vocab_size), DType::F32, &self.device)?);
                continue;
            }
            let (current, previous) = self.store.context(input)?;
            logits.push(self.logits(&current, &previous)?);
        }
        Ok(ExecutorOutput {
            logits,
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
}
