//! Shard contexts, weight partitions and shard workers.

use std::sync::Arc;

use candle_core::Tensor;

use crate::error::{Error, Result};
use crate::model::MlpWeights;

/// Identity of a synchronization group.
pub type GroupId = u64;

/// How a weight matrix is split across shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionAxis {
    /// Output features are split; shard outputs are gathered.
    Columns,
    /// Input features are split; shard outputs are summed.
    Rows,
}

/// How partial outputs are combined at a layer boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collective {
    /// Concatenate along `axis`, in rank order.
    Gather { axis: usize },
    /// Elementwise sum.
    Reduce,
}

/// One shard's slice of a weight matrix.
#[derive(Debug, Clone)]
pub struct WeightPartition {
    pub name: String,
    pub axis: PartitionAxis,
    /// First feature index covered by this slice.
    pub offset: usize,
    /// Features covered by this slice.
    pub len: usize,
    pub tensor: Tensor,
}

/// Everything a shard worker owns: its rank, its group and its weights.
#[derive(Debug, Clone)]
pub struct ShardContext {
    pub rank: usize,
    pub world_size: usize,
    pub group_id: GroupId,
    pub partitions: Vec<WeightPartition>,
}

impl ShardContext {
    /// Look up a partition by name.
    pub fn partition(&self, name: &str) -> Result<&WeightPartition> {
        self.partitions
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| {
                Error::ExecutorFault(format!("shard {} has no partition {name}", self.rank))
            })
    }
}

/// Computes one shard's share of each layer segment.
///
/// Segment `i` runs between layer boundary `i - 1` and boundary `i`.
pub trait ShardWorker: Send {
    fn run_segment(&mut self, ctx: &ShardContext, segment: usize, input: &Tensor) -> Result<Tensor>;
}

/// Builds a worker for a context; called again for every restart.
pub type WorkerFactory = Arc<dyn Fn(&ShardContext) -> Result<Box<dyn ShardWorker>> + Send + Sync>;

/// Layer boundaries of the sharded `Mlp`: gather after the column-parallel
/// up projection, reduce after the row-parallel down projection.
pub const MLP_BOUNDARIES: [Collective; 2] = [Collective::Gather { axis: 1 }, Collective::Reduce];

/// Shard worker of the `Mlp` toy.
#[derive(Debug, Clone, Copy, Default)]
pub struct MlpShard;

impl ShardWorker for MlpShard {
    fn run_segment(&mut self, ctx: &ShardContext, segment: usize, input: &Tensor) -> Result<Tensor> {
        match segment {
            0 => {
                let up = ctx.partition("up")?;
                Ok(input.matmul(&up.tensor.t()?)?.relu()?)
            }
            1 => {
                let down = ctx.partition("down")?;
                let x = input.narrow(1, down.offset, down.len)?.contiguous()?;
                Ok(x.matmul(&down.tensor.t()?)?)
            }
            _ => Err(Error::ShardDesync(format!(
                "shard {} asked for unknown segment {segment}",
                ctx.rank
            ))),
        }
    }
}

/// Factory producing [`MlpShard`] workers.
pub fn mlp_worker_factory() -> WorkerFactory {
    Arc::new(|_ctx: &ShardContext| -> Result<Box<dyn ShardWorker>> { Ok(Box::new(MlpShard)) })
}

/// Split `Mlp` weights into `world_size` shard contexts.
pub fn partition_mlp(weights: &MlpWeights, world_size: usize, group_id: GroupId) -> Result<Vec<ShardContext>> {
    let hidden = weights.hidden_size();
    if world_size == 0 || hidden % world_size != 0 {
        return Err(Error::Config(format!(
            "hidden size {hidden} cannot be split into {world_size} shards"
        )));
    }
    let chunk = hidden / world_size;
    (0..world_size)
        .map(|rank| {
            let offset = rank * chunk;
            let up = weights.up_weight().narrow(0, offset, chunk)?.contiguous()?;
            let down = weights.down_weight().narrow(1, offset, chunk)?.contiguous()?;
            Ok(ShardContext {
                rank,
                world_size,
                group_id,
                partitions: vec![
                    WeightPartition {
                        name: "up".to_string(),
                        axis: PartitionAxis::Columns,
                        offset,
                        len: chunk,
                        tensor: up,
                    },
                    WeightPartition {
                        name: "down".to_string(),
                        axis: PartitionAxis::Rows,
                        offset,
                        len: chunk,
                        tensor: down,
                    },
                ],
            })
        })
        .collect()
}
