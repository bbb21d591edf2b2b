//! Tensor parallel execution.
//!
//! This module handles:
//! - Static weight partitioning into per-shard contexts
//! - One worker thread per shard with timeout-bounded collectives
//! - Group-wide failure and restart
//! - A model executor running on top of a shard group

pub mod coordinator;
pub mod executor;
pub mod shard;

pub use coordinator::{CoordinatorStatsSnapshot, GroupStatus, ShardCoordinator};
pub use executor::TensorParallelExecutor;
pub use shard::{
    mlp_worker_factory, partition_mlp, Collective, GroupId, MlpShard, PartitionAxis, ShardContext,
    ShardWorker, WeightPartition, WorkerFactory,
};
