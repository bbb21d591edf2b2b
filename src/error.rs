//! Error types for nano-serve.

use thiserror::Error;

use crate::core::sequence::SequenceId;

/// Result type alias for nano-serve operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Which bounded resource refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// The admission queue already holds `limit` queued requests.
    AdmissionQueue { limit: usize },
    /// The page pool cannot satisfy an allocation.
    ExhaustedPool { requested: usize, free: usize },
}

impl std::fmt::Display for Capacity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdmissionQueue { limit } => {
                write!(f, "admission queue full ({limit} queued requests)")
            }
            Self::ExhaustedPool { requested, free } => {
                write!(f, "page pool exhausted (requested {requested}, free {free})")
            }
        }
    }
}

/// Main error type for nano-serve.
#[derive(Error, Debug)]
pub enum Error {
    /// A bounded resource is full. Nothing was mutated.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(Capacity),

    /// The request failed admission validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The model executor ran out of device memory for this batch.
    #[error("model executor out of memory")]
    ExecutorOutOfMemory,

    /// The model executor (or one of its shards) failed.
    #[error("executor fault: {0}")]
    ExecutorFault(String),

    /// Shards disagreed at a collective boundary.
    #[error("shard desync: {0}")]
    ShardDesync(String),

    /// Draft/target distributions broke a rejection sampling precondition.
    #[error("speculation invariant violated: {0}")]
    SpeculationInvariantViolation(String),

    /// Sequence not found in scheduler or allocator.
    #[error("sequence {0} not found")]
    SequenceNotFound(SequenceId),

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// The engine service has stopped.
    #[error("engine is shut down")]
    Shutdown,

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for an exhausted page pool.
    pub fn exhausted_pool(requested: usize, free: usize) -> Self {
        Self::CapacityExceeded(Capacity::ExhaustedPool { requested, free })
    }

    /// Recoverable refusals that leave all state untouched.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::CapacityExceeded(_) | Self::ExecutorOutOfMemory)
    }

    /// Errors that abort every sequence of the in-flight batch.
    pub fn is_fatal_for_batch(&self) -> bool {
        matches!(
            self,
            Self::ExecutorFault(_) | Self::ShardDesync(_) | Self::Tensor(_)
        )
    }
}
