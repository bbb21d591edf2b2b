//! nano-serve: A minimalistic LLM serving core in Rust.
//!
//! This crate implements the core scheduling machinery of an inference server:
//! - Paged KV cache management with copy-on-write sharing
//! - Continuous batching with chunked prefill, priorities and preemption
//! - Speculative decoding with a draft model and rejection sampling
//! - Tensor parallel execution over sharded worker threads
//!
//! Models sit behind the [`ModelExecutor`] trait; the crate ships small toy
//! architectures to drive the engine end to end.
//!
//! ```
//! use nano_serve::{Engine, EngineConfig, NewRequest, SamplingConfig};
//!
//! let mut engine = Engine::new(EngineConfig::default()).unwrap();
//! let mut handle = engine
//!     .add_request(NewRequest::new(vec![1, 2, 3]).sampling(SamplingConfig::greedy(4)))
//!     .unwrap();
//! engine.run_until_idle().unwrap();
//! assert!(handle.drain().last().unwrap().is_final);
//! ```

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod model;
pub mod parallel;
pub mod scheduler;
pub mod speculative;

pub use config::{
    Architecture, CacheConfig, EngineConfig, ModelConfig, ParallelConfig, PreemptionMode,
    SamplingConfig, SchedulerConfig,
};
pub use core::{
    FinishReason, NewRequest, Notice, PageAllocator, RequestOutput, StreamEvent,
};
pub use engine::{BatchExecutor, Engine, EngineService, Sampler, StepReport};
pub use error::{Capacity, Error, Result};
pub use model::{build_executor, ExecutorBatch, ExecutorOutput, ModelExecutor, ToyExecutor};
pub use scheduler::{EngineClient, RequestHandle, Scheduler};
pub use speculative::{RejectionSampler, SpeculativeConfig, SpeculativeController};
