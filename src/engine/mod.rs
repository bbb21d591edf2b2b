//! Inference engine.
//!
//! This module contains:
//! - BatchExecutor for running scheduled batches on a model executor
//! - Engine for orchestrating one serialized control loop
//! - EngineService for running the loop on its own thread
//! - Sampler for token sampling

pub mod batch;
pub mod llm;
pub mod sampler;
pub mod service;

pub use batch::BatchExecutor;
pub use llm::{Engine, StepOutcome, StepReport};
pub use sampler::Sampler;
pub use service::EngineService;
