//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - Admission control with a bounded queue
//! - Priority-based, iteration-level batch selection
//! - Chunked prefill under a per-step token budget
//! - Preemption of low-priority sequences under page pressure

pub mod admission;
pub mod batch;

pub use admission::{Admission, AdmissionLimits, EngineClient, RequestHandle};
pub use batch::{
    Batch, BatchEntry, ForkSlot, ForkedToken, Scheduler, SchedulerSnapshot, SchedulerStats,
    SequenceOutput,
};
