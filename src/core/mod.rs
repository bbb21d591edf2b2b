//! Core infrastructure for nano-serve.
//!
//! This module contains the fundamental building blocks:
//! - Page and PageTable for the paged KV cache
//! - PageAllocator for page allocation, sharing and copy-on-write
//! - Eviction policies for reclaiming pages under pressure
//! - Sequence and Request for tracking work

pub mod allocator;
pub mod eviction;
pub mod page;
pub mod request;
pub mod sequence;

pub use allocator::{AllocatorSnapshot, AllocatorStats, PageAllocator};
pub use eviction::{EvictionCandidate, EvictionPolicy, LatestArrival, LeastRecentlyAdvanced};
pub use page::{pages_needed, PageCopy, PageHandle, PageId, PageTable};
pub use request::{
    FinishReason, NewRequest, Notice, Request, RequestId, RequestOutput, RequestState, StreamEvent,
};
pub use sequence::{Priority, Sequence, SequenceId, SequenceStatus};
