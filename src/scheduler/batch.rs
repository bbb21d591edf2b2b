//! Continuous batching scheduler.
//!
//! The scheduler owns every request and sequence between admission and
//! completion and decides, once per engine step, which sequences run and
//! how many tokens each one feeds.
//!
//! ## Scheduling Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Scheduler Flow                               │
//! └─────────────────────────────────────────────────────────────────────┘
//!
//!   add_request()                                 select_batch()
//!        │                                              │
//!        ▼                                              ▼
//!   ┌─────────┐                                   ┌─────────────┐
//!   │ Waiting │ ────────────────────────────────► │   Running   │
//!   │  Queue  │   (token budget and pages allow)  │     Set     │
//!   └─────────┘                                   └─────────────┘
//!        ▲                                              │
//!        │            preempt() (Suspend mode)          │ commit()
//!        └──────────────────────────────────────────────┤
//!                                                       ▼
//!                                                  ┌──────────┐
//!                                                  │ Finished │
//!                                                  └──────────┘
//! ```
//!
//! Every step feeds each selected sequence the next chunk of its uncached
//! tokens: a prompt chunk, a recompute chunk after suspension, or the one
//! pending token of a decode (plus the speculative lookahead). A sequence
//! whose chunk reaches the end of its context samples a new token.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use nano_serve::config::SchedulerConfig;
//! use nano_serve::core::allocator::PageAllocator;
//! use nano_serve::core::request::{NewRequest, Request};
//! use nano_serve::scheduler::admission::Admission;
//! use nano_serve::scheduler::batch::Scheduler;
//!
//! let allocator = Arc::new(PageAllocator::new(4, 64));
//! let mut scheduler = Scheduler::new(SchedulerConfig::default(), allocator);
//!
//! let request = Request::new(1, NewRequest::new(vec![1, 2, 3, 4, 5]).max_tokens(3));
//! let (admission, _handle) = Admission::new(request, 16);
//! scheduler.add_request(admission);
//!
//! let batch = scheduler.select_batch();
//! assert_eq!(batch.len(), 1);
//! assert_eq!(batch.entries[0].token_ids, vec![1, 2, 3, 4, 5]);
//! assert!(batch.entries[0].samples_next);
//! ```

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{PreemptionMode, SamplingConfig, SchedulerConfig};
use crate::core::allocator::{AllocatorSnapshot, PageAllocator};
use crate::core::eviction::{EvictionCandidate, EvictionPolicy, LeastRecentlyAdvanced};
use crate::core::page::{PageCopy, PageTable};
use crate::core::request::{FinishReason, Notice, Request, RequestId, RequestState, StreamEvent};
use crate::core::sequence::{Priority, Sequence, SequenceId, SequenceStatus};
use crate::error::{Error, Result};
use crate::scheduler::admission::Admission;

/// A sequence forked off when its parent finishes the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkSlot {
    pub seq_id: SequenceId,
    pub sample_index: usize,
}

/// One sequence's share of a step.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub seq_id: SequenceId,
    pub request_id: RequestId,
    pub sample_index: usize,
    pub sampling: SamplingConfig,
    /// Tokens fed to the target this step.
    pub token_ids: Vec<u32>,
    /// Position of the first fed token.
    pub start: usize,
    /// Page table after this step's reservation.
    pub page_table: PageTable,
    /// Positions visible once the chunk is cached.
    pub context_len: usize,
    /// Whether the chunk reaches the end of the context, so a token is sampled.
    pub samples_next: bool,
    /// Draft tokens to propose (0 = plain decoding).
    pub lookahead: usize,
    /// Samples to fork off once this prompt completes.
    pub fork_samples: Vec<ForkSlot>,
    /// Tokens the draft cache lacks, fed before proposing.
    pub draft_token_ids: Vec<u32>,
    /// Position of the first draft catch-up token.
    pub draft_start: usize,
}

impl BatchEntry {
    /// Tokens this entry costs against the step budget.
    pub fn num_tokens(&self) -> usize {
        self.token_ids.len() + self.lookahead
    }

    /// Whether this entry runs a speculative round.
    pub fn is_speculative(&self) -> bool {
        self.lookahead > 0
    }
}

/// Work of one engine step.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub step: u64,
    pub entries: Vec<BatchEntry>,
    /// Copy-on-write page copies, applied before any cache write.
    pub copies: Vec<PageCopy>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Tokens charged against the step budget.
    pub fn num_tokens(&self) -> usize {
        self.entries.iter().map(BatchEntry::num_tokens).sum()
    }

    pub fn seq_ids(&self) -> impl Iterator<Item = SequenceId> + '_ {
        self.entries.iter().map(|e| e.seq_id)
    }
}

/// First token of a forked sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkedToken {
    pub seq_id: SequenceId,
    pub sample_index: usize,
    pub token: u32,
}

/// What executing one batch entry produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceOutput {
    pub seq_id: SequenceId,
    /// Tokens to append, in order.
    pub new_tokens: Vec<u32>,
    pub fork_tokens: Vec<ForkedToken>,
    /// Positions now valid in the target cache.
    pub num_cached: usize,
    /// Positions now valid in the draft cache.
    pub num_draft_cached: usize,
    /// Drafts proposed and accepted in a speculative round.
    pub proposed: usize,
    pub accepted: usize,
    /// Speculation broke an invariant; decode plainly from now on.
    pub speculation_fallback: bool,
    /// Sampling failed for this entry alone; its request ends with `error`.
    pub failure: Option<String>,
}

impl SequenceOutput {
    /// Output of an entry whose own sampling failed.
    pub fn failed(seq_id: SequenceId, err: &Error) -> Self {
        Self {
            seq_id,
            failure: Some(err.to_string()),
            ..Default::default()
        }
    }
}

/// Counters over the scheduler's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub steps: u64,
    pub admitted: u64,
    pub finished: u64,
    pub cancelled: u64,
    pub errored: u64,
    pub preemptions: u64,
    pub suspensions: u64,
    pub generated_tokens: u64,
}

/// Serializable view of the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub step: u64,
    pub waiting: Vec<SequenceId>,
    pub running: Vec<SequenceId>,
    pub sequences: Vec<Sequence>,
    pub stats: SchedulerStats,
    pub allocator: AllocatorSnapshot,
}

/// Entry in the priority queue for scheduling.
///
/// Ordered by (priority DESC, arrival ASC, seq_id ASC).
#[derive(Debug, Clone, Copy)]
struct PriorityEntry {
    seq_id: SequenceId,
    priority: Priority,
    arrival_order: u64,
}

impl PriorityEntry {
    fn of(seq: &Sequence) -> Self {
        Self {
            seq_id: seq.seq_id(),
            priority: seq.priority(),
            arrival_order: seq.arrival_order(),
        }
    }
}

impl PartialEq for PriorityEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq_id == other.seq_id
    }
}

impl Eq for PriorityEntry {}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first, then earlier arrival, then lower id
        self.priority
            .cmp(&other.priority)
            .then(other.arrival_order.cmp(&self.arrival_order))
            .then(other.seq_id.cmp(&self.seq_id))
    }
}

#[derive(Debug)]
struct RequestEntry {
    request: Request,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    /// Every sample's sequence, by sample index.
    seq_ids: Vec<SequenceId>,
    finished_samples: usize,
    admitted_step: u64,
    forked: bool,
}

impl RequestEntry {
    fn deliver(&self, event: StreamEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => {
                // Nobody listens any more; stop at the next step.
                self.cancel.cancel();
            }
            Err(TrySendError::Full(event)) => {
                error!(
                    request_id = self.request.request_id,
                    ?event,
                    "event channel full, dropping event"
                );
            }
        }
    }

    fn expected_samples(&self) -> usize {
        if self.forked {
            self.seq_ids.len()
        } else {
            self.request.n
        }
    }
}

/// Next chunk of one candidate.
#[derive(Debug, Clone, Copy)]
struct ChunkPlan {
    start: usize,
    len: usize,
    lookahead: usize,
    /// First position written this step, in either cache.
    reserve_from: usize,
}

impl ChunkPlan {
    fn cost(&self) -> usize {
        self.len + self.lookahead
    }

    fn reserve_to(&self) -> usize {
        self.start + self.len + self.lookahead
    }
}

/// Continuous batching scheduler.
///
/// Manages sequences through their lifecycle:
/// - Waiting: admitted, no pages yet
/// - Running: holds pages, advances every step it is selected
/// - Suspended: evicted with its tokens kept, waiting for a recompute
/// - Finished: removed, pages released
pub struct Scheduler {
    config: SchedulerConfig,
    allocator: Arc<PageAllocator>,
    policy: Box<dyn EvictionPolicy>,
    requests: HashMap<RequestId, RequestEntry>,
    sequences: HashMap<SequenceId, Sequence>,
    /// Waiting and suspended sequences.
    waiting: BinaryHeap<PriorityEntry>,
    running: Vec<SequenceId>,
    /// Requests accepted by a client and not yet running.
    queued: Arc<AtomicUsize>,
    /// Speculative lookahead `k`; 0 disables speculation.
    lookahead: usize,
    /// Sequences that left the scheduler since the last drain.
    retired: Vec<SequenceId>,
    next_seq_id: SequenceId,
    arrival_counter: u64,
    step: u64,
    stats: SchedulerStats,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("policy", &self.policy.name())
            .field("step", &self.step)
            .field("requests", &self.requests.len())
            .field("waiting", &self.waiting.len())
            .field("running", &self.running.len())
            .finish()
    }
}

impl Scheduler {
    /// Create a scheduler drawing pages from `allocator`.
    pub fn new(config: SchedulerConfig, allocator: Arc<PageAllocator>) -> Self {
        Self {
            config,
            allocator,
            policy: Box::new(LeastRecentlyAdvanced),
            requests: HashMap::new(),
            sequences: HashMap::new(),
            waiting: BinaryHeap::new(),
            running: Vec::new(),
            queued: Arc::new(AtomicUsize::new(0)),
            lookahead: 0,
            retired: Vec::new(),
            next_seq_id: 1,
            arrival_counter: 0,
            step: 0,
            stats: SchedulerStats::default(),
        }
    }

    /// Use `policy` to pick eviction victims.
    pub fn with_eviction_policy(mut self, policy: Box<dyn EvictionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Propose up to `k` draft tokens per decoding sequence.
    pub fn with_lookahead(mut self, k: usize) -> Self {
        self.lookahead = k;
        self
    }

    /// Counter of queued requests shared with clients.
    pub fn queue_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.queued)
    }

    /// Take over an admitted request.
    pub fn add_request(&mut self, admission: Admission) {
        let Admission {
            request,
            events,
            cancel,
        } = admission;
        let request_id = request.request_id;
        let seq_id = self.allocate_seq_id();
        let seq = Sequence::new(seq_id, request_id, request.prompt_token_ids.clone())
            .with_order(request.priority, self.arrival_counter);
        self.arrival_counter += 1;

        info!(
            request_id,
            seq_id,
            prompt_len = seq.prompt_len(),
            max_tokens = request.sampling.max_tokens,
            n = request.n,
            priority = request.priority,
            "request admitted"
        );
        self.waiting.push(PriorityEntry::of(&seq));
        self.sequences.insert(seq_id, seq);
        self.requests.insert(
            request_id,
            RequestEntry {
                request,
                events,
                cancel,
                seq_ids: vec![seq_id],
                finished_samples: 0,
                admitted_step: self.step,
                forked: false,
            },
        );
        self.stats.admitted += 1;
    }

    // ========== Batch selection ==========

    /// Compose the batch of the next step.
    pub fn select_batch(&mut self) -> Batch {
        self.step += 1;
        self.stats.steps += 1;
        self.expire_requests();

        let mut batch = self.compose(false);
        if batch.is_empty() && self.config.enable_preemption && self.is_starving() {
            // Everything left holds pages someone else needs. Free the
            // policy's pick regardless of priority and try again.
            if let Some(victim) = self.pick_victim(None, &HashSet::new()) {
                warn!(seq_id = victim, "preempting to break page starvation");
                self.preempt(victim);
                batch = self.compose(true);
            }
        }

        self.waiting = self
            .sequences
            .values()
            .filter(|s| matches!(s.status(), SequenceStatus::Waiting | SequenceStatus::Suspended))
            .map(PriorityEntry::of)
            .collect();

        if !batch.is_empty() {
            debug!(
                step = self.step,
                entries = batch.len(),
                tokens = batch.num_tokens(),
                copies = batch.copies.len(),
                free_pages = self.allocator.num_free_pages(),
                "batch selected"
            );
        }
        batch
    }

    fn compose(&mut self, retry: bool) -> Batch {
        let mut candidates: Vec<PriorityEntry> = self
            .running
            .iter()
            .filter_map(|id| self.sequences.get(id))
            .map(PriorityEntry::of)
            .chain(std::mem::take(&mut self.waiting).into_vec())
            .collect();
        if retry {
            candidates = self
                .sequences
                .values()
                .filter(|s| !s.status().is_finished())
                .map(PriorityEntry::of)
                .collect();
        }
        candidates.sort_by(|a, b| b.cmp(a));
        candidates.dedup_by_key(|c| c.seq_id);

        let mut batch = Batch {
            step: self.step,
            ..Default::default()
        };
        let mut budget = self.config.max_num_batched_tokens;
        // Requests with a sequence in the batch are never evicted.
        let mut busy = HashSet::new();
        let mut evicted = HashSet::new();

        for candidate in candidates {
            if batch.len() >= self.config.max_num_seqs || budget == 0 {
                break;
            }
            if evicted.contains(&candidate.seq_id) {
                continue;
            }
            let Some(plan) = self.plan_chunk(candidate.seq_id, budget, batch.is_empty()) else {
                continue;
            };
            let Some(request_id) = self.sequences.get(&candidate.seq_id).map(Sequence::request_id)
            else {
                continue;
            };
            busy.insert(request_id);
            let copies = match self.reserve(candidate, plan, &busy, &mut evicted) {
                Ok(copies) => copies,
                Err(err) => {
                    debug!(seq_id = candidate.seq_id, %err, "candidate skipped");
                    self.forget_busy(&mut busy, &batch, request_id);
                    continue;
                }
            };
            match self.build_entry(candidate.seq_id, plan) {
                Some(entry) => {
                    budget = budget.saturating_sub(plan.cost());
                    self.allocator.pin(candidate.seq_id);
                    batch.copies.extend(copies);
                    batch.entries.push(entry);
                }
                None => self.forget_busy(&mut busy, &batch, request_id),
            }
        }
        batch
    }

    fn forget_busy(&self, busy: &mut HashSet<RequestId>, batch: &Batch, request_id: RequestId) {
        if !batch.entries.iter().any(|e| e.request_id == request_id) {
            busy.remove(&request_id);
        }
    }

    /// Size the next chunk of `seq_id`, or `None` if it cannot run now.
    fn plan_chunk(&self, seq_id: SequenceId, budget: usize, batch_empty: bool) -> Option<ChunkPlan> {
        let seq = self.sequences.get(&seq_id)?;
        if seq.status().is_finished() {
            return None;
        }
        let request = &self.requests.get(&seq.request_id())?.request;
        let start = seq.num_cached();
        let uncached = seq.num_uncached();
        if uncached == 0 {
            return None;
        }

        if uncached == 1 {
            let remaining = request.sampling.max_tokens.saturating_sub(seq.output_len());
            let lookahead = if self.lookahead > 0 && seq.speculation_enabled() {
                self.lookahead
                    .min(remaining.saturating_sub(1))
                    .min(budget.saturating_sub(1))
            } else {
                0
            };
            let reserve_from = if lookahead > 0 {
                start.min(seq.num_draft_cached())
            } else {
                start
            };
            return Some(ChunkPlan {
                start,
                len: 1,
                lookahead,
                reserve_from,
            });
        }

        let len = if self.config.enable_chunked_prefill {
            uncached.min(self.config.chunk_size.max(1)).min(budget)
        } else if uncached > budget && !batch_empty {
            return None;
        } else {
            uncached
        };
        Some(ChunkPlan {
            start,
            len,
            lookahead: 0,
            reserve_from: start,
        })
    }

    /// Reserve pages for a plan, preempting idle lower-priority sequences.
    fn reserve(
        &mut self,
        candidate: PriorityEntry,
        plan: ChunkPlan,
        busy: &HashSet<RequestId>,
        evicted: &mut HashSet<SequenceId>,
    ) -> Result<Vec<PageCopy>> {
        loop {
            match self
                .allocator
                .reserve(candidate.seq_id, plan.reserve_from, plan.reserve_to())
            {
                Ok(copies) => return Ok(copies),
                Err(err) if err.is_capacity() && self.config.enable_preemption => {
                    let Some(victim) = self.pick_victim(Some(candidate.priority), busy) else {
                        return Err(err);
                    };
                    evicted.insert(victim);
                    self.preempt(victim);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn build_entry(&mut self, seq_id: SequenceId, plan: ChunkPlan) -> Option<BatchEntry> {
        let page_size = self.allocator.page_size();
        let page_table = self
            .allocator
            .page_table(seq_id)
            .unwrap_or_else(|| PageTable::new(page_size));

        let seq = self.sequences.get(&seq_id)?;
        let request_id = seq.request_id();
        let end = plan.start + plan.len;
        let samples_next = end == seq.total_len();
        let draft_start = seq.num_draft_cached();
        let draft_token_ids = if plan.lookahead > 0 {
            seq.token_ids()[draft_start..].to_vec()
        } else {
            Vec::new()
        };
        let token_ids = seq.token_ids()[plan.start..end].to_vec();
        let sample_index = seq.sample_index();
        let forks_pending = samples_next && sample_index == 0 && seq.output_len() == 0;
        let was_queued = seq.status() == SequenceStatus::Waiting;

        let entry = self.requests.get(&request_id)?;
        let sampling = entry.request.sampling.clone();
        let num_forks = if forks_pending && !entry.forked {
            entry.request.n - 1
        } else {
            0
        };
        let fork_samples = (1..=num_forks)
            .map(|sample_index| ForkSlot {
                seq_id: self.allocate_seq_id(),
                sample_index,
            })
            .collect();

        let seq = self.sequences.get_mut(&seq_id)?;
        if seq.status() != SequenceStatus::Running {
            if let Err(err) = seq.set_running() {
                warn!(seq_id, %err, "cannot start sequence");
                return None;
            }
            self.running.push(seq_id);
            if was_queued && sample_index == 0 {
                self.release_queue_slot();
                if let Some(entry) = self.requests.get_mut(&request_id) {
                    entry.request.state = RequestState::Active;
                }
            }
        }

        Some(BatchEntry {
            seq_id,
            request_id,
            sample_index,
            sampling,
            token_ids,
            start: plan.start,
            page_table,
            context_len: end,
            samples_next,
            lookahead: plan.lookahead,
            fork_samples,
            draft_token_ids,
            draft_start,
        })
    }

    /// Whether running sequences exist but none could be scheduled.
    fn is_starving(&self) -> bool {
        !self.running.is_empty()
            && self
                .running
                .iter()
                .filter_map(|id| self.sequences.get(id))
                .any(|s| !s.status().is_finished())
    }

    /// Ask the eviction policy for an idle running sequence.
    ///
    /// With `below` set, only strictly lower priorities are offered.
    fn pick_victim(&self, below: Option<Priority>, busy: &HashSet<RequestId>) -> Option<SequenceId> {
        let candidates: Vec<EvictionCandidate> = self
            .running
            .iter()
            .filter(|&&id| !self.allocator.is_pinned(id))
            .filter_map(|id| self.sequences.get(id))
            .filter(|s| !busy.contains(&s.request_id()))
            .filter(|s| below.map_or(true, |p| s.priority() < p))
            .map(|s| EvictionCandidate {
                seq_id: s.seq_id(),
                priority: s.priority(),
                arrival_order: s.arrival_order(),
                last_advanced_step: s.last_advanced_step(),
                num_pages: self.allocator.num_pages_of(s.seq_id()),
            })
            .collect();
        self.policy.select_victim(&candidates)
    }

    /// Take a running sequence's pages away.
    fn preempt(&mut self, seq_id: SequenceId) {
        let Some(seq) = self.sequences.get(&seq_id) else {
            return;
        };
        let request_id = seq.request_id();
        let suspend = self.config.preemption_mode == PreemptionMode::Suspend
            && seq.num_suspensions() < self.config.max_suspensions;
        self.stats.preemptions += 1;

        if !suspend {
            warn!(seq_id, request_id, "preempted, aborting request");
            self.finish_request(request_id, FinishReason::Error, Some(Notice::Preempted));
            return;
        }

        let freed = self.allocator.release(seq_id);
        self.running.retain(|&id| id != seq_id);
        let Some(seq) = self.sequences.get_mut(&seq_id) else {
            return;
        };
        if let Err(err) = seq.set_suspended() {
            warn!(seq_id, %err, "cannot suspend sequence");
            return;
        }
        let count = seq.num_suspensions();
        let sample = seq.sample_index();
        self.stats.suspensions += 1;
        warn!(seq_id, request_id, freed, count, "preempted, suspending sequence");
        if let Some(entry) = self.requests.get(&request_id) {
            entry.deliver(StreamEvent::notice(
                request_id,
                sample,
                Notice::Suspended { count },
            ));
        }
    }

    /// Cancellation and timeout pass.
    fn expire_requests(&mut self) {
        let now = Instant::now();
        let step = self.step;
        let expired: Vec<(RequestId, Option<Notice>)> = self
            .requests
            .iter()
            .filter_map(|(&id, entry)| {
                if entry.cancel.is_cancelled() {
                    Some((id, None))
                } else if entry.request.deadline.is_some_and(|d| now >= d)
                    || entry
                        .request
                        .max_steps
                        .is_some_and(|m| step - entry.admitted_step > m)
                {
                    Some((id, Some(Notice::TimedOut)))
                } else {
                    None
                }
            })
            .collect();
        for (request_id, notice) in expired {
            info!(request_id, timed_out = notice.is_some(), "request cancelled");
            self.finish_request(request_id, FinishReason::Cancelled, notice);
        }
    }

    // ========== Commit ==========

    /// Apply the outputs of an executed batch.
    pub fn commit(&mut self, outputs: Vec<SequenceOutput>) {
        for output in outputs {
            self.commit_one(output);
        }
        self.allocator.unpin_all();
    }

    fn commit_one(&mut self, output: SequenceOutput) {
        let seq_id = output.seq_id;
        let Some(seq) = self.sequences.get_mut(&seq_id) else {
            return;
        };
        let request_id = seq.request_id();
        if let Some(reason) = output.failure {
            warn!(seq_id, request_id, %reason, "sampling failed");
            let notice = Notice::SamplingFailure(reason);
            self.finish_request(request_id, FinishReason::Error, Some(notice));
            return;
        }
        seq.mark_advanced(self.step);
        if !output.fork_tokens.is_empty() {
            // Forks clone the parent, whose cache now covers the prompt.
            seq.mark_cached(output.num_cached);
            seq.mark_draft_cached(output.num_draft_cached);
        }

        if output.speculation_fallback {
            seq.disable_speculation();
            let sample = seq.sample_index();
            warn!(seq_id, request_id, "speculation disabled for sequence");
            if let Some(entry) = self.requests.get(&request_id) {
                entry.deliver(StreamEvent::notice(
                    request_id,
                    sample,
                    Notice::SpeculationDisabled,
                ));
            }
        }

        if !output.fork_tokens.is_empty() {
            if let Err(err) = self.fork(seq_id, &output.fork_tokens) {
                error!(seq_id, %err, "fork failed");
                let notice = Notice::ExecutorFailure(err.to_string());
                self.finish_request(request_id, FinishReason::Error, Some(notice));
                return;
            }
        }

        let cached = (output.num_cached, output.num_draft_cached);
        self.append_tokens(seq_id, &output.new_tokens, Some(cached));
        for fork in &output.fork_tokens {
            self.append_tokens(fork.seq_id, &[fork.token], None);
        }
    }

    /// Create the forked samples of a parent whose prompt just completed.
    fn fork(&mut self, parent_id: SequenceId, forks: &[ForkedToken]) -> Result<()> {
        let parent = self
            .sequences
            .get(&parent_id)
            .cloned()
            .ok_or(Error::SequenceNotFound(parent_id))?;
        let entry = self
            .requests
            .get_mut(&parent.request_id())
            .ok_or(Error::SequenceNotFound(parent_id))?;
        for fork in forks {
            self.allocator.fork(parent_id, fork.seq_id)?;
            let child = parent.fork(fork.seq_id, fork.sample_index);
            self.sequences.insert(fork.seq_id, child);
            self.running.push(fork.seq_id);
            entry.seq_ids.push(fork.seq_id);
        }
        entry.forked = true;
        debug!(parent_id, forks = forks.len(), "forked samples");
        Ok(())
    }

    /// Append sampled tokens to a sequence, streaming them and applying stop
    /// tokens and `max_tokens`.
    ///
    /// `cached` holds the target and draft cache progress reported by the
    /// executor. It is applied after the append, since accepted drafts extend
    /// the cache past the old history.
    fn append_tokens(&mut self, seq_id: SequenceId, tokens: &[u32], cached: Option<(usize, usize)>) {
        let Some(seq) = self.sequences.get_mut(&seq_id) else {
            return;
        };
        let request_id = seq.request_id();
        let Some(entry) = self.requests.get_mut(&request_id) else {
            return;
        };
        let sampling = &entry.request.sampling;

        let mut finish = None;
        for &token in tokens {
            seq.append_token(token);
            self.stats.generated_tokens += 1;
            let mut event = StreamEvent::token(request_id, seq.sample_index(), token);
            if sampling.stop_token_ids.contains(&token) {
                finish = Some(FinishReason::Stop);
            } else if seq.output_len() >= sampling.max_tokens {
                finish = Some(FinishReason::Length);
            }
            if let Some(reason) = finish {
                entry.finished_samples += 1;
                event.finish_reason = Some(reason);
                event.is_final = entry.finished_samples >= entry.expected_samples();
                entry.deliver(event);
                break;
            }
            entry.deliver(event);
        }
        if let Some((num_cached, num_draft_cached)) = cached {
            seq.mark_cached(num_cached);
            seq.mark_draft_cached(num_draft_cached);
        }

        match finish {
            Some(reason) => self.finish_sample(seq_id, reason),
            None => {
                let num_cached = seq.num_cached();
                self.allocator.trim(seq_id, num_cached);
            }
        }
    }

    /// Retire one sample that finished normally.
    fn finish_sample(&mut self, seq_id: SequenceId, reason: FinishReason) {
        let Some(mut seq) = self.sequences.remove(&seq_id) else {
            return;
        };
        seq.set_finished(reason);
        self.allocator.release(seq_id);
        self.running.retain(|&id| id != seq_id);
        self.retired.push(seq_id);

        let request_id = seq.request_id();
        let done = self
            .requests
            .get(&request_id)
            .is_some_and(|e| e.finished_samples >= e.expected_samples());
        debug!(seq_id, request_id, reason = reason.as_str(), "sample finished");
        if done {
            if let Some(mut entry) = self.requests.remove(&request_id) {
                entry.request.state = reason.terminal_state();
                self.stats.finished += 1;
                info!(
                    request_id,
                    reason = reason.as_str(),
                    latency_ms = entry.request.arrival_time.elapsed().as_millis() as u64,
                    "request finished"
                );
            }
        }
    }

    /// Terminate a whole request with one final event.
    fn finish_request(&mut self, request_id: RequestId, reason: FinishReason, notice: Option<Notice>) {
        let Some(mut entry) = self.requests.remove(&request_id) else {
            return;
        };
        for &seq_id in &entry.seq_ids {
            if let Some(mut seq) = self.sequences.remove(&seq_id) {
                seq.set_finished(reason);
                self.allocator.release(seq_id);
                self.running.retain(|&id| id != seq_id);
                self.retired.push(seq_id);
            }
        }
        if entry.request.state == RequestState::Queued {
            self.release_queue_slot();
        }
        entry.request.state = reason.terminal_state();
        match reason {
            FinishReason::Cancelled => self.stats.cancelled += 1,
            FinishReason::Error => self.stats.errored += 1,
            FinishReason::Stop | FinishReason::Length => self.stats.finished += 1,
        }
        entry.deliver(StreamEvent::terminal(request_id, 0, reason, notice));
    }

    // ========== Failure handling ==========

    /// Terminate every request with a sequence in `batch`.
    pub fn fail_batch(&mut self, batch: &Batch, err: &Error) {
        let request_ids: Vec<RequestId> = batch
            .entries
            .iter()
            .map(|e| e.request_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        error!(step = batch.step, requests = request_ids.len(), %err, "batch failed");
        self.allocator.unpin_all();
        for request_id in request_ids {
            let notice = Notice::ExecutorFailure(err.to_string());
            self.finish_request(request_id, FinishReason::Error, Some(notice));
        }
    }

    /// React to an executor out-of-memory report for `batch`.
    ///
    /// Nothing of the batch was committed. The lowest-ranked entry gives up
    /// its pages so the next step is smaller; a single-entry batch can never
    /// shrink, so its request fails.
    pub fn relieve_pressure(&mut self, batch: &Batch) {
        self.allocator.unpin_all();
        if batch.len() > 1 {
            let candidates: Vec<EvictionCandidate> = batch
                .entries
                .iter()
                .filter_map(|e| self.sequences.get(&e.seq_id))
                .map(|s| EvictionCandidate {
                    seq_id: s.seq_id(),
                    priority: s.priority(),
                    arrival_order: s.arrival_order(),
                    last_advanced_step: s.last_advanced_step(),
                    num_pages: self.allocator.num_pages_of(s.seq_id()),
                })
                .collect();
            if let Some(victim) = self.policy.select_victim(&candidates) {
                warn!(step = batch.step, seq_id = victim, "executor out of memory, preempting");
                self.preempt(victim);
                return;
            }
        }
        for entry in &batch.entries {
            let notice = Notice::ExecutorFailure(Error::ExecutorOutOfMemory.to_string());
            self.finish_request(entry.request_id, FinishReason::Error, Some(notice));
        }
    }

    /// Terminate every outstanding request.
    pub fn abort_all(&mut self, reason: FinishReason, notice: Option<Notice>) {
        let request_ids: Vec<RequestId> = self.requests.keys().copied().collect();
        for request_id in request_ids {
            self.finish_request(request_id, reason, notice.clone());
        }
        self.allocator.unpin_all();
    }

    // ========== Queries ==========

    /// Sequences that left the scheduler since the last call.
    pub fn drain_retired(&mut self) -> Vec<SequenceId> {
        std::mem::take(&mut self.retired)
    }

    /// Get a reference to a sequence.
    pub fn sequence(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.sequences.get(&seq_id)
    }

    /// Live sequences of a request.
    pub fn request_sequences(&self, request_id: RequestId) -> Vec<SequenceId> {
        self.requests.get(&request_id).map_or_else(Vec::new, |e| {
            e.seq_ids
                .iter()
                .copied()
                .filter(|id| self.sequences.contains_key(id))
                .collect()
        })
    }

    /// Get number of waiting and suspended sequences.
    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Get number of running sequences.
    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Requests not yet finished.
    pub fn num_requests(&self) -> usize {
        self.requests.len()
    }

    /// Check if scheduler has any unfinished requests.
    pub fn has_unfinished_requests(&self) -> bool {
        !self.requests.is_empty()
    }

    /// Steps selected so far.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn allocator(&self) -> &Arc<PageAllocator> {
        &self.allocator
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Serializable view of queues, sequences and page tables.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let mut sequences: Vec<Sequence> = self.sequences.values().cloned().collect();
        sequences.sort_by_key(Sequence::seq_id);
        let mut waiting: Vec<PriorityEntry> = self.waiting.clone().into_vec();
        waiting.sort_by(|a, b| b.cmp(a));
        SchedulerSnapshot {
            step: self.step,
            waiting: waiting.iter().map(|e| e.seq_id).collect(),
            running: self.running.clone(),
            sequences,
            stats: self.stats,
            allocator: self.allocator.snapshot(),
        }
    }

    fn allocate_seq_id(&mut self) -> SequenceId {
        let id = self.next_seq_id;
        self.next_seq_id += 1;
        id
    }

    fn release_queue_slot(&self) {
        // Requests added without a client never took a slot.
        let _ = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request::NewRequest;
    use crate::scheduler::admission::RequestHandle;

    fn scheduler(config: SchedulerConfig, page_size: usize, num_pages: usize) -> Scheduler {
        Scheduler::new(config, Arc::new(PageAllocator::new(page_size, num_pages)))
    }

    fn submit(scheduler: &mut Scheduler, id: RequestId, request: NewRequest) -> RequestHandle {
        let capacity = request.max_events(4);
        let (admission, handle) = Admission::new(Request::new(id, request), capacity);
        scheduler.add_request(admission);
        handle
    }

    /// Pretend the executor fed every entry and sampled `token`.
    fn run_step(scheduler: &mut Scheduler, token: u32) -> Batch {
        let batch = scheduler.select_batch();
        let outputs = batch
            .entries
            .iter()
            .map(|e| SequenceOutput {
                seq_id: e.seq_id,
                new_tokens: if e.samples_next { vec![token] } else { vec![] },
                fork_tokens: e
                    .fork_samples
                    .iter()
                    .map(|f| ForkedToken {
                        seq_id: f.seq_id,
                        sample_index: f.sample_index,
                        token: token + f.sample_index as u32,
                    })
                    .collect(),
                num_cached: e.context_len,
                num_draft_cached: e.draft_start,
                ..Default::default()
            })
            .collect();
        scheduler.commit(outputs);
        batch
    }

    #[test]
    fn test_priority_ordering() {
        let mut scheduler = scheduler(SchedulerConfig::default(), 4, 64);
        submit(&mut scheduler, 1, NewRequest::new(vec![1]).priority(0));
        submit(&mut scheduler, 2, NewRequest::new(vec![2]).priority(5));
        submit(&mut scheduler, 3, NewRequest::new(vec![3]).priority(0));

        let batch = scheduler.select_batch();
        let order: Vec<RequestId> = batch.entries.iter().map(|e| e.request_id).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn test_chunked_prefill_respects_budget() {
        let config = SchedulerConfig {
            max_num_batched_tokens: 8,
            chunk_size: 6,
            ..Default::default()
        };
        let mut scheduler = scheduler(config, 4, 64);
        submit(&mut scheduler, 1, NewRequest::new(vec![1; 10]).max_tokens(2));
        submit(&mut scheduler, 2, NewRequest::new(vec![2; 3]).max_tokens(2));

        let batch = run_step(&mut scheduler, 5);
        assert_eq!(batch.num_tokens(), 8);
        assert_eq!(batch.entries[0].token_ids.len(), 6);
        assert!(!batch.entries[0].samples_next);
        assert_eq!(batch.entries[1].token_ids.len(), 2);

        let batch = run_step(&mut scheduler, 5);
        assert_eq!(batch.entries[0].start, 6);
        assert_eq!(batch.entries[0].token_ids.len(), 4);
        assert!(batch.entries[0].samples_next);
        assert!(scheduler.allocator().is_consistent());
    }

    #[test]
    fn test_unchunked_prompt_runs_alone() {
        let config = SchedulerConfig {
            max_num_batched_tokens: 4,
            enable_chunked_prefill: false,
            ..Default::default()
        };
        let mut scheduler = scheduler(config, 4, 64);
        submit(&mut scheduler, 1, NewRequest::new(vec![1; 2]).max_tokens(2));
        submit(&mut scheduler, 2, NewRequest::new(vec![2; 9]).max_tokens(2));

        let batch = scheduler.select_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.entries[0].request_id, 1);
    }

    #[test]
    fn test_stop_token_and_length() {
        let mut scheduler = scheduler(SchedulerConfig::default(), 4, 64);
        let sampling = SamplingConfig::greedy(3).stop_token(9);
        let mut stopped = submit(&mut scheduler, 1, NewRequest::new(vec![1]).sampling(sampling));
        let mut limited = submit(&mut scheduler, 2, NewRequest::new(vec![1]).max_tokens(2));

        run_step(&mut scheduler, 4);
        run_step(&mut scheduler, 9);

        let events = stopped.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].finish_reason, Some(FinishReason::Stop));
        assert!(events[1].is_final);

        let events = limited.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].finish_reason, Some(FinishReason::Length));
        assert!(!scheduler.has_unfinished_requests());
        assert_eq!(scheduler.allocator().num_free_pages(), 64);
        assert_eq!(scheduler.drain_retired().len(), 2);
    }

    #[test]
    fn test_cancel_frees_pages_in_one_step() {
        let mut scheduler = scheduler(SchedulerConfig::default(), 4, 16);
        let mut handle = submit(&mut scheduler, 1, NewRequest::new(vec![1; 9]).max_tokens(5));
        run_step(&mut scheduler, 3);
        assert!(scheduler.allocator().num_free_pages() < 16);

        handle.cancel();
        let batch = scheduler.select_batch();
        assert!(batch.is_empty());
        assert_eq!(scheduler.allocator().num_free_pages(), 16);

        let events = handle.drain();
        let cancelled: Vec<_> = events
            .iter()
            .filter(|e| e.finish_reason == Some(FinishReason::Cancelled))
            .collect();
        assert_eq!(cancelled.len(), 1);
        assert!(cancelled[0].is_final);
    }

    #[test]
    fn test_step_limit_times_out() {
        let mut scheduler = scheduler(SchedulerConfig::default(), 4, 16);
        let mut handle = submit(&mut scheduler, 1, NewRequest::new(vec![1]).max_tokens(10).max_steps(2));
        run_step(&mut scheduler, 3);
        run_step(&mut scheduler, 3);
        assert!(scheduler.select_batch().is_empty());

        let last = handle.drain().pop().unwrap();
        assert_eq!(last.finish_reason, Some(FinishReason::Cancelled));
        assert_eq!(last.notice, Some(Notice::TimedOut));
    }

    #[test]
    fn test_preemption_aborts_lower_priority() {
        let mut scheduler = scheduler(SchedulerConfig::default(), 4, 3);
        let mut low = submit(&mut scheduler, 1, NewRequest::new(vec![1; 8]).max_tokens(4));
        run_step(&mut scheduler, 2);
        assert_eq!(scheduler.allocator().num_free_pages(), 1);

        submit(&mut scheduler, 2, NewRequest::new(vec![2; 8]).max_tokens(4).priority(1));
        let batch = scheduler.select_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.entries[0].request_id, 2);

        let last = low.drain().pop().unwrap();
        assert_eq!(last.finish_reason, Some(FinishReason::Error));
        assert_eq!(last.notice, Some(Notice::Preempted));
        assert_eq!(scheduler.stats().preemptions, 1);
    }

    #[test]
    fn test_suspended_sequence_recomputes() {
        let config = SchedulerConfig {
            preemption_mode: PreemptionMode::Suspend,
            ..Default::default()
        };
        let mut scheduler = scheduler(config, 4, 3);
        let mut low = submit(&mut scheduler, 1, NewRequest::new(vec![1; 8]).max_tokens(4));
        run_step(&mut scheduler, 2);

        submit(&mut scheduler, 2, NewRequest::new(vec![2; 8]).max_tokens(1).priority(1));
        run_step(&mut scheduler, 2);
        let events = low.drain();
        assert_eq!(events.last().unwrap().notice, Some(Notice::Suspended { count: 1 }));
        assert_eq!(scheduler.num_waiting(), 1);

        // The high-priority request finished; the low one recomputes prompt
        // and generated token in one chunk.
        let batch = scheduler.select_batch();
        assert_eq!(batch.entries[0].request_id, 1);
        assert_eq!(batch.entries[0].start, 0);
        assert_eq!(batch.entries[0].token_ids.len(), 9);
        assert!(batch.entries[0].samples_next);
    }

    #[test]
    fn test_starvation_is_broken() {
        let config = SchedulerConfig {
            preemption_mode: PreemptionMode::Suspend,
            ..Default::default()
        };
        let mut scheduler = scheduler(config, 4, 4);
        submit(&mut scheduler, 1, NewRequest::new(vec![1; 8]).max_tokens(8));
        submit(&mut scheduler, 2, NewRequest::new(vec![2; 8]).max_tokens(8));
        run_step(&mut scheduler, 2);
        assert_eq!(scheduler.allocator().num_free_pages(), 0);

        // Both need a third page and neither outranks the other.
        let batch = scheduler.select_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(scheduler.stats().suspensions, 1);
    }

    #[test]
    fn test_forks_share_prompt_pages() {
        let mut scheduler = scheduler(SchedulerConfig::default(), 4, 16);
        let sampling = SamplingConfig::default();
        let mut handle = submit(
            &mut scheduler,
            1,
            NewRequest::new(vec![1, 2, 3]).sampling(sampling).max_tokens(2).n(3),
        );

        let batch = run_step(&mut scheduler, 10);
        assert_eq!(batch.entries[0].fork_samples.len(), 2);
        let seqs = scheduler.request_sequences(1);
        assert_eq!(seqs.len(), 3);
        let page = scheduler.allocator().page_table(seqs[0]).unwrap().page_ids()[0];
        assert_eq!(scheduler.allocator().ref_count(page), 3);

        // Each sample writes position 3 into its own copy of the page.
        let batch = run_step(&mut scheduler, 20);
        assert_eq!(batch.copies.len(), 2);
        let events = handle.drain();
        assert_eq!(events.iter().filter(|e| e.is_final).count(), 1);
        assert_eq!(events.iter().filter(|e| e.finish_reason.is_some()).count(), 3);
        assert_eq!(scheduler.allocator().num_free_pages(), 16);
    }

    #[test]
    fn test_fail_batch_errors_every_request() {
        let mut scheduler = scheduler(SchedulerConfig::default(), 4, 16);
        let mut a = submit(&mut scheduler, 1, NewRequest::new(vec![1; 5]));
        let mut b = submit(&mut scheduler, 2, NewRequest::new(vec![2; 5]));

        let batch = scheduler.select_batch();
        scheduler.fail_batch(&batch, &Error::ExecutorFault("boom".to_string()));
        assert_eq!(scheduler.allocator().num_free_pages(), 16);
        for handle in [&mut a, &mut b] {
            let last = handle.drain().pop().unwrap();
            assert_eq!(last.finish_reason, Some(FinishReason::Error));
            assert!(matches!(last.notice, Some(Notice::ExecutorFailure(_))));
        }
    }

    #[test]
    fn test_relieve_pressure_shrinks_batch() {
        let mut scheduler = scheduler(SchedulerConfig::default(), 4, 16);
        submit(&mut scheduler, 1, NewRequest::new(vec![1; 5]).priority(1));
        let mut low = submit(&mut scheduler, 2, NewRequest::new(vec![2; 5]));

        let batch = scheduler.select_batch();
        scheduler.relieve_pressure(&batch);
        assert_eq!(low.drain().pop().unwrap().notice, Some(Notice::Preempted));
        assert_eq!(scheduler.select_batch().len(), 1);
    }

    #[test]
    fn test_speculative_lookahead_capped_by_remaining_tokens() {
        let mut scheduler = scheduler(SchedulerConfig::default(), 4, 16).with_lookahead(4);
        submit(&mut scheduler, 1, NewRequest::new(vec![1, 2]).max_tokens(3));

        let batch = run_step(&mut scheduler, 7);
        assert_eq!(batch.entries[0].lookahead, 0);

        let batch = scheduler.select_batch();
        let entry = &batch.entries[0];
        assert_eq!(entry.lookahead, 1);
        assert_eq!(entry.token_ids, vec![7]);
        assert_eq!(entry.draft_token_ids, vec![1, 2, 7]);
        assert_eq!(entry.draft_start, 0);
        assert_eq!(batch.num_tokens(), 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut scheduler = scheduler(SchedulerConfig::default(), 4, 16);
        submit(&mut scheduler, 1, NewRequest::new(vec![1; 5]));
        run_step(&mut scheduler, 3);

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.running.len(), 1);
        assert_eq!(snapshot.sequences[0].output_len(), 1);
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: SchedulerSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.allocator, snapshot.allocator);
    }
}
