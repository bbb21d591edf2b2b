//! Tensor parallel shard coordinator.
//!
//! One worker thread per shard. For every layer boundary the coordinator
//! hands each worker the segment input, then blocks on a barrier until all
//! partial outputs have arrived or the collective timeout elapses, and
//! combines them with the boundary's collective.
//!
//! ```text
//!   run(input)
//!      │
//!      ▼  segment 0 on every shard        segment 1 on every shard
//!   ┌──────┐ ┌──────┐                    ┌──────┐ ┌──────┐
//!   │ r0   │ │ r1   │ ── gather ──►      │ r0   │ │ r1   │ ── reduce ──► output
//!   └──────┘ └──────┘                    └──────┘ └──────┘
//! ```
//!
//! Any shard failure is a failure of the whole group: the coordinator marks
//! itself faulted and refuses work until [`ShardCoordinator::restart`]
//! respawns every worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use candle_core::Tensor;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::parallel::shard::{Collective, GroupId, ShardContext, ShardWorker, WorkerFactory};

/// Counters for coordinator operations.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    /// Completed collectives.
    pub collectives: AtomicU64,
    /// Group faults.
    pub faults: AtomicU64,
    /// Group restarts.
    pub restarts: AtomicU64,
}

impl CoordinatorStats {
    pub fn snapshot(&self) -> CoordinatorStatsSnapshot {
        CoordinatorStatsSnapshot {
            collectives: self.collectives.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of coordinator statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStatsSnapshot {
    pub collectives: u64,
    pub faults: u64,
    pub restarts: u64,
}

/// Health of the shard group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Healthy,
    /// A shard failed; the group must be restarted.
    Faulted,
}

#[derive(Debug)]
struct BarrierState {
    partials: Vec<Option<Tensor>>,
    failures: Vec<(usize, Error)>,
    arrived: usize,
}

/// Rendezvous point of one collective.
#[derive(Debug)]
struct Barrier {
    segment: usize,
    state: Mutex<BarrierState>,
    ready: Condvar,
    expected: usize,
}

impl Barrier {
    fn new(segment: usize, expected: usize) -> Self {
        Self {
            segment,
            state: Mutex::new(BarrierState {
                partials: vec![None; expected],
                failures: Vec::new(),
                arrived: 0,
            }),
            ready: Condvar::new(),
            expected,
        }
    }

    fn arrive(&self, rank: usize, result: Result<Tensor>) {
        let mut state = self.state.lock();
        match result {
            Ok(partial) => {
                if let Some(slot) = state.partials.get_mut(rank) {
                    *slot = Some(partial);
                }
            }
            Err(err) => state.failures.push((rank, err)),
        }
        state.arrived += 1;
        if state.arrived >= self.expected {
            self.ready.notify_all();
        }
    }

    /// Wait for every shard, then hand back the partials in rank order.
    fn wait(&self, timeout: Duration) -> Result<Vec<Tensor>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.arrived < self.expected {
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        if let Some((rank, err)) = state.failures.drain(..).next() {
            return Err(match err {
                Error::ShardDesync(msg) => Error::ShardDesync(msg),
                other => Error::ExecutorFault(format!(
                    "shard {rank} failed in segment {}: {other}",
                    self.segment
                )),
            });
        }
        let missing: Vec<usize> = state
            .partials
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_none())
            .map(|(rank, _)| rank)
            .collect();
        if !missing.is_empty() {
            return Err(Error::ExecutorFault(format!(
                "shards {missing:?} missed the segment {} barrier after {timeout:?}",
                self.segment
            )));
        }
        Ok(state.partials.drain(..).flatten().collect())
    }
}

struct ShardJob {
    segment: usize,
    input: Tensor,
    barrier: Arc<Barrier>,
}

struct WorkerHandle {
    rank: usize,
    inbox: mpsc::UnboundedSender<ShardJob>,
    thread: Option<JoinHandle<()>>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}

fn worker_loop(
    ctx: Arc<ShardContext>,
    mut worker: Box<dyn ShardWorker>,
    mut inbox: mpsc::UnboundedReceiver<ShardJob>,
    num_segments: usize,
) {
    let mut expected_segment = 0;
    while let Some(job) = inbox.blocking_recv() {
        let result = if job.segment != expected_segment {
            Err(Error::ShardDesync(format!(
                "shard {} expected segment {expected_segment}, got {}",
                ctx.rank, job.segment
            )))
        } else {
            catch_unwind(AssertUnwindSafe(|| {
                worker.run_segment(&ctx, job.segment, &job.input)
            }))
            .unwrap_or_else(|payload| Err(Error::ExecutorFault(panic_message(payload.as_ref()))))
        };
        expected_segment = (job.segment + 1) % num_segments;
        job.barrier.arrive(ctx.rank, result);
    }
    debug!(rank = ctx.rank, group = ctx.group_id, "shard worker exiting");
}

fn combine(collective: Collective, partials: &[Tensor]) -> Result<Tensor> {
    let Some(first) = partials.first() else {
        return Err(Error::ExecutorFault("collective without partials".to_string()));
    };
    match collective {
        Collective::Reduce => {
            if let Some(bad) = partials.iter().position(|p| p.dims() != first.dims()) {
                return Err(Error::ShardDesync(format!(
                    "reduce: shard {bad} produced {:?}, shard 0 produced {:?}",
                    partials[bad].dims(),
                    first.dims()
                )));
            }
            let mut sum = first.clone();
            for partial in &partials[1..] {
                sum = sum.add(partial)?;
            }
            Ok(sum)
        }
        Collective::Gather { axis } => {
            let matches = |t: &Tensor| {
                t.rank() == first.rank()
                    && t.dims()
                        .iter()
                        .zip(first.dims())
                        .enumerate()
                        .all(|(i, (a, b))| i == axis || a == b)
            };
            if let Some(bad) = partials.iter().position(|p| !matches(p)) {
                return Err(Error::ShardDesync(format!(
                    "gather: shard {bad} produced {:?}, shard 0 produced {:?}",
                    partials[bad].dims(),
                    first.dims()
                )));
            }
            Ok(Tensor::cat(partials, axis)?)
        }
    }
}

/// Drives one group of shard workers through a sequence of collectives.
pub struct ShardCoordinator {
    group_id: GroupId,
    contexts: Vec<Arc<ShardContext>>,
    boundaries: Vec<Collective>,
    factory: WorkerFactory,
    timeout: Duration,
    workers: Vec<WorkerHandle>,
    status: GroupStatus,
    stats: CoordinatorStats,
}

impl ShardCoordinator {
    /// Spawn one worker per context.
    ///
    /// `boundaries[i]` combines the outputs of segment `i`.
    pub fn new(
        contexts: Vec<ShardContext>,
        boundaries: Vec<Collective>,
        factory: WorkerFactory,
        timeout: Duration,
    ) -> Result<Self> {
        let Some(group_id) = contexts.first().map(|c| c.group_id) else {
            return Err(Error::Config("a shard group needs at least one shard".to_string()));
        };
        if boundaries.is_empty() {
            return Err(Error::Config("a shard group needs at least one boundary".to_string()));
        }
        let mut coordinator = Self {
            group_id,
            contexts: contexts.into_iter().map(Arc::new).collect(),
            boundaries,
            factory,
            timeout,
            workers: Vec::new(),
            status: GroupStatus::Healthy,
            stats: CoordinatorStats::default(),
        };
        coordinator.workers = coordinator.spawn_workers()?;
        info!(
            group = group_id,
            world_size = coordinator.world_size(),
            "shard group started"
        );
        Ok(coordinator)
    }

    /// Number of shards.
    pub fn world_size(&self) -> usize {
        self.contexts.len()
    }

    /// Synchronization group identity.
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Current group health.
    pub fn status(&self) -> GroupStatus {
        self.status
    }

    /// Operation counters.
    pub fn stats(&self) -> CoordinatorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Push `input` through every segment and collective.
    ///
    /// # Errors
    ///
    /// [`Error::ExecutorFault`] if a shard fails, panics, disappears or
    /// misses a barrier; [`Error::ShardDesync`] if shards disagree on the
    /// segment or on partial shapes. Both leave the group faulted.
    pub fn run(&mut self, input: Tensor) -> Result<Tensor> {
        if self.status == GroupStatus::Faulted {
            return Err(Error::ExecutorFault(format!(
                "shard group {} is faulted and must be restarted",
                self.group_id
            )));
        }

        let mut activations = input;
        for segment in 0..self.boundaries.len() {
            let collective = self.boundaries[segment];
            let barrier = Arc::new(Barrier::new(segment, self.workers.len()));
            for worker in &self.workers {
                let job = ShardJob {
                    segment,
                    input: activations.clone(),
                    barrier: Arc::clone(&barrier),
                };
                if worker.inbox.send(job).is_err() {
                    let rank = worker.rank;
                    return Err(self.fault(Error::ExecutorFault(format!(
                        "shard {rank} is no longer running"
                    ))));
                }
            }
            let partials = match barrier.wait(self.timeout) {
                Ok(partials) => partials,
                Err(err) => return Err(self.fault(err)),
            };
            activations = match combine(collective, &partials) {
                Ok(combined) => combined,
                Err(err) => return Err(self.fault(err)),
            };
            self.stats.collectives.fetch_add(1, Ordering::Relaxed);
        }
        Ok(activations)
    }

    /// Replace every worker with a fresh one from the factory.
    pub fn restart(&mut self) -> Result<()> {
        self.stop_workers(false);
        self.workers = self.spawn_workers()?;
        self.status = GroupStatus::Healthy;
        self.stats.restarts.fetch_add(1, Ordering::Relaxed);
        info!(group = self.group_id, "shard group restarted");
        Ok(())
    }

    fn fault(&mut self, err: Error) -> Error {
        self.status = GroupStatus::Faulted;
        self.stats.faults.fetch_add(1, Ordering::Relaxed);
        error!(group = self.group_id, error = %err, "shard group faulted");
        err
    }

    fn spawn_workers(&self) -> Result<Vec<WorkerHandle>> {
        let num_segments = self.boundaries.len();
        self.contexts
            .iter()
            .map(|ctx| {
                let worker = (self.factory)(ctx)?;
                let (inbox, rx) = mpsc::unbounded_channel();
                let thread_ctx = Arc::clone(ctx);
                let thread = std::thread::Builder::new()
                    .name(format!("shard-{}-{}", ctx.group_id, ctx.rank))
                    .spawn(move || worker_loop(thread_ctx, worker, rx, num_segments))?;
                Ok(WorkerHandle {
                    rank: ctx.rank,
                    inbox,
                    thread: Some(thread),
                })
            })
            .collect()
    }

    /// Close every inbox. Healthy workers are joined; workers of a faulted
    /// group may be stuck and are left to exit on their own.
    fn stop_workers(&mut self, join: bool) {
        for mut worker in self.workers.drain(..) {
            drop(worker.inbox);
            if let Some(thread) = worker.thread.take() {
                if join {
                    if thread.join().is_err() {
                        warn!(rank = worker.rank, "shard worker panicked during shutdown");
                    }
                } else if !thread.is_finished() {
                    debug!(rank = worker.rank, "detaching shard worker");
                }
            }
        }
    }
}

impl Drop for ShardCoordinator {
    fn drop(&mut self) {
        let join = self.status == GroupStatus::Healthy;
        self.stop_workers(join);
    }
}

impl std::fmt::Debug for ShardCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardCoordinator")
            .field("group_id", &self.group_id)
            .field("world_size", &self.contexts.len())
            .field("boundaries", &self.boundaries)
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    /// Returns its rank, as a `[1, 1]` tensor, for every segment.
    #[derive(Default)]
    struct RankWorker;

    impl ShardWorker for RankWorker {
        fn run_segment(&mut self, ctx: &ShardContext, _segment: usize, input: &Tensor) -> Result<Tensor> {
            Ok(input.affine(0.0, ctx.rank as f64)?)
        }
    }

    #[derive(Default)]
    struct PanicWorker;

    impl ShardWorker for PanicWorker {
        fn run_segment(&mut self, _ctx: &ShardContext, _segment: usize, _input: &Tensor) -> Result<Tensor> {
            panic!("boom");
        }
    }

    fn contexts(world_size: usize) -> Vec<ShardContext> {
        (0..world_size)
            .map(|rank| ShardContext {
                rank,
                world_size,
                group_id: 1,
                partitions: Vec::new(),
            })
            .collect()
    }

    fn factory<W: ShardWorker + Default + 'static>() -> WorkerFactory {
        Arc::new(|_ctx: &ShardContext| -> Result<Box<dyn ShardWorker>> { Ok(Box::new(W::default())) })
    }

    fn one() -> Tensor {
        Tensor::ones((1, 1), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_reduce_sums_ranks() {
        let mut coordinator =
            ShardCoordinator::new(contexts(4), vec![Collective::Reduce], factory::<RankWorker>(), Duration::from_secs(5))
                .unwrap();
        let out: Vec<Vec<f32>> = coordinator.run(one()).unwrap().to_vec2().unwrap();
        assert_eq!(out, vec![vec![6.0]]);
        assert_eq!(coordinator.stats().collectives, 1);
    }

    #[test]
    fn test_gather_concatenates_in_rank_order() {
        let mut coordinator = ShardCoordinator::new(
            contexts(3),
            vec![Collective::Gather { axis: 1 }],
            factory::<RankWorker>(),
            Duration::from_secs(5),
        )
        .unwrap();
        let out: Vec<Vec<f32>> = coordinator.run(one()).unwrap().to_vec2().unwrap();
        assert_eq!(out, vec![vec![0.0, 1.0, 2.0]]);
    }

    #[test]
    fn test_panic_faults_group_until_restart() {
        let flaky: WorkerFactory = {
            let spawned = Arc::new(AtomicU64::new(0));
            Arc::new(move |ctx: &ShardContext| -> Result<Box<dyn ShardWorker>> {
                // Rank 1 of the first generation panics.
                let n = spawned.fetch_add(1, Ordering::SeqCst);
                if ctx.rank == 1 && n < 2 {
                    Ok(Box::new(PanicWorker))
                } else {
                    Ok(Box::new(RankWorker))
                }
            })
        };
        let mut coordinator =
            ShardCoordinator::new(contexts(2), vec![Collective::Reduce], flaky, Duration::from_secs(5)).unwrap();

        let err = coordinator.run(one()).unwrap_err();
        assert!(matches!(err, Error::ExecutorFault(ref msg) if msg.contains("boom")));
        assert_eq!(coordinator.status(), GroupStatus::Faulted);
        assert!(coordinator.run(one()).is_err());

        coordinator.restart().unwrap();
        assert_eq!(coordinator.status(), GroupStatus::Healthy);
        let out: Vec<Vec<f32>> = coordinator.run(one()).unwrap().to_vec2().unwrap();
        assert_eq!(out, vec![vec![1.0]]);
        assert_eq!(coordinator.stats().restarts, 1);
    }

    #[test]
    fn test_mismatched_partials_are_desync() {
        struct RaggedWorker;
        impl ShardWorker for RaggedWorker {
            fn run_segment(&mut self, ctx: &ShardContext, _segment: usize, _input: &Tensor) -> Result<Tensor> {
                Ok(Tensor::zeros((1, ctx.rank + 1), DType::F32, &Device::Cpu)?)
            }
        }
        let ragged: WorkerFactory =
            Arc::new(|_ctx: &ShardContext| -> Result<Box<dyn ShardWorker>> { Ok(Box::new(RaggedWorker)) });
        let mut coordinator =
            ShardCoordinator::new(contexts(2), vec![Collective::Reduce], ragged, Duration::from_secs(5)).unwrap();
        assert!(matches!(coordinator.run(one()), Err(Error::ShardDesync(_))));
    }

    #[test]
    fn test_slow_shard_misses_barrier() {
        struct SlowWorker;
        impl ShardWorker for SlowWorker {
            fn run_segment(&mut self, ctx: &ShardContext, _segment: usize, input: &Tensor) -> Result<Tensor> {
                if ctx.rank == 0 {
                    std::thread::sleep(Duration::from_millis(300));
                }
                Ok(input.clone())
            }
        }
        let slow: WorkerFactory =
            Arc::new(|_ctx: &ShardContext| -> Result<Box<dyn ShardWorker>> { Ok(Box::new(SlowWorker)) });
        let mut coordinator =
            ShardCoordinator::new(contexts(2), vec![Collective::Reduce], slow, Duration::from_millis(50)).unwrap();
        let err = coordinator.run(one()).unwrap_err();
        assert!(matches!(err, Error::ExecutorFault(ref msg) if msg.contains("[0]")));
    }
}
