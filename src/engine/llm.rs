//! Serving engine.
//!
//! The Engine owns every component of the control loop:
//! - PageAllocator for the paged KV cache
//! - Scheduler for admission, batch selection and commits
//! - BatchExecutor (and optionally a SpeculativeController) for execution
//!
//! ## Engine Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!      EngineClient::accept  │    step()
//!                ▼           │           ▼
//!         ┌──────────┐       │    ┌──────────────┐
//!         │ Validate │       │    │  Admissions  │
//!         │  + queue │ ─────────► │   drained    │
//!         └──────────┘       │    └──────────────┘
//!                            │           │
//!                            │           ▼
//!                            │    ┌──────────────┐
//!                            │    │  Scheduler   │
//!                            │    │ select_batch │
//!                            │    └──────────────┘
//!                            │           │
//!                            │           ▼
//!                            │    ┌──────────────┐
//!                            │    │   Executor   │
//!                            │    │ (speculate)  │
//!                            │    └──────────────┘
//!                            │           │
//!                            │     ok    │   capacity / fault
//!                            │           ▼
//!                            │    ┌──────────────┐
//!                            │    │   commit /   │
//!                            │    │ relieve/fail │
//!                            │    └──────────────┘
//! ```

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::batch::BatchExecutor;
use crate::config::EngineConfig;
use crate::core::allocator::PageAllocator;
use crate::core::request::{FinishReason, NewRequest, Notice};
use crate::error::{Error, Result};
use crate::model::{build_executor, ModelExecutor};
use crate::scheduler::admission::{Admission, AdmissionLimits, EngineClient, RequestHandle};
use crate::scheduler::batch::{Scheduler, SchedulerSnapshot};
use crate::speculative::{SpeculationStats, SpeculativeController};

/// What a step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Nothing was schedulable.
    Idle,
    /// The batch ran and was committed.
    Executed,
    /// The executor ran out of memory; the batch was shrunk for next time.
    Deferred,
    /// The batch failed and its requests were terminated.
    Failed,
}

/// Summary of one engine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: u64,
    pub outcome: StepOutcome,
    /// Sequences in the batch.
    pub num_seqs: usize,
    /// Tokens fed to the target executor, lookahead included.
    pub num_tokens: usize,
    /// Tokens appended across all sequences.
    pub emitted_tokens: usize,
}

impl StepReport {
    fn idle(step: u64) -> Self {
        Self {
            step,
            outcome: StepOutcome::Idle,
            num_seqs: 0,
            num_tokens: 0,
            emitted_tokens: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.outcome == StepOutcome::Idle
    }
}

/// Continuous-batching serving engine.
pub struct Engine {
    config: EngineConfig,
    /// Target executor.
    executor: BatchExecutor,
    /// Draft-verify controller when speculative decoding is on.
    speculative: Option<SpeculativeController>,
    scheduler: Scheduler,
    admissions: mpsc::Receiver<Admission>,
    client: EngineClient,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("executor", &self.executor)
            .field("speculative", &self.speculative)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl Engine {
    /// Build an engine and the executors its configuration describes.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let target = build_executor(&config.model, &config.cache, &config.parallel)?;
        let draft = match &config.speculative {
            Some(spec) => Some(build_executor(
                &spec.draft_model,
                &config.cache,
                &Default::default(),
            )?),
            None => None,
        };
        Self::with_executors(config, target, draft)
    }

    /// Build an engine around existing executors.
    ///
    /// `draft` is used only when `config.speculative` is set.
    pub fn with_executors(
        config: EngineConfig,
        target: Box<dyn ModelExecutor>,
        draft: Option<Box<dyn ModelExecutor>>,
    ) -> Result<Self> {
        config.validate()?;
        check_executor("target", target.as_ref(), &config)?;

        let speculative = match (&config.speculative, draft) {
            (Some(spec), Some(draft)) => {
                check_executor("draft", draft.as_ref(), &config)?;
                if draft.vocab_size() != target.vocab_size() {
                    return Err(Error::Config(format!(
                        "draft vocab {} differs from target vocab {}",
                        draft.vocab_size(),
                        target.vocab_size()
                    )));
                }
                Some(SpeculativeController::new(draft, spec))
            }
            (Some(_), None) => {
                return Err(Error::Config(
                    "speculative decoding needs a draft executor".to_string(),
                ))
            }
            (None, _) => None,
        };
        let lookahead = speculative
            .as_ref()
            .map_or(0, SpeculativeController::num_speculative_tokens);

        let allocator = Arc::new(PageAllocator::from_config(&config.cache));
        let scheduler = Scheduler::new(config.scheduler.clone(), allocator).with_lookahead(lookahead);
        let (sender, admissions) = mpsc::channel(config.scheduler.max_queued_requests);
        let limits = AdmissionLimits::new(&config, target.vocab_size());
        let client = EngineClient::new(sender, scheduler.queue_counter(), limits);

        info!(
            architecture = ?config.model.architecture,
            vocab_size = target.vocab_size(),
            page_size = config.cache.page_size,
            num_pages = config.cache.num_pages,
            tensor_parallel_size = config.parallel.tensor_parallel_size,
            speculative_tokens = lookahead,
            "engine ready"
        );

        Ok(Self {
            config,
            executor: BatchExecutor::new(target),
            speculative,
            scheduler,
            admissions,
            client,
        })
    }

    /// Handle for submitting requests, cloneable across threads.
    pub fn client(&self) -> EngineClient {
        self.client.clone()
    }

    /// Submit a request through this engine's own client.
    pub fn add_request(&self, request: NewRequest) -> Result<RequestHandle> {
        self.client.accept(request)
    }

    /// Run one step: admit, select, execute, commit.
    ///
    /// Executor failures are handled here: the affected requests receive
    /// their terminal events and the executors are recovered. Only a failed
    /// recovery is returned as an error.
    pub fn step(&mut self) -> Result<StepReport> {
        self.admit_pending();

        let batch = self.scheduler.select_batch();
        if batch.is_empty() {
            self.release_retired();
            return Ok(StepReport::idle(batch.step));
        }
        debug!(
            step = batch.step,
            seqs = batch.len(),
            tokens = batch.num_tokens(),
            copies = batch.copies.len(),
            "executing batch"
        );

        let result = match &mut self.speculative {
            Some(controller) => controller.execute(&batch, &mut self.executor),
            None => self.executor.execute(&batch),
        };

        let mut report = StepReport {
            step: batch.step,
            outcome: StepOutcome::Executed,
            num_seqs: batch.len(),
            num_tokens: batch.num_tokens(),
            emitted_tokens: 0,
        };
        match result {
            Ok(outputs) => {
                report.emitted_tokens = outputs
                    .iter()
                    .map(|o| o.new_tokens.len() + o.fork_tokens.len())
                    .sum();
                self.scheduler.commit(outputs);
            }
            Err(err) if err.is_capacity() => {
                warn!(step = batch.step, %err, "executor refused batch");
                self.scheduler.relieve_pressure(&batch);
                report.outcome = StepOutcome::Deferred;
            }
            Err(err) => {
                error!(step = batch.step, %err, "step failed");
                self.scheduler.fail_batch(&batch, &err);
                report.outcome = StepOutcome::Failed;
                if err.is_fatal_for_batch() {
                    self.recover()?;
                }
            }
        }

        self.release_retired();
        Ok(report)
    }

    /// Step until no request is left.
    ///
    /// Returns the number of steps taken.
    pub fn run_until_idle(&mut self) -> Result<u64> {
        let mut steps = 0;
        while self.has_work() {
            let report = self.step()?;
            steps += 1;
            if report.is_idle() {
                self.fail_stalled();
                break;
            }
        }
        Ok(steps)
    }

    /// Whether any request is queued or in flight.
    pub fn has_work(&self) -> bool {
        self.scheduler.has_unfinished_requests() || !self.admissions.is_empty()
    }

    /// Finish every outstanding request with `error` after an idle step.
    ///
    /// A step that selects nothing while requests remain cannot be followed
    /// by one that does: every resident sample waits on pages that only
    /// eviction could free. Returns the number of requests failed.
    pub fn fail_stalled(&mut self) -> usize {
        let stalled = self.scheduler.num_requests();
        if stalled == 0 {
            return 0;
        }
        warn!(requests = stalled, "no schedulable work left, failing requests");
        self.scheduler
            .abort_all(FinishReason::Error, Some(Notice::Stalled));
        self.release_retired();
        stalled
    }

    /// Stop accepting requests and finish every outstanding one with
    /// `cancelled`.
    pub fn shutdown(&mut self) {
        self.admissions.close();
        self.admit_pending();
        self.scheduler
            .abort_all(FinishReason::Cancelled, Some(Notice::Shutdown));
        self.release_retired();
        info!(stats = ?self.scheduler.stats(), "engine shut down");
    }

    /// Wait for the next admission and hand it to the scheduler.
    ///
    /// Returns `false` once no client can submit anymore.
    pub(crate) async fn wait_for_admission(&mut self) -> bool {
        match self.admissions.recv().await {
            Some(admission) => {
                self.scheduler.add_request(admission);
                true
            }
            None => false,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn allocator(&self) -> &Arc<PageAllocator> {
        self.scheduler.allocator()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Counters of the speculative controller, if speculation is on.
    pub fn speculation_stats(&self) -> Option<SpeculationStats> {
        self.speculative.as_ref().map(SpeculativeController::stats)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.scheduler.snapshot()
    }

    fn admit_pending(&mut self) {
        while let Ok(admission) = self.admissions.try_recv() {
            self.scheduler.add_request(admission);
        }
    }

    fn release_retired(&mut self) {
        for seq_id in self.scheduler.drain_retired() {
            self.executor.release(seq_id);
            if let Some(controller) = &mut self.speculative {
                controller.release(seq_id);
            }
        }
    }

    fn recover(&mut self) -> Result<()> {
        self.executor.recover()?;
        if let Some(controller) = &mut self.speculative {
            controller.recover()?;
        }
        info!("executors recovered");
        Ok(())
    }
}

fn check_executor(role: &str, executor: &dyn ModelExecutor, config: &EngineConfig) -> Result<()> {
    let shape = executor.cache_shape();
    if !shape.fits(&config.cache) {
        return Err(Error::Config(format!(
            "{role} executor cache {shape:?} cannot hold a pool of {} pages of {} tokens",
            config.cache.num_pages, config.cache.page_size
        )));
    }
    Ok(())
}
