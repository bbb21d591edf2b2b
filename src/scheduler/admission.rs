//! Request admission.
//!
//! Clients talk to the engine through an [`EngineClient`]. `accept` checks a
//! request against the engine's limits, takes a slot in the bounded
//! admission queue and hands back a [`RequestHandle`] streaming the
//! request's events. A full queue is refused synchronously; nothing is
//! created for a refused request.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::core::page::pages_needed;
use crate::core::request::{NewRequest, Request, RequestId, RequestOutput, StreamEvent};
use crate::error::{Capacity, Error, Result};

/// A validated request on its way to the scheduler.
#[derive(Debug)]
pub struct Admission {
    pub request: Request,
    pub events: mpsc::Sender<StreamEvent>,
    pub cancel: CancellationToken,
}

impl Admission {
    /// Pair an admission with the handle its client keeps.
    ///
    /// `event_capacity` must cover every event the request can produce.
    pub fn new(request: Request, event_capacity: usize) -> (Self, RequestHandle) {
        let (events, receiver) = mpsc::channel(event_capacity.max(1));
        let cancel = CancellationToken::new();
        let handle = RequestHandle {
            request_id: request.request_id,
            events: receiver,
            cancel: cancel.clone(),
        };
        (
            Self {
                request,
                events,
                cancel,
            },
            handle,
        )
    }
}

/// Client side of one request.
#[derive(Debug)]
pub struct RequestHandle {
    request_id: RequestId,
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

impl RequestHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Ask the engine to stop this request at its next step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this request.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the next event; `None` once the engine dropped the stream.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Next event if one is ready.
    pub fn try_next_event(&mut self) -> Option<StreamEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// All events ready right now.
    pub fn drain(&mut self) -> Vec<StreamEvent> {
        std::iter::from_fn(|| self.try_next_event()).collect()
    }

    /// Wait for the final event and fold the whole stream.
    pub async fn collect(mut self) -> RequestOutput {
        let mut output = RequestOutput {
            request_id: self.request_id,
            ..Default::default()
        };
        while let Some(event) = self.events.recv().await {
            output.push(&event);
            if event.is_final {
                break;
            }
        }
        output
    }
}

/// Limits a request is validated against at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub vocab_size: usize,
    pub max_model_len: usize,
    pub page_size: usize,
    pub num_pages: usize,
    pub max_queued_requests: usize,
    pub max_suspensions: usize,
}

impl AdmissionLimits {
    pub fn new(config: &EngineConfig, vocab_size: usize) -> Self {
        Self {
            vocab_size,
            max_model_len: config.scheduler.max_model_len,
            page_size: config.cache.page_size,
            num_pages: config.cache.num_pages,
            max_queued_requests: config.scheduler.max_queued_requests,
            max_suspensions: config.scheduler.max_suspensions,
        }
    }

    /// Check a request against these limits.
    pub fn validate(&self, request: &NewRequest) -> Result<()> {
        let prompt_len = request.prompt_token_ids.len();
        let max_tokens = request.sampling.max_tokens;
        if prompt_len == 0 {
            return Err(Error::InvalidRequest("prompt is empty".to_string()));
        }
        if max_tokens == 0 {
            return Err(Error::InvalidRequest("max_tokens must be at least 1".to_string()));
        }
        if request.n == 0 {
            return Err(Error::InvalidRequest("n must be at least 1".to_string()));
        }
        request.sampling.validate()?;
        if let Some(&token) = request
            .prompt_token_ids
            .iter()
            .find(|&&t| t as usize >= self.vocab_size)
        {
            return Err(Error::InvalidRequest(format!(
                "token {token} outside vocabulary of {}",
                self.vocab_size
            )));
        }
        let total_len = match prompt_len.checked_add(max_tokens) {
            Some(len) if len <= self.max_model_len => len,
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "prompt ({prompt_len}) plus max_tokens ({max_tokens}) exceeds max_model_len ({})",
                    self.max_model_len
                )))
            }
        };
        match request.n.checked_mul(pages_needed(total_len, self.page_size)) {
            Some(pages) if pages <= self.num_pages => Ok(()),
            _ => Err(Error::InvalidRequest(format!(
                "{} samples of {total_len} tokens need more than the {} pages of the pool",
                request.n, self.num_pages
            ))),
        }
    }
}

/// Cloneable handle for submitting requests to an engine.
#[derive(Debug, Clone)]
pub struct EngineClient {
    sender: mpsc::Sender<Admission>,
    queued: Arc<AtomicUsize>,
    next_request_id: Arc<AtomicU64>,
    limits: AdmissionLimits,
}

impl EngineClient {
    pub(crate) fn new(
        sender: mpsc::Sender<Admission>,
        queued: Arc<AtomicUsize>,
        limits: AdmissionLimits,
    ) -> Self {
        Self {
            sender,
            queued,
            next_request_id: Arc::new(AtomicU64::new(1)),
            limits,
        }
    }

    /// Validate `request` and queue it for scheduling.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] if the request can never be served
    /// - [`Error::CapacityExceeded`] if the admission queue is full
    /// - [`Error::Shutdown`] if the engine is gone
    ///
    /// A refused request consumes no id and leaves no state behind.
    pub fn accept(&self, request: NewRequest) -> Result<RequestHandle> {
        self.limits.validate(&request)?;

        let limit = self.limits.max_queued_requests;
        let full = Error::CapacityExceeded(Capacity::AdmissionQueue { limit });
        if self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_err()
        {
            return Err(full);
        }
        let permit = match self.sender.try_reserve() {
            Ok(permit) => permit,
            Err(err) => {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                return Err(match err {
                    TrySendError::Full(()) => full,
                    TrySendError::Closed(()) => Error::Shutdown,
                });
            }
        };

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let capacity = request.max_events(self.limits.max_suspensions);
        let (admission, handle) = Admission::new(Request::new(request_id, request), capacity);
        permit.send(admission);
        Ok(handle)
    }

    /// Requests accepted but not yet running.
    pub fn num_queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Limits requests are validated against.
    pub fn limits(&self) -> AdmissionLimits {
        self.limits
    }

    /// Whether the engine stopped receiving requests.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
