//! Client-facing request types.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::SamplingConfig;
use crate::core::sequence::{Priority, DEFAULT_PRIORITY};

/// Unique identifier for a request.
pub type RequestId = u64;

/// Why a sample or request stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// A stop token was emitted.
    Stop,
    /// `max_tokens` tokens were emitted.
    Length,
    /// Cancelled by the client, a timeout, or shutdown.
    Cancelled,
    /// Executor failure or preemption.
    Error,
}

impl FinishReason {
    /// Get the reason as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    /// Terminal request state this reason leads to.
    pub fn terminal_state(&self) -> RequestState {
        match self {
            Self::Stop | Self::Length => RequestState::Finished,
            Self::Cancelled => RequestState::Cancelled,
            Self::Error => RequestState::Errored,
        }
    }
}

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    /// Accepted, no sequence scheduled yet.
    Queued,
    /// At least one sequence has been scheduled.
    Active,
    Finished,
    Cancelled,
    Errored,
}

impl RequestState {
    /// Check if the request reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::Errored)
    }
}

/// Out-of-band information attached to a stream event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Notice {
    /// The sample was evicted under page pressure and aborted.
    Preempted,
    /// The sample was evicted and will be recomputed; `count` so far.
    Suspended { count: usize },
    /// The request exceeded its wall-clock or step limit.
    TimedOut,
    /// Speculative decoding was turned off for the sample.
    SpeculationDisabled,
    /// The model executor failed while running the sample.
    ExecutorFailure(String),
    /// The sample's logits could not be turned into a token.
    SamplingFailure(String),
    /// No step could make progress on the sample.
    Stalled,
    /// The engine shut down.
    Shutdown,
}

/// One item of a request's output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub request_id: RequestId,
    /// Sample index within the request (0 for `n = 1`).
    pub sample: usize,
    pub token: Option<u32>,
    /// Set on exactly one event per request: the last one.
    pub is_final: bool,
    /// Set when `sample` (or the whole request, if final) stopped.
    pub finish_reason: Option<FinishReason>,
    pub notice: Option<Notice>,
}

impl StreamEvent {
    /// A generated token.
    pub fn token(request_id: RequestId, sample: usize, token: u32) -> Self {
        Self {
            request_id,
            sample,
            token: Some(token),
            is_final: false,
            finish_reason: None,
            notice: None,
        }
    }

    /// A notice without a token.
    pub fn notice(request_id: RequestId, sample: usize, notice: Notice) -> Self {
        Self {
            request_id,
            sample,
            token: None,
            is_final: false,
            finish_reason: None,
            notice: Some(notice),
        }
    }

    /// The terminal event of a request that did not end on a token.
    pub fn terminal(
        request_id: RequestId,
        sample: usize,
        reason: FinishReason,
        notice: Option<Notice>,
    ) -> Self {
        Self {
            request_id,
            sample,
            token: None,
            is_final: true,
            finish_reason: Some(reason),
            notice,
        }
    }
}

/// A generation request as submitted by a client.
///
/// # Example
///
/// ```
/// use nano_serve::core::request::NewRequest;
///
/// let request = NewRequest::new(vec![1, 2, 3])
///     .max_tokens(16)
///     .priority(2)
///     .n(3);
/// assert_eq!(request.sampling.max_tokens, 16);
/// ```
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub prompt_token_ids: Vec<u32>,
    pub sampling: SamplingConfig,
    pub priority: Priority,
    /// Number of parallel samples.
    pub n: usize,
    /// Wall-clock limit from admission.
    pub timeout: Option<Duration>,
    /// Engine-step limit from admission.
    pub max_steps: Option<u64>,
}

impl NewRequest {
    /// Create a request with default sampling.
    pub fn new(prompt_token_ids: Vec<u32>) -> Self {
        Self {
            prompt_token_ids,
            sampling: SamplingConfig::default(),
            priority: DEFAULT_PRIORITY,
            n: 1,
            timeout: None,
            max_steps: None,
        }
    }

    /// Set the sampling configuration.
    pub fn sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    /// Set the maximum number of generated tokens per sample.
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.sampling.max_tokens = max_tokens;
        self
    }

    /// Set the scheduling priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the number of parallel samples.
    pub fn n(mut self, n: usize) -> Self {
        self.n = n;
        self
    }

    /// Cancel the request after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cancel the request after `max_steps` engine steps.
    pub fn max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Upper bound on the number of events this request can produce.
    ///
    /// Each sample emits at most `max_tokens` tokens, one notice per
    /// suspension and one speculation notice; the request adds one terminal
    /// event.
    pub fn max_events(&self, max_suspensions: usize) -> usize {
        let per_sample = self
            .sampling
            .max_tokens
            .saturating_add(max_suspensions)
            .saturating_add(1);
        self.n.saturating_mul(per_sample).saturating_add(1)
    }
}

/// Scheduler-side record of an accepted request.
#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: RequestId,
    pub prompt_token_ids: Vec<u32>,
    pub sampling: SamplingConfig,
    pub priority: Priority,
    pub n: usize,
    pub arrival_time: Instant,
    pub deadline: Option<Instant>,
    pub max_steps: Option<u64>,
    pub state: RequestState,
}

impl Request {
    /// Record an accepted request.
    pub fn new(request_id: RequestId, new: NewRequest) -> Self {
        let arrival_time = Instant::now();
        Self {
            request_id,
            prompt_token_ids: new.prompt_token_ids,
            sampling: new.sampling,
            priority: new.priority,
            n: new.n.max(1),
            arrival_time,
            deadline: new.timeout.map(|t| arrival_time + t),
            max_steps: new.max_steps,
            state: RequestState::Queued,
        }
    }
}

/// Everything a request streamed, folded per sample.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestOutput {
    pub request_id: RequestId,
    /// Generated tokens, indexed by sample.
    pub samples: Vec<Vec<u32>>,
    /// Finish reason of every sample that reported one.
    pub finish_reasons: Vec<Option<FinishReason>>,
    pub notices: Vec<Notice>,
    /// Reason carried by the request's final event.
    pub finish_reason: Option<FinishReason>,
}

impl RequestOutput {
    /// Fold a stream of events belonging to one request.
    pub fn from_events<'a>(
        request_id: RequestId,
        events: impl IntoIterator<Item = &'a StreamEvent>,
    ) -> Self {
        let mut output = Self {
            request_id,
            ..Default::default()
        };
        for event in events {
            output.push(event);
        }
        output
    }

    /// Fold one event.
    pub fn push(&mut self, event: &StreamEvent) {
        if self.samples.len() <= event.sample {
            self.samples.resize(event.sample + 1, Vec::new());
            self.finish_reasons.resize(event.sample + 1, None);
        }
        if let Some(token) = event.token {
            self.samples[event.sample].push(token);
        }
        if let Some(reason) = event.finish_reason {
            if event.token.is_some() {
                self.finish_reasons[event.sample] = Some(reason);
            }
            if event.is_final {
                self.finish_reason = Some(reason);
            }
        }
        if let Some(notice) = &event.notice {
            self.notices.push(notice.clone());
        }
    }

    /// Whether the final event was seen.
    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Tokens of the first sample.
    pub fn tokens(&self) -> &[u32] {
        self.samples.first().map(Vec::as_slice).unwrap_or_default()
    }
}
