//! End-to-end tests of the engine control loop.

use nano_serve::model::{CacheShape, ExecutorBatch, ExecutorOutput, ModelExecutor, ToyExecutor};
use nano_serve::{
    Architecture, Capacity, Engine, EngineConfig, EngineService, Error, FinishReason, ModelConfig,
    NewRequest, Notice, PreemptionMode, RequestHandle, RequestOutput, Result, SamplingConfig,
};

fn successor_config(page_size: usize, num_pages: usize) -> EngineConfig {
    let mut config = EngineConfig::default().cache(page_size, num_pages);
    config.model = ModelConfig::new(Architecture::Successor, 64);
    config
}

fn output(handle: &mut RequestHandle) -> RequestOutput {
    RequestOutput::from_events(handle.request_id(), &handle.drain())
}

#[test]
fn test_short_request_is_not_blocked_by_long_one() {
    let mut engine = Engine::new(successor_config(4, 256)).unwrap();
    let mut long = engine
        .add_request(NewRequest::new(vec![0]).sampling(SamplingConfig::greedy(500)))
        .unwrap();
    for _ in 0..10 {
        engine.step().unwrap();
    }

    let mut short = engine
        .add_request(NewRequest::new(vec![10]).sampling(SamplingConfig::greedy(500).stop_token(15)))
        .unwrap();
    let mut steps = 0;
    loop {
        engine.step().unwrap();
        steps += 1;
        let events = short.drain();
        if events.iter().any(|e| e.is_final) {
            let out = RequestOutput::from_events(short.request_id(), &events);
            assert_eq!(out.tokens(), &[11, 12, 13, 14, 15]);
            assert_eq!(out.finish_reason, Some(FinishReason::Stop));
            break;
        }
        assert!(steps < 6, "short request took more than 6 steps");
    }

    let long_out = output(&mut long);
    assert!(!long_out.is_finished());
    assert_eq!(long_out.tokens().len(), 10 + steps);
}

#[test]
fn test_parallel_samples_share_one_final_event() {
    let mut config = EngineConfig::default().cache(4, 64);
    config.model = ModelConfig::new(Architecture::Bigram, 64).seed(3);
    let mut engine = Engine::new(config).unwrap();

    let sampling = SamplingConfig {
        max_tokens: 6,
        seed: Some(11),
        ..Default::default()
    };
    let mut handle = engine
        .add_request(NewRequest::new(vec![5, 6, 7, 8, 9]).sampling(sampling).n(3))
        .unwrap();
    engine.run_until_idle().unwrap();

    let events = handle.drain();
    assert_eq!(events.iter().filter(|e| e.is_final).count(), 1);
    assert!(events.last().unwrap().is_final);
    let out = RequestOutput::from_events(handle.request_id(), &events);
    assert_eq!(out.samples.len(), 3);
    assert!(out.samples.iter().all(|s| s.len() == 6));
    assert!(out
        .finish_reasons
        .iter()
        .all(|r| *r == Some(FinishReason::Length)));
    assert_eq!(engine.allocator().num_free_pages(), 64);
}

#[test]
fn test_seeded_requests_are_reproducible() {
    let run = || {
        let mut config = EngineConfig::default().cache(4, 64);
        config.model = ModelConfig::new(Architecture::Bigram, 64).seed(3);
        let mut engine = Engine::new(config).unwrap();
        let sampling = SamplingConfig {
            temperature: 0.9,
            top_p: 0.9,
            max_tokens: 12,
            seed: Some(99),
            ..Default::default()
        };
        let mut handle = engine
            .add_request(NewRequest::new(vec![1, 2, 3]).sampling(sampling))
            .unwrap();
        engine.run_until_idle().unwrap();
        output(&mut handle).tokens().to_vec()
    };
    assert_eq!(run(), run());
}

#[test]
fn test_step_limit_times_out() {
    let mut engine = Engine::new(successor_config(4, 64)).unwrap();
    let mut handle = engine
        .add_request(
            NewRequest::new(vec![1])
                .sampling(SamplingConfig::greedy(100))
                .max_steps(3),
        )
        .unwrap();
    engine.run_until_idle().unwrap();

    let out = output(&mut handle);
    assert_eq!(out.finish_reason, Some(FinishReason::Cancelled));
    assert!(out.notices.contains(&Notice::TimedOut));
    assert!(out.tokens().len() <= 4);
    assert_eq!(engine.allocator().num_free_pages(), 64);
}

#[test]
fn test_cancel_frees_pages_within_one_step() {
    let mut engine = Engine::new(successor_config(4, 64)).unwrap();
    let mut handle = engine
        .add_request(NewRequest::new(vec![1; 9]).sampling(SamplingConfig::greedy(50)))
        .unwrap();
    engine.step().unwrap();
    engine.step().unwrap();
    assert!(engine.allocator().num_free_pages() < 64);

    handle.cancel();
    engine.step().unwrap();
    assert_eq!(engine.allocator().num_free_pages(), 64);

    let events = handle.drain();
    let cancelled: Vec<_> = events
        .iter()
        .filter(|e| e.finish_reason == Some(FinishReason::Cancelled))
        .collect();
    assert_eq!(cancelled.len(), 1);
    assert!(cancelled[0].is_final);
    assert!(!engine.has_work());
}

#[test]
fn test_suspended_sequence_resumes_where_it_stopped() {
    let mut config = successor_config(4, 6);
    config.scheduler.preemption_mode = PreemptionMode::Suspend;
    let mut engine = Engine::new(config).unwrap();

    let mut low = engine
        .add_request(
            NewRequest::new((0..8).collect())
                .sampling(SamplingConfig::greedy(8))
                .priority(0),
        )
        .unwrap();
    let mut high = engine
        .add_request(
            NewRequest::new((20..28).collect())
                .sampling(SamplingConfig::greedy(8))
                .priority(1),
        )
        .unwrap();
    engine.run_until_idle().unwrap();

    let low = output(&mut low);
    let high = output(&mut high);
    assert_eq!(low.tokens(), (8..16).collect::<Vec<u32>>().as_slice());
    assert_eq!(high.tokens(), (28..36).collect::<Vec<u32>>().as_slice());
    assert_eq!(low.finish_reason, Some(FinishReason::Length));
    assert_eq!(high.finish_reason, Some(FinishReason::Length));
    assert!(low
        .notices
        .iter()
        .any(|n| matches!(n, Notice::Suspended { .. })));
    assert!(engine.scheduler().stats().suspensions >= 1);
    assert_eq!(engine.allocator().num_free_pages(), 6);
}

#[test]
fn test_aborted_preemption_is_reported() {
    let mut engine = Engine::new(successor_config(4, 6)).unwrap();
    let mut low = engine
        .add_request(
            NewRequest::new((0..8).collect())
                .sampling(SamplingConfig::greedy(8))
                .priority(0),
        )
        .unwrap();
    let mut high = engine
        .add_request(
            NewRequest::new((20..28).collect())
                .sampling(SamplingConfig::greedy(8))
                .priority(1),
        )
        .unwrap();
    engine.run_until_idle().unwrap();

    let low = output(&mut low);
    let high = output(&mut high);
    assert_eq!(high.finish_reason, Some(FinishReason::Length));
    assert_eq!(low.finish_reason, Some(FinishReason::Error));
    assert!(low.notices.contains(&Notice::Preempted));
    assert_eq!(engine.scheduler().stats().preemptions, 1);
}

#[test]
fn test_full_admission_queue_is_refused() {
    let mut config = successor_config(4, 64);
    config.scheduler.max_queued_requests = 2;
    let mut engine = Engine::new(config).unwrap();

    let request = || NewRequest::new(vec![1]).sampling(SamplingConfig::greedy(2));
    let mut handles = vec![
        engine.add_request(request()).unwrap(),
        engine.add_request(request()).unwrap(),
    ];
    assert!(matches!(
        engine.add_request(request()),
        Err(Error::CapacityExceeded(Capacity::AdmissionQueue { limit: 2 }))
    ));

    // Running requests leave the queue.
    engine.step().unwrap();
    handles.push(engine.add_request(request()).unwrap());
    engine.run_until_idle().unwrap();
    for handle in &mut handles {
        assert_eq!(output(handle).finish_reason, Some(FinishReason::Length));
    }
}

#[test]
fn test_invalid_requests_are_rejected() {
    let engine = Engine::new(successor_config(4, 8)).unwrap();
    for request in [
        NewRequest::new(vec![]),
        NewRequest::new(vec![64]),
        NewRequest::new(vec![1]).max_tokens(0),
        NewRequest::new(vec![1; 20]).max_tokens(20),
        NewRequest::new(vec![1]).max_tokens(usize::MAX),
        NewRequest::new(vec![1]).sampling(SamplingConfig {
            temperature: f32::NAN,
            max_tokens: 4,
            ..Default::default()
        }),
    ] {
        assert!(matches!(
            engine.add_request(request),
            Err(Error::InvalidRequest(_))
        ));
    }
    assert_eq!(engine.client().num_queued(), 0);
}

#[test]
fn test_sampling_failure_ends_only_its_own_request() {
    let mut engine = Engine::new(successor_config(4, 32)).unwrap();
    let mut healthy = engine
        .add_request(NewRequest::new(vec![1, 2]).sampling(SamplingConfig::greedy(4)))
        .unwrap();
    // Valid, but the scaled logits overflow and leave no distribution.
    let degenerate = SamplingConfig {
        temperature: 1e-45,
        max_tokens: 4,
        ..Default::default()
    };
    let mut broken = engine
        .add_request(NewRequest::new(vec![5, 6]).sampling(degenerate))
        .unwrap();

    let report = engine.step().unwrap();
    assert_eq!(report.num_seqs, 2);
    engine.run_until_idle().unwrap();

    let broken = output(&mut broken);
    assert_eq!(broken.finish_reason, Some(FinishReason::Error));
    assert!(broken.tokens().is_empty());
    assert!(broken
        .notices
        .iter()
        .any(|n| matches!(n, Notice::SamplingFailure(_))));

    let healthy = output(&mut healthy);
    assert_eq!(healthy.tokens(), &[3, 4, 5, 6]);
    assert_eq!(healthy.finish_reason, Some(FinishReason::Length));
    assert_eq!(engine.scheduler().stats().errored, 1);
    assert_eq!(engine.allocator().num_free_pages(), 32);
}

/// Fails every forward call after the first `healthy` ones.
struct FailingExecutor {
    inner: ToyExecutor,
    healthy: usize,
}

impl ModelExecutor for FailingExecutor {
    fn forward(&mut self, batch: &ExecutorBatch) -> Result<ExecutorOutput> {
        if self.healthy == 0 {
            return Err(Error::ExecutorFault("device lost".to_string()));
        }
        self.healthy -= 1;
        self.inner.forward(batch)
    }

    fn cache_shape(&self) -> CacheShape {
        self.inner.cache_shape()
    }

    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }

    fn recover(&mut self) -> Result<()> {
        self.healthy = usize::MAX;
        Ok(())
    }
}

#[test]
fn test_executor_fault_fails_only_the_batch() {
    let config = successor_config(4, 32);
    let inner = ToyExecutor::new(&config.model, &config.cache).unwrap();
    let executor = FailingExecutor { inner, healthy: 1 };
    let mut engine = Engine::with_executors(config, Box::new(executor), None).unwrap();

    let mut first = engine
        .add_request(NewRequest::new(vec![1, 2]).sampling(SamplingConfig::greedy(5)))
        .unwrap();
    engine.step().unwrap();
    engine.step().unwrap();

    let out = output(&mut first);
    assert_eq!(out.finish_reason, Some(FinishReason::Error));
    assert_eq!(out.tokens(), &[3]);
    assert_eq!(engine.allocator().num_free_pages(), 32);

    let mut second = engine
        .add_request(NewRequest::new(vec![7]).sampling(SamplingConfig::greedy(2)))
        .unwrap();
    engine.run_until_idle().unwrap();
    assert_eq!(output(&mut second).tokens(), &[8, 9]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_service_serves_concurrent_clients() {
    let service = EngineService::start(Engine::new(successor_config(4, 128)).unwrap()).unwrap();

    let mut tasks = Vec::new();
    for start in 0..8u32 {
        let client = service.client();
        tasks.push(tokio::spawn(async move {
            let handle = client
                .accept(NewRequest::new(vec![start]).sampling(SamplingConfig::greedy(4)))
                .unwrap();
            (start, handle.collect().await)
        }));
    }
    for task in tasks {
        let (start, out) = task.await.unwrap();
        let expected: Vec<u32> = (start + 1..start + 5).collect();
        assert_eq!(out.tokens(), expected.as_slice());
        assert_eq!(out.finish_reason, Some(FinishReason::Length));
    }

    let stats = service.shutdown().unwrap();
    assert_eq!(stats.finished, 8);
}

#[tokio::test]
async fn test_service_shutdown_cancels_in_flight_requests() {
    let service = EngineService::start(Engine::new(successor_config(4, 256)).unwrap()).unwrap();
    let handle = service
        .client()
        .accept(NewRequest::new(vec![1]).sampling(SamplingConfig::greedy(1000)))
        .unwrap();
    let client = service.client();
    service.shutdown().unwrap();

    let out = handle.collect().await;
    assert!(out.is_finished());
    assert!(matches!(
        out.finish_reason,
        Some(FinishReason::Cancelled) | Some(FinishReason::Length)
    ));
    assert!(matches!(
        client.accept(NewRequest::new(vec![1]).max_tokens(1)),
        Err(Error::Shutdown)
    ));
}
