//! Engine service.
//!
//! Runs an [`Engine`] on a dedicated thread with a current-thread Tokio
//! runtime. The loop steps while work is outstanding and parks on the
//! admission channel otherwise. Requests left over by a step that selected
//! nothing are failed rather than stepped again. Clients talk to it through
//! [`EngineClient`]s; dropping or shutting down the service finishes every
//! outstanding request with `cancelled`.

use std::thread::JoinHandle;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::llm::Engine;
use crate::error::{Error, Result};
use crate::scheduler::admission::EngineClient;
use crate::scheduler::batch::SchedulerStats;

/// An engine running on its own thread.
#[derive(Debug)]
pub struct EngineService {
    client: EngineClient,
    shutdown: CancellationToken,
    thread: Option<JoinHandle<Result<SchedulerStats>>>,
}

impl EngineService {
    /// Move `engine` onto a new thread and start its loop.
    pub fn start(engine: Engine) -> Result<Self> {
        let client = engine.client();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name("nano-serve-engine".to_string())
            .spawn(move || run(engine, token))?;
        Ok(Self {
            client,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Handle for submitting requests.
    pub fn client(&self) -> EngineClient {
        self.client.clone()
    }

    /// Stop the loop, cancel outstanding requests and wait for the thread.
    pub fn shutdown(mut self) -> Result<SchedulerStats> {
        self.stop()
    }

    fn stop(&mut self) -> Result<SchedulerStats> {
        self.shutdown.cancel();
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| Error::ExecutorFault("engine thread panicked".to_string()))?,
            None => Err(Error::Shutdown),
        }
    }
}

impl Drop for EngineService {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(err) = self.stop() {
                error!(%err, "engine service stopped with an error");
            }
        }
    }
}

fn run(mut engine: Engine, shutdown: CancellationToken) -> Result<SchedulerStats> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;

    runtime.block_on(async {
        info!("engine service started");
        while !shutdown.is_cancelled() {
            if engine.has_work() {
                match engine.step() {
                    Ok(report) if report.is_idle() => {
                        engine.fail_stalled();
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!(%err, "engine step failed, shutting down");
                        engine.shutdown();
                        return Err(err);
                    }
                }
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                open = engine.wait_for_admission() => {
                    if !open {
                        break;
                    }
                }
            }
        }
        engine.shutdown();
        Ok(engine.scheduler().stats())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Architecture, EngineConfig, ModelConfig, SamplingConfig};
    use crate::core::request::{FinishReason, NewRequest, Notice};
    use std::time::Duration;

    fn engine() -> Engine {
        let mut config = EngineConfig::default().cache(4, 16);
        config.model = ModelConfig::new(Architecture::Successor, 16);
        Engine::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_service_streams_tokens() {
        let service = EngineService::start(engine()).unwrap();
        let handle = service
            .client()
            .accept(NewRequest::new(vec![3]).sampling(SamplingConfig::greedy(3)))
            .unwrap();

        let output = handle.collect().await;
        assert_eq!(output.tokens(), &[4, 5, 6]);
        assert_eq!(output.finish_reason, Some(FinishReason::Length));

        let stats = service.shutdown().unwrap();
        assert_eq!(stats.finished, 1);
    }

    #[tokio::test]
    async fn test_stalled_requests_end_instead_of_spinning() {
        let mut config = EngineConfig::default().cache(4, 3);
        config.model = ModelConfig::new(Architecture::Successor, 32);
        config.scheduler.enable_preemption = false;
        let engine = Engine::new(config).unwrap();
        // Queued before the loop starts so the first step admits all three.
        let handles: Vec<_> = [0u32, 10, 20]
            .iter()
            .map(|&first| {
                let prompt = (first..first + 4).collect();
                engine
                    .add_request(NewRequest::new(prompt).sampling(SamplingConfig::greedy(8)))
                    .unwrap()
            })
            .collect();
        let service = EngineService::start(engine).unwrap();
        let client = service.client();

        for handle in handles {
            let output = tokio::time::timeout(Duration::from_secs(10), handle.collect())
                .await
                .unwrap();
            assert_eq!(output.finish_reason, Some(FinishReason::Error));
            assert_eq!(output.notices, vec![Notice::Stalled]);
        }

        let output = client
            .accept(NewRequest::new(vec![3]).sampling(SamplingConfig::greedy(2)))
            .unwrap()
            .collect()
            .await;
        assert_eq!(output.tokens(), &[4, 5]);

        let stats = service.shutdown().unwrap();
        assert_eq!(stats.errored, 3);
        assert_eq!(stats.finished, 1);
    }

    #[test]
    fn test_shutdown_closes_admission() {
        let service = EngineService::start(engine()).unwrap();
        let client = service.client();
        service.shutdown().unwrap();
        assert!(client.is_closed());
    }
}
