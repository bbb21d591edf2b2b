//! Integration tests for speculative decoding through the engine.

use candle_core::Tensor;
use nano_serve::core::PageTable;
use nano_serve::model::{
    CacheShape, ExecutorBatch, ExecutorOutput, ModelExecutor, SequenceInput, ToyExecutor,
};
use nano_serve::{
    Architecture, Engine, EngineConfig, FinishReason, ModelConfig, NewRequest, Notice,
    RejectionSampler, RequestHandle, RequestOutput, Result, Sampler, SamplingConfig,
    SpeculativeConfig,
};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

const VOCAB: usize = 4;
const NUM_REQUESTS: u64 = 3000;
const MAX_TOKENS: usize = 4;

fn bigram() -> ModelConfig {
    ModelConfig::new(Architecture::Bigram, VOCAB).seed(5)
}

fn sampled_config(speculative: bool) -> EngineConfig {
    let mut config = EngineConfig::default().cache(4, 1024);
    config.model = bigram();
    config.scheduler.max_queued_requests = NUM_REQUESTS as usize;
    if speculative {
        let draft = ModelConfig::new(Architecture::Uniform, VOCAB);
        config = config.speculative(SpeculativeConfig::new(draft).num_tokens(3));
    }
    config
}

/// Transition matrix of the target at temperature 1.
fn transitions() -> Vec<Vec<f32>> {
    let config = sampled_config(false);
    let mut model = ToyExecutor::new(&config.model, &config.cache).unwrap();
    let batch = ExecutorBatch {
        inputs: vec![SequenceInput::new(
            1,
            (0..VOCAB as u32).collect(),
            0,
            PageTable::from_pages(4, vec![0]),
        )
        .unwrap()],
        copies: Vec::new(),
    };
    let output = model.forward(&batch).unwrap();
    Sampler::new(&SamplingConfig::default())
        .distributions(&output.logits[0])
        .unwrap()
}

fn generate(config: EngineConfig) -> (Vec<Vec<u32>>, Engine) {
    let mut engine = Engine::new(config).unwrap();
    let mut handles: Vec<RequestHandle> = (0..NUM_REQUESTS)
        .map(|seed| {
            let sampling = SamplingConfig {
                max_tokens: MAX_TOKENS,
                seed: Some(seed),
                ..Default::default()
            };
            engine
                .add_request(NewRequest::new(vec![0]).sampling(sampling))
                .unwrap()
        })
        .collect();
    engine.run_until_idle().unwrap();

    let samples = handles
        .iter_mut()
        .map(|h| {
            let out = RequestOutput::from_events(h.request_id(), &h.drain());
            assert_eq!(out.finish_reason, Some(FinishReason::Length));
            out.tokens().to_vec()
        })
        .collect();
    (samples, engine)
}

fn total_variation(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum::<f64>() / 2.0
}

fn histogram(values: impl Iterator<Item = usize>, cells: usize) -> Vec<f64> {
    let mut counts = vec![0.0; cells];
    let mut total = 0.0;
    for v in values {
        counts[v] += 1.0;
        total += 1.0;
    }
    counts.iter().map(|c| c / total).collect()
}

/// Checks position marginals and the joint of the first two tokens.
fn assert_matches_target(samples: &[Vec<u32>], p: &[Vec<f32>]) {
    let mut marginal: Vec<f64> = p[0].iter().map(|&x| x as f64).collect();
    for position in 0..MAX_TOKENS {
        let observed = histogram(samples.iter().map(|s| s[position] as usize), VOCAB);
        let tv = total_variation(&observed, &marginal);
        assert!(tv < 0.05, "position {position}: tv {tv:.4}");
        marginal = (0..VOCAB)
            .map(|y| (0..VOCAB).map(|x| marginal[x] * p[x][y] as f64).sum())
            .collect();
    }

    let joint: Vec<f64> = (0..VOCAB * VOCAB)
        .map(|cell| p[0][cell / VOCAB] as f64 * p[cell / VOCAB][cell % VOCAB] as f64)
        .collect();
    let observed = histogram(
        samples.iter().map(|s| s[0] as usize * VOCAB + s[1] as usize),
        VOCAB * VOCAB,
    );
    let tv = total_variation(&observed, &joint);
    assert!(tv < 0.1, "joint of first two tokens: tv {tv:.4}");
}

#[test]
fn test_speculative_samples_follow_target_distribution() {
    let p = transitions();

    let (plain, _) = generate(sampled_config(false));
    assert_matches_target(&plain, &p);

    let (speculative, engine) = generate(sampled_config(true));
    assert_matches_target(&speculative, &p);

    let stats = engine.speculation_stats().unwrap();
    assert!(stats.rounds > 0);
    assert_eq!(stats.fallbacks, 0);
    let rate = stats.acceptance_rate();
    assert!(rate > 0.0 && rate < 1.0, "acceptance rate {rate}");
    assert_eq!(engine.allocator().num_free_pages(), 1024);
}

#[test]
fn test_uniform_draft_acceptance_matches_overlap() {
    let target = vec![0.5f32, 0.3, 0.15, 0.05];
    let draft = vec![0.25f32; 4];
    let overlap: f32 = target.iter().zip(&draft).map(|(p, q)| p.min(*q)).sum();

    let trials = 20_000;
    let mut rng = StdRng::seed_from_u64(1);
    let proposal = WeightedIndex::new(&draft).unwrap();
    let mut rejection = RejectionSampler::with_seed(2);
    let mut accepted = 0usize;
    let mut first = vec![0.0f64; 4];
    for _ in 0..trials {
        let token = proposal.sample(&mut rng) as u32;
        let outcome = rejection
            .verify(&[token], &[draft.clone()], &[target.clone(), target.clone()])
            .unwrap();
        accepted += outcome.num_accepted();
        first[outcome.tokens()[0] as usize] += 1.0 / trials as f64;
    }

    let rate = accepted as f32 / trials as f32;
    assert!((rate - overlap).abs() < 0.02, "rate {rate}, expected {overlap}");
    let target: Vec<f64> = target.iter().map(|&x| x as f64).collect();
    assert!(total_variation(&first, &target) < 0.02);
}

fn greedy_tokens(draft: Option<Architecture>) -> (Vec<u32>, Engine) {
    let mut config = EngineConfig::default().cache(4, 64);
    config.model = ModelConfig::new(Architecture::Successor, 64);
    if let Some(draft) = draft {
        let draft = ModelConfig::new(draft, 64).seed(9);
        config = config.speculative(SpeculativeConfig::new(draft).num_tokens(4));
    }
    let mut engine = Engine::new(config).unwrap();
    let mut handle = engine
        .add_request(NewRequest::new(vec![3, 4, 5]).sampling(SamplingConfig::greedy(20)))
        .unwrap();
    engine.run_until_idle().unwrap();
    let out = RequestOutput::from_events(handle.request_id(), &handle.drain());
    assert_eq!(out.finish_reason, Some(FinishReason::Length));
    (out.tokens().to_vec(), engine)
}

#[test]
fn test_greedy_output_does_not_depend_on_the_draft() {
    let (plain, _) = greedy_tokens(None);
    assert_eq!(plain, (6..26).collect::<Vec<u32>>());

    let (agreeing, engine) = greedy_tokens(Some(Architecture::Successor));
    assert_eq!(agreeing, plain);
    let stats = engine.speculation_stats().unwrap();
    assert_eq!(stats.accepted, stats.proposed);

    let (disagreeing, engine) = greedy_tokens(Some(Architecture::Bigram));
    assert_eq!(disagreeing, plain);
    let stats = engine.speculation_stats().unwrap();
    assert!(stats.accepted < stats.proposed);
}

/// Target whose logits beyond the first fed position of a decode are NaN.
struct PoisonedVerifier {
    inner: ToyExecutor,
}

impl ModelExecutor for PoisonedVerifier {
    fn forward(&mut self, batch: &ExecutorBatch) -> Result<ExecutorOutput> {
        let mut output = self.inner.forward(batch)?;
        for (input, logits) in batch.inputs.iter().zip(output.logits.iter_mut()) {
            let rows = input.token_ids.len();
            if input.positions[0] == 0 || rows < 2 {
                continue;
            }
            let nan = Tensor::full(f32::NAN, (rows - 1, logits.dim(1)?), logits.device())?;
            *logits = Tensor::cat(&[&logits.narrow(0, 0, 1)?, &nan], 0)?;
        }
        Ok(output)
    }

    fn cache_shape(&self) -> CacheShape {
        self.inner.cache_shape()
    }

    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }
}

#[test]
fn test_broken_verify_distribution_falls_back_to_plain_decoding() {
    let mut config = EngineConfig::default().cache(4, 32);
    config.model = ModelConfig::new(Architecture::Successor, 64);
    let draft = ModelConfig::new(Architecture::Successor, 64);
    config = config.speculative(SpeculativeConfig::new(draft.clone()).num_tokens(3));

    let inner = ToyExecutor::new(&config.model, &config.cache).unwrap();
    let draft = ToyExecutor::new(&draft, &config.cache).unwrap();
    let mut engine = Engine::with_executors(
        config,
        Box::new(PoisonedVerifier { inner }),
        Some(Box::new(draft)),
    )
    .unwrap();
    let mut handle = engine
        .add_request(NewRequest::new(vec![1, 2]).sampling(SamplingConfig::greedy(6)))
        .unwrap();
    engine.run_until_idle().unwrap();

    let out = RequestOutput::from_events(handle.request_id(), &handle.drain());
    assert_eq!(out.tokens(), &[3, 4, 5, 6, 7, 8]);
    assert_eq!(out.finish_reason, Some(FinishReason::Length));
    assert_eq!(out.notices, vec![Notice::SpeculationDisabled]);

    let stats = engine.speculation_stats().unwrap();
    assert_eq!(stats.fallbacks, 1);
    assert_eq!(stats.rounds, 1);
    assert_eq!(engine.allocator().num_free_pages(), 32);
}
