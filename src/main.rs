use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nano_serve::core::AllocatorStats;
use nano_serve::scheduler::SchedulerStats;
use nano_serve::speculative::SpeculationStats;
use nano_serve::{
    Architecture, Engine, EngineConfig, Error, ModelConfig, NewRequest, PreemptionMode,
    RequestHandle, RequestOutput, Result, SamplingConfig, SpeculativeConfig,
};

#[derive(Parser, Debug)]
#[command(name = "nano-serve")]
#[command(about = "Run a synthetic workload through the serving core")]
struct Args {
    /// JSON engine configuration; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of requests to submit
    #[arg(short, long, default_value = "32")]
    requests: usize,

    /// Maximum tokens to generate per request
    #[arg(long, default_value = "64")]
    max_tokens: usize,

    /// Speculative lookahead K (0 disables speculative decoding)
    #[arg(long, default_value = "0")]
    speculative: usize,

    /// Tensor parallel degree
    #[arg(long)]
    tp_size: Option<usize>,

    /// What happens to sequences evicted under page pressure
    #[arg(long, value_enum)]
    preemption: Option<Preemption>,

    /// Target model architecture
    #[arg(long, value_enum)]
    architecture: Option<Arch>,

    /// Workload seed
    #[arg(long, default_value = "0")]
    seed: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preemption {
    Abort,
    Suspend,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Arch {
    Uniform,
    Bigram,
    Successor,
    Mlp,
}

impl From<Arch> for Architecture {
    fn from(arch: Arch) -> Self {
        match arch {
            Arch::Uniform => Architecture::Uniform,
            Arch::Bigram => Architecture::Bigram,
            Arch::Successor => Architecture::Successor,
            Arch::Mlp => Architecture::Mlp,
        }
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    requests: usize,
    finish_reasons: BTreeMap<String, usize>,
    generated_tokens: usize,
    steps: u64,
    elapsed_ms: u128,
    tokens_per_second: f64,
    scheduler: SchedulerStats,
    allocator: AllocatorStats,
    speculation: Option<SpeculationStats>,
    acceptance_rate: Option<f64>,
}

fn build_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(arch) = args.architecture {
        config.model.architecture = arch.into();
    }
    if let Some(tp_size) = args.tp_size {
        config = config.tensor_parallel(tp_size);
    }
    if let Some(mode) = args.preemption {
        config.scheduler.preemption_mode = match mode {
            Preemption::Abort => PreemptionMode::Abort,
            Preemption::Suspend => PreemptionMode::Suspend,
        };
    }
    if args.speculative > 0 {
        let draft = config
            .speculative
            .as_ref()
            .map(|s| s.draft_model.clone())
            .unwrap_or_else(|| ModelConfig::new(Architecture::Uniform, config.model.vocab_size));
        config = config.speculative(SpeculativeConfig::new(draft).num_tokens(args.speculative));
    }
    config.validate()?;
    Ok(config)
}

fn main() -> std::result::Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    info!("nano-serve v{}", env!("CARGO_PKG_VERSION"));

    let config = build_config(&args)?;
    let vocab_size = config.model.vocab_size as u32;
    let mut engine = Engine::new(config)?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let start = Instant::now();
    let mut steps = 0u64;
    let mut handles: Vec<RequestHandle> = Vec::with_capacity(args.requests);
    for i in 0..args.requests {
        let prompt_len = rng.gen_range(1..=16);
        let prompt = (0..prompt_len).map(|_| rng.gen_range(0..vocab_size)).collect();
        let sampling = SamplingConfig {
            temperature: 0.8,
            top_k: 20,
            max_tokens: args.max_tokens,
            seed: Some(args.seed.wrapping_add(i as u64 * 1_000)),
            ..Default::default()
        };
        let request = NewRequest::new(prompt)
            .sampling(sampling)
            .priority(rng.gen_range(0..3));

        loop {
            match engine.add_request(request.clone()) {
                Ok(handle) => {
                    handles.push(handle);
                    break;
                }
                Err(err) if err.is_capacity() => {
                    engine.step()?;
                    steps += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
    steps += engine.run_until_idle()?;
    let elapsed = start.elapsed();

    let outputs: Vec<RequestOutput> = handles
        .iter_mut()
        .map(|h| RequestOutput::from_events(h.request_id(), &h.drain()))
        .collect();
    let mut finish_reasons = BTreeMap::new();
    for output in &outputs {
        let reason = output.finish_reason.map_or("unfinished", |r| r.as_str());
        *finish_reasons.entry(reason.to_string()).or_insert(0) += 1;
    }
    let generated_tokens: usize = outputs.iter().map(|o| o.tokens().len()).sum();
    let speculation = engine.speculation_stats();

    let summary = Summary {
        requests: outputs.len(),
        finish_reasons,
        generated_tokens,
        steps,
        elapsed_ms: elapsed.as_millis(),
        tokens_per_second: generated_tokens as f64 / elapsed.as_secs_f64().max(1e-9),
        scheduler: engine.scheduler().stats(),
        allocator: engine.allocator().stats(),
        acceptance_rate: speculation.map(|s| s.acceptance_rate()),
        speculation,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    engine.shutdown();
    Ok(())
}
