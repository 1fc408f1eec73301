//! # kvgen-cli
//!
//! Command-line front end: one-shot generation over one or more prompts,
//! and an interactive chat that keeps a single session across turns.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use kvgen_engine::{
    EngineConfig, GenerationConfig, GenerationOutput, GenerationRequest, StreamEvent,
    TextGenerator,
};

/// kvgen: stateful text generation with per-session KV caches
#[derive(Debug, Parser)]
#[command(name = "kvgen", version)]
pub struct Cli {
    /// Log filter, overridden by RUST_LOG.
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate continuations for one or more prompts.
    Generate(GenerateArgs),
    /// Read turns from stdin and answer each on one session.
    Chat(ChatArgs),
}

/// Engine construction options shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    /// JSON engine configuration; flags below override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Cache capacity in positions.
    #[arg(long = "capacity")]
    pub sequence_length: Option<usize>,

    /// Prefill chunk size (1 = single-token prefill).
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Keep caches inside the engine.
    #[arg(long)]
    pub internal_kv_cache: bool,
}

/// Sampling options shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct SamplingArgs {
    /// Maximum number of new tokens per prompt.
    #[arg(short, long, default_value_t = 16)]
    pub max_tokens: usize,

    /// Sample instead of decoding greedily.
    #[arg(long = "sample")]
    pub do_sample: bool,

    /// Seed for reproducible sampling.
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Sampling temperature (must be > 0).
    #[arg(short, long, default_value_t = 1.0)]
    pub temperature: f32,

    /// Keep only the k most likely tokens (0 = off).
    #[arg(long, default_value_t = 0)]
    pub top_k: usize,

    /// Nucleus sampling threshold.
    #[arg(long, default_value_t = 1.0)]
    pub top_p: f32,

    /// Ignore end-of-sequence and always produce `max_tokens`.
    #[arg(long)]
    pub force_max_tokens: bool,
}

#[derive(Debug, Clone, Args)]
pub struct GenerateArgs {
    /// Input prompt; repeat for a batch.
    #[arg(short, long = "prompt", required = true)]
    pub prompts: Vec<String>,

    /// Completions per prompt.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub num_return_sequences: usize,

    /// Print tokens as they are produced (single prompt only).
    #[arg(long)]
    pub stream: bool,

    /// Print the full output as JSON.
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub engine: EngineArgs,

    #[command(flatten)]
    pub sampling: SamplingArgs,
}

#[derive(Debug, Clone, Args)]
pub struct ChatArgs {
    /// Session id used for every turn.
    #[arg(long, default_value = "chat")]
    pub session: String,

    #[command(flatten)]
    pub engine: EngineArgs,

    #[command(flatten)]
    pub sampling: SamplingArgs,
}

impl EngineArgs {
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => EngineConfig::new(),
        };
        if let Some(n) = self.sequence_length {
            config.sequence_length = n;
        }
        if let Some(n) = self.chunk_size {
            config.prompt_sequence_length = n;
        }
        if self.internal_kv_cache {
            config.internal_kv_cache = true;
        }
        Ok(config)
    }
}

impl SamplingArgs {
    pub fn generation_config(&self) -> GenerationConfig {
        let mut config = GenerationConfig::new()
            .with_max_length(self.max_tokens)
            .with_do_sample(self.do_sample)
            .with_temperature(self.temperature)
            .with_top_k(self.top_k)
            .with_top_p(self.top_p)
            .with_force_max_tokens(self.force_max_tokens);
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        config
    }
}

/// Run a parsed command, writing results to `out`.
pub fn run(cli: Cli, input: impl BufRead, out: &mut impl Write) -> anyhow::Result<()> {
    match cli.command {
        Command::Generate(args) => generate(&args, out),
        Command::Chat(args) => chat(&args, input, out),
    }
}

pub fn generate(args: &GenerateArgs, out: &mut impl Write) -> anyhow::Result<()> {
    let generator = TextGenerator::new(args.engine.engine_config()?)?;
    let config = args
        .sampling
        .generation_config()
        .with_num_return_sequences(args.num_return_sequences);
    let request = GenerationRequest::batch(args.prompts.clone()).with_config(config);

    if args.stream {
        if args.json {
            bail!("--stream and --json cannot be combined");
        }
        let output = stream_to(&generator, request, out)?;
        writeln!(out)?;
        tracing::info!(tokens = output.stats.generated_tokens, "stream complete");
        return Ok(());
    }

    let output = generator.generate(request)?;
    if args.json {
        serde_json::to_writer_pretty(&mut *out, &output)?;
        writeln!(out)?;
    } else {
        print_text(&output, out)?;
    }
    Ok(())
}

pub fn chat(args: &ChatArgs, input: impl BufRead, out: &mut impl Write) -> anyhow::Result<()> {
    let generator = TextGenerator::new(args.engine.engine_config()?)?;
    let config = args.sampling.generation_config();

    for line in input.lines() {
        let line = line.context("reading input")?;
        if line.is_empty() {
            continue;
        }
        let request = GenerationRequest::new(line)
            .with_session(args.session.clone())
            .with_config(config.clone());
        stream_to(&generator, request, out)?;
        writeln!(out)?;
    }

    let processed = generator.total_num_processed_tokens(&args.session).unwrap_or(0);
    tracing::info!(session_id = %args.session, processed, "chat finished");
    Ok(())
}

fn stream_to(
    generator: &TextGenerator,
    request: GenerationRequest,
    out: &mut impl Write,
) -> anyhow::Result<GenerationOutput> {
    for event in generator.generate_stream(request)? {
        match event? {
            StreamEvent::Token(token) => {
                write!(out, "{}", token.text)?;
                out.flush()?;
            }
            StreamEvent::Finished(output) => return Ok(output),
        }
    }
    bail!("stream ended without a result")
}

fn print_text(output: &GenerationOutput, out: &mut impl Write) -> anyhow::Result<()> {
    let batch = output.generations.len() > 1;
    for (i, generations) in output.generations.iter().enumerate() {
        for (j, generation) in generations.iter().enumerate() {
            if batch || generations.len() > 1 {
                writeln!(out, "[{i}.{j}] {}", generation.text)?;
            } else {
                writeln!(out, "{}", generation.text)?;
            }
        }
    }
    Ok(())
}
