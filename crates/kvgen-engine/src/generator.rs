//! The `generate` entry point.
//!
//! Ties the tokenizer, the cache engine, the prefill engine, the decode loop
//! and the session router together. Prompts of a batch run in parallel, each
//! on its own session; a session id is only ever driven by one request at a
//! time.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kvgen_kv::KvTensor;
use kvgen_models::{ForwardModel, TinyModel};
use kvgen_sampling::Sampler;
use kvgen_tokenizer::{prepends_bos_token, CharTokenizer, TokenId, Tokenizer};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::{EngineConfig, GenerationConfig};
use crate::decode::{Decoder, FinishReason};
use crate::engine::{CacheEngine, ExternalCacheEngine, OpaqueCacheEngine};
use crate::error::{EngineError, Result};
use crate::prefill::PrefillEngine;
use crate::router::SessionRouter;
use crate::session::Session;
use crate::stream::GenerationStream;

/// A generation request over one or more prompts.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub sequences: Vec<String>,
    /// One id per prompt; prompts without ids run on throwaway sessions.
    pub session_ids: Option<Vec<String>>,
    pub generation_config: GenerationConfig,
    /// Prefix each score with the logits of every prompt position.
    pub include_prompt_logits: bool,
    /// Attach a cache snapshot per prompt to the output.
    pub include_kv_cache_state: bool,
    pub streaming: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self::batch(vec![prompt.into()])
    }

    pub fn batch(sequences: Vec<String>) -> Self {
        Self {
            sequences,
            ..Self::default()
        }
    }

    pub fn with_session(self, session_id: impl Into<String>) -> Self {
        self.with_session_ids(vec![session_id.into()])
    }

    pub fn with_session_ids(mut self, ids: Vec<String>) -> Self {
        self.session_ids = Some(ids);
        self
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.generation_config = config;
        self
    }

    pub fn with_prompt_logits(mut self, include: bool) -> Self {
        self.include_prompt_logits = include;
        self
    }

    pub fn with_kv_cache_state(mut self, include: bool) -> Self {
        self.include_kv_cache_state = include;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.sequences.is_empty() {
            return Err(EngineError::Configuration(
                "at least one sequence is required".into(),
            ));
        }
        self.generation_config.validate()?;

        if let Some(ids) = &self.session_ids {
            if ids.len() != self.sequences.len() {
                return Err(EngineError::Configuration(format!(
                    "{} session ids for {} sequences",
                    ids.len(),
                    self.sequences.len()
                )));
            }
            let mut seen = HashSet::new();
            if let Some(dup) = ids.iter().find(|id| !seen.insert(id.as_str())) {
                return Err(EngineError::Configuration(format!(
                    "session id {dup:?} appears more than once in one request"
                )));
            }
            if self.generation_config.num_return_sequences > 1 {
                return Err(EngineError::Configuration(
                    "num_return_sequences > 1 cannot be combined with session ids".into(),
                ));
            }
        }
        Ok(())
    }
}

/// One generated sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Generation {
    pub text: String,
    pub token_ids: Vec<TokenId>,
    /// Logits rows, present when `output_scores` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<Vec<Vec<f32>>>,
    pub finish_reason: FinishReason,
}

/// Statistics from a generation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationStats {
    /// Number of prompt tokens fed to the model.
    pub prompt_tokens: usize,

    /// Number of tokens generated.
    pub generated_tokens: usize,

    /// Time for the prefill phase in milliseconds.
    pub prefill_time_ms: f64,

    /// Time for the decode phase in milliseconds.
    pub decode_time_ms: f64,

    /// Tokens per second during decode.
    pub tokens_per_second: f64,
}

impl GenerationStats {
    fn add(&mut self, run: &RunStats) {
        self.prompt_tokens += run.prompt_tokens;
        self.generated_tokens += run.generated_tokens;
        self.prefill_time_ms += run.prefill.as_secs_f64() * 1000.0;
        self.decode_time_ms += run.decode.as_secs_f64() * 1000.0;
        self.tokens_per_second = if self.decode_time_ms > 0.0 {
            self.generated_tokens as f64 / (self.decode_time_ms / 1000.0)
        } else {
            0.0
        };
    }
}

/// Result of a non-streaming request.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutput {
    /// Per prompt, `num_return_sequences` generations.
    pub generations: Vec<Vec<Generation>>,
    /// Per prompt, the session's processed-token counter after the run.
    pub total_num_processed_tokens: Vec<usize>,
    /// Per prompt cache snapshot, when requested.
    #[serde(skip)]
    pub kv_cache_state: Option<Vec<BTreeMap<String, KvTensor>>>,
    pub stats: GenerationStats,
}

/// What [`TextGenerator::run`] hands back.
pub enum GenerationResponse {
    Complete(GenerationOutput),
    Stream(GenerationStream),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RunStats {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub prefill: Duration,
    pub decode: Duration,
}

/// Everything a generation needs besides the session; cheap to clone into workers.
#[derive(Clone)]
pub(crate) struct Pipeline {
    pub prefill: PrefillEngine,
    pub tokenizer: Arc<dyn Tokenizer>,
}

/// One prompt's generation in progress.
pub(crate) struct Run {
    pub decoder: Decoder,
    prompt_rows: Vec<Vec<f32>>,
    include_prompt_logits: bool,
    output_scores: bool,
    pub stats: RunStats,
    decode_start: Instant,
}

impl Pipeline {
    /// Compose the fed tokens, prefill them and set up the decoder.
    ///
    /// Fed tokens are the session's pending tokens, then `<s>` when the
    /// session is fresh and the tokenizer prepends it, then the prompt.
    pub fn start(
        &self,
        session: &mut Session,
        prompt: &[TokenId],
        config: &GenerationConfig,
        sampler: Sampler,
        include_prompt_logits: bool,
        stop: Arc<AtomicBool>,
    ) -> Result<Run> {
        let fresh = session.is_fresh();
        let mut tokens = session.take_pending();
        let replayed = tokens.len();
        if fresh && self.tokenizer.adds_bos() {
            tokens.extend(self.tokenizer.bos_token());
        }
        tokens.extend_from_slice(prompt);
        if tokens.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }

        let prefill_start = Instant::now();
        let processed_before = session.total_processed_tokens();
        let out = match self.prefill.run(session, &tokens) {
            Ok(out) => out,
            Err(err) => {
                // Chunks commit whole, so the committed tokens are a prefix.
                let committed = session.total_processed_tokens() - processed_before;
                for &token in tokens[..replayed].iter().skip(committed) {
                    session.push_pending(token);
                }
                return Err(err);
            }
        };
        let prefill = prefill_start.elapsed();

        let first = out.logits.last().cloned().ok_or(EngineError::EmptyPrompt)?;
        let prompt_rows = if include_prompt_logits && config.output_scores {
            out.logits.into_iter().skip(replayed).collect()
        } else {
            Vec::new()
        };

        let decoder = Decoder::new(
            sampler,
            config,
            self.tokenizer.as_ref(),
            &tokens,
            first,
            stop,
        );
        Ok(Run {
            decoder,
            prompt_rows,
            include_prompt_logits,
            output_scores: config.output_scores,
            stats: RunStats {
                prompt_tokens: tokens.len() - replayed,
                prefill,
                ..RunStats::default()
            },
            decode_start: Instant::now(),
        })
    }
}

impl Run {
    pub fn finish(mut self) -> (Generation, RunStats) {
        self.stats.decode = self.decode_start.elapsed();
        self.stats.generated_tokens = self.decoder.generated().len();

        let score = self.output_scores.then(|| {
            if self.include_prompt_logits {
                // The last prompt row already scored the first generated token.
                let mut rows = std::mem::take(&mut self.prompt_rows);
                rows.extend(self.decoder.scores().iter().skip(1).cloned());
                rows
            } else {
                self.decoder.scores().to_vec()
            }
        });

        let generation = Generation {
            text: self.decoder.text().to_string(),
            token_ids: self.decoder.generated().to_vec(),
            score,
            finish_reason: self.decoder.finish_reason().unwrap_or(FinishReason::Length),
        };
        (generation, self.stats)
    }
}

/// Per-prompt result before assembly.
pub(crate) struct PromptResult {
    pub generations: Vec<Generation>,
    pub total_processed: usize,
    pub kv_cache_state: Option<BTreeMap<String, KvTensor>>,
    pub stats: Vec<RunStats>,
}

pub(crate) fn assemble(results: Vec<PromptResult>, include_kv_cache_state: bool) -> GenerationOutput {
    let mut stats = GenerationStats::default();
    let mut generations = Vec::with_capacity(results.len());
    let mut totals = Vec::with_capacity(results.len());
    let mut snapshots = Vec::with_capacity(results.len());

    for result in results {
        for run in &result.stats {
            stats.add(run);
        }
        generations.push(result.generations);
        totals.push(result.total_processed);
        snapshots.extend(result.kv_cache_state);
    }

    GenerationOutput {
        generations,
        total_num_processed_tokens: totals,
        kv_cache_state: include_kv_cache_state.then_some(snapshots),
        stats,
    }
}

/// Stateful text generator with per-session KV caches.
pub struct TextGenerator {
    config: EngineConfig,
    engine: Arc<dyn CacheEngine>,
    pipeline: Pipeline,
    router: Arc<SessionRouter>,
}

impl TextGenerator {
    /// Build the tiny model and the character tokenizer described by `config`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let model = TinyModel::new(config.model.clone())?;
        let tokenizer = CharTokenizer::new(config.prepend_bos);
        Self::with_components(config, Arc::new(model), Arc::new(tokenizer))
    }

    /// Build around a caller-supplied model and tokenizer.
    pub fn with_components(
        config: EngineConfig,
        model: Arc<dyn ForwardModel>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Result<Self> {
        config.validate()?;
        let dims = model.dims();
        if dims.vocab_size != tokenizer.vocab_size() {
            return Err(EngineError::Configuration(format!(
                "model vocabulary ({}) does not match tokenizer vocabulary ({})",
                dims.vocab_size,
                tokenizer.vocab_size()
            )));
        }

        let freeze_first = prepends_bos_token(tokenizer.as_ref());
        let capacity = config.capacity_manager(freeze_first)?;

        let engine: Arc<dyn CacheEngine> = if config.internal_kv_cache {
            Arc::new(OpaqueCacheEngine::new(model, config.sequence_length))
        } else {
            Arc::new(ExternalCacheEngine::new(model, config.sequence_length))
        };
        let prefill = PrefillEngine::new(engine.clone(), capacity, config.prompt_sequence_length)?;

        tracing::debug!(
            mode = %engine.cache_mode(),
            capacity = config.sequence_length,
            chunk_size = config.prompt_sequence_length,
            freeze_first,
            "text generator ready"
        );

        Ok(Self {
            router: Arc::new(SessionRouter::new(engine.clone())),
            pipeline: Pipeline { prefill, tokenizer },
            engine,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.pipeline.tokenizer
    }

    pub fn engine(&self) -> &Arc<dyn CacheEngine> {
        &self.engine
    }

    pub fn router(&self) -> &SessionRouter {
        &self.router
    }

    /// Whether slot 0 is pinned during eviction.
    pub fn freezes_first_position(&self) -> bool {
        self.pipeline.prefill.capacity().freeze_first()
    }

    /// Dispatch on `request.streaming`.
    pub fn run(&self, request: GenerationRequest) -> Result<GenerationResponse> {
        if request.streaming {
            self.generate_stream(request).map(GenerationResponse::Stream)
        } else {
            self.generate(request).map(GenerationResponse::Complete)
        }
    }

    /// Generate for every prompt of the request and block until done.
    pub fn generate(&self, request: GenerationRequest) -> Result<GenerationOutput> {
        request.validate()?;
        for id in request.session_ids.iter().flatten() {
            self.router.ensure_idle(id)?;
        }
        let prompts = self.encode_all(&request.sequences)?;
        let started = Instant::now();

        let results = prompts
            .par_iter()
            .enumerate()
            .map(|(i, prompt)| {
                let session_id = request.session_ids.as_ref().map(|ids| ids[i].as_str());
                self.generate_prompt(prompt, session_id, &request)
            })
            .collect::<Result<Vec<_>>>()?;

        let output = assemble(results, request.include_kv_cache_state);
        tracing::info!(
            prompts = request.sequences.len(),
            prompt_tokens = output.stats.prompt_tokens,
            generated_tokens = output.stats.generated_tokens,
            tokens_per_second = output.stats.tokens_per_second,
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "generation finished"
        );
        Ok(output)
    }

    /// Stream a single prompt token by token.
    ///
    /// A routed stream owns its session until it finishes, is cancelled or is
    /// dropped. Meanwhile every other request on that session id fails with
    /// [`EngineError::SessionBusy`].
    pub fn generate_stream(&self, request: GenerationRequest) -> Result<GenerationStream> {
        request.validate()?;
        if request.sequences.len() != 1 || request.generation_config.num_return_sequences != 1 {
            return Err(EngineError::Configuration(
                "streaming supports exactly one prompt and one return sequence".into(),
            ));
        }
        let prompt = self.encode_all(&request.sequences)?.remove(0);

        let session = match request.session_ids.as_ref().and_then(|ids| ids.first()) {
            Some(id) => {
                let claim = self.router.claim_stream(id)?;
                crate::stream::StreamSession::Routed(self.router.get_or_create(id), claim)
            }
            None => crate::stream::StreamSession::Ephemeral(self.router.ephemeral()),
        };
        GenerationStream::spawn(
            self.pipeline.clone(),
            self.router.clone(),
            session,
            prompt,
            request,
        )
    }

    /// Cache tensors of a session.
    pub fn kv_cache_state(&self, session_id: &str) -> Result<BTreeMap<String, KvTensor>> {
        self.router.ensure_idle(session_id)?;
        let handle = self.router.get(session_id)?;
        let session = handle.lock();
        self.engine.snapshot(session.cache())
    }

    pub fn total_num_processed_tokens(&self, session_id: &str) -> Result<usize> {
        self.router.ensure_idle(session_id)?;
        Ok(self.router.get(session_id)?.lock().total_processed_tokens())
    }

    pub fn reset_session(&self, session_id: &str) -> Result<()> {
        self.router.reset(session_id)
    }

    pub fn remove_session(&self, session_id: &str) -> Result<()> {
        self.router.remove(session_id)
    }

    /// Tokenize every prompt up front so bad input fails before any cache is touched.
    fn encode_all(&self, sequences: &[String]) -> Result<Vec<Vec<TokenId>>> {
        sequences
            .iter()
            .map(|s| Ok(self.pipeline.tokenizer.encode(s)?))
            .collect()
    }

    fn generate_prompt(
        &self,
        prompt: &[TokenId],
        session_id: Option<&str>,
        request: &GenerationRequest,
    ) -> Result<PromptResult> {
        let config = &request.generation_config;

        if let Some(id) = session_id {
            let handle = self.router.get_or_create(id);
            let mut session = handle.lock();
            let (generation, stats) = self.generate_one(&mut session, prompt, request, 0)?;
            return Ok(PromptResult {
                generations: vec![generation],
                total_processed: session.total_processed_tokens(),
                kv_cache_state: self.snapshot_if(request, &session)?,
                stats: vec![stats],
            });
        }

        let mut result = PromptResult {
            generations: Vec::with_capacity(config.num_return_sequences),
            total_processed: 0,
            kv_cache_state: None,
            stats: Vec::with_capacity(config.num_return_sequences),
        };
        for index in 0..config.num_return_sequences {
            let mut session = self.router.ephemeral();
            let outcome = self
                .generate_one(&mut session, prompt, request, index)
                .and_then(|(generation, stats)| {
                    if index == 0 {
                        result.total_processed = session.total_processed_tokens();
                        result.kv_cache_state = self.snapshot_if(request, &session)?;
                    }
                    Ok((generation, stats))
                });
            self.router.release(&session);

            let (generation, stats) = outcome?;
            result.generations.push(generation);
            result.stats.push(stats);
        }
        Ok(result)
    }

    fn generate_one(
        &self,
        session: &mut Session,
        prompt: &[TokenId],
        request: &GenerationRequest,
        sequence_index: usize,
    ) -> Result<(Generation, RunStats)> {
        let config = &request.generation_config;
        let mut run = self.pipeline.start(
            session,
            prompt,
            config,
            config.sampler(sequence_index),
            request.include_prompt_logits,
            Arc::new(AtomicBool::new(false)),
        )?;
        run.decoder.run_to_end(
            &self.pipeline.prefill,
            self.pipeline.tokenizer.as_ref(),
            session,
        )?;
        Ok(run.finish())
    }

    fn snapshot_if(
        &self,
        request: &GenerationRequest,
        session: &Session,
    ) -> Result<Option<BTreeMap<String, KvTensor>>> {
        if request.include_kv_cache_state {
            Ok(Some(self.engine.snapshot(session.cache())?))
        } else {
            Ok(None)
        }
    }
}
