//! Integration tests for the generation engine.
//!
//! Validates:
//! - Request validation rejects bad shapes before any session is touched
//! - Sessions persist across requests and stay isolated from each other
//! - Non-finite logits never reach the cache
//! - Streaming matches blocking generation and cancels cleanly
//! - Snapshots follow the cache-ownership mode

use std::io::Write;
use std::sync::Arc;

use kvgen_engine::*;
use kvgen_kv::SessionKVCache;
use kvgen_models::{
    ForwardModel, ForwardOutput, ModelDims, ModelResult, TinyModel, TinyModelConfig,
};
use kvgen_tokenizer::{CharTokenizer, Tokenizer};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn generator(config: EngineConfig) -> TextGenerator {
    TextGenerator::new(config).unwrap()
}

fn forced(max_length: usize) -> GenerationConfig {
    GenerationConfig::new()
        .with_max_length(max_length)
        .with_force_max_tokens(true)
}

/// Wraps the tiny model and poisons the logits of one token id.
struct PoisonModel {
    inner: TinyModel,
    poison: usize,
}

impl ForwardModel for PoisonModel {
    fn dims(&self) -> ModelDims {
        self.inner.dims()
    }

    fn forward(
        &self,
        cache: &SessionKVCache,
        tokens: &[usize],
        start_position: usize,
    ) -> ModelResult<ForwardOutput> {
        let mut out = self.inner.forward(cache, tokens, start_position)?;
        for (row, &t) in out.logits.iter_mut().zip(tokens) {
            if t == self.poison {
                row.fill(f32::NAN);
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Request validation
// ---------------------------------------------------------------------------

#[test]
fn rejects_malformed_requests() {
    let gen = generator(EngineConfig::new());
    let cases = [
        GenerationRequest::batch(vec![]),
        GenerationRequest::batch(vec!["a".into(), "b".into()])
            .with_session_ids(vec!["x".into(), "x".into()]),
        GenerationRequest::batch(vec!["a".into(), "b".into()]).with_session_ids(vec!["x".into()]),
        GenerationRequest::new("a")
            .with_session("x")
            .with_config(GenerationConfig::new().with_num_return_sequences(2)),
        GenerationRequest::new("a").with_config(GenerationConfig::new().with_max_length(0)),
    ];
    for request in cases {
        assert!(gen.generate(request).unwrap_err().is_configuration());
    }
    assert!(gen.router().is_empty());
}

#[test]
fn engine_config_errors() {
    let zero_chunk = EngineConfig::new().with_prompt_sequence_length(0);
    assert!(TextGenerator::new(zero_chunk).err().unwrap().is_configuration());

    // With <s> pinned, a chunk must leave room for the anchor.
    let full_chunk = EngineConfig::new()
        .with_sequence_length(8)
        .with_prompt_sequence_length(8);
    assert!(TextGenerator::new(full_chunk).err().unwrap().is_capacity());

    let no_bos = EngineConfig::new()
        .with_sequence_length(8)
        .with_prompt_sequence_length(8)
        .with_prepend_bos(false);
    assert!(TextGenerator::new(no_bos).is_ok());

    let zero_capacity = EngineConfig::new().with_sequence_length(0);
    assert!(TextGenerator::new(zero_capacity).err().unwrap().is_capacity());
}

#[test]
fn vocabulary_mismatch_rejected() {
    let model = TinyModel::new(TinyModelConfig {
        vocab_size: 50,
        ..TinyModelConfig::default()
    })
    .unwrap();
    let result = TextGenerator::with_components(
        EngineConfig::new(),
        Arc::new(model),
        Arc::new(CharTokenizer::new(true)),
    );
    assert!(result.err().unwrap().is_configuration());
}

#[test]
fn unencodable_prompt_fails_before_generation() {
    let gen = generator(EngineConfig::new());
    let request = GenerationRequest::batch(vec!["fine".into(), "caf\u{e9}".into()])
        .with_session_ids(vec!["a".into(), "b".into()]);
    assert!(matches!(gen.generate(request), Err(EngineError::Tokenizer(_))));
    assert!(!gen.router().contains("a"));
}

#[test]
fn config_loads_from_json_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{"sequence_length": 24, "prompt_sequence_length": 4, "internal_kv_cache": true}}"#
    )
    .unwrap();

    let config = EngineConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.sequence_length, 24);
    assert_eq!(config.prompt_sequence_length, 4);
    assert!(config.internal_kv_cache);
    assert!(config.prepend_bos);

    let gen = generator(config);
    assert_eq!(gen.engine().cache_mode(), CacheMode::Opaque);
    assert!(gen.freezes_first_position());
}

#[test]
fn bad_json_is_a_configuration_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{{ not json").unwrap();
    assert!(EngineConfig::from_json_file(file.path())
        .unwrap_err()
        .is_configuration());
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[test]
fn session_counts_processed_tokens_across_requests() {
    let gen = generator(EngineConfig::new());
    let first = gen
        .generate(
            GenerationRequest::new("hello?")
                .with_session("s")
                .with_config(forced(4)),
        )
        .unwrap();
    // <s> + 6 prompt chars + 3 fed decode tokens; the fourth is pending.
    assert_eq!(first.total_num_processed_tokens, vec![10]);
    assert_eq!(first.generations[0][0].token_ids.len(), 4);

    let second = gen
        .generate(
            GenerationRequest::new("ok")
                .with_session("s")
                .with_config(forced(2)),
        )
        .unwrap();
    // pending token + 2 prompt chars + 1 fed decode token.
    assert_eq!(second.total_num_processed_tokens, vec![14]);
    assert_eq!(gen.total_num_processed_tokens("s").unwrap(), 14);
}

#[test]
fn sessions_do_not_share_state() {
    let gen = generator(EngineConfig::new().with_sequence_length(32).with_prompt_sequence_length(4));
    let request = |id: &str| {
        GenerationRequest::new("same prompt")
            .with_session(id)
            .with_config(forced(5))
    };

    let alone = gen.generate(request("a")).unwrap();
    gen.generate(request("b")).unwrap();
    gen.generate(request("b")).unwrap();

    gen.reset_session("a").unwrap();
    let again = gen.generate(request("a")).unwrap();
    assert_eq!(alone.generations, again.generations);
    assert_eq!(
        gen.total_num_processed_tokens("a").unwrap(),
        alone.total_num_processed_tokens[0]
    );
}

#[test]
fn unknown_session_lookups_fail() {
    let gen = generator(EngineConfig::new());
    assert!(matches!(
        gen.kv_cache_state("nope"),
        Err(EngineError::SessionNotFound(_))
    ));
    assert!(matches!(
        gen.remove_session("nope"),
        Err(EngineError::SessionNotFound(_))
    ));
}

#[test]
fn sessionless_requests_register_nothing() {
    let model = Arc::new(TinyModel::new(TinyModelConfig::default()).unwrap());
    let gen = TextGenerator::with_components(
        EngineConfig::new().with_internal_kv_cache(true),
        model,
        Arc::new(CharTokenizer::new(true)),
    )
    .unwrap();

    let request = GenerationRequest::batch(vec!["one".into(), "two".into()]).with_config(
        forced(3)
            .with_do_sample(true)
            .with_seed(1)
            .with_num_return_sequences(2),
    );
    let out = gen.generate(request).unwrap();
    assert_eq!(out.generations.len(), 2);
    assert!(out.generations.iter().all(|g| g.len() == 2));
    assert!(gen.router().is_empty());
}

// ---------------------------------------------------------------------------
// Numerical safety
// ---------------------------------------------------------------------------

#[test]
fn non_finite_logits_leave_cache_untouched() {
    let gen = poisoned_generator(EngineConfig::new());

    let err = gen
        .generate(GenerationRequest::new("ab~").with_session("s"))
        .unwrap_err();
    assert!(matches!(err, EngineError::NumericalAnomaly { position: 3 }));
    assert_eq!(gen.total_num_processed_tokens("s").unwrap(), 0);

    let snapshot = gen.kv_cache_state("s").unwrap();
    assert!(snapshot
        .values()
        .all(|t| t.data().iter().all(|&v| v == 0.0)));
}

fn poisoned_generator(config: EngineConfig) -> TextGenerator {
    let tokenizer = CharTokenizer::new(true);
    let poison = tokenizer.encode("~").unwrap()[0] as usize;
    let model = PoisonModel {
        inner: TinyModel::new(TinyModelConfig::default()).unwrap(),
        poison,
    };
    TextGenerator::with_components(config, Arc::new(model), Arc::new(tokenizer)).unwrap()
}

#[test]
fn failed_later_chunk_keeps_committed_pending_token() {
    let gen = poisoned_generator(EngineConfig::new().with_prompt_sequence_length(2));

    let first = gen
        .generate(GenerationRequest::new("ab").with_session("s").with_config(forced(3)))
        .unwrap();
    let g1 = first.generations[0][0].text.clone();
    let before = gen.total_num_processed_tokens("s").unwrap();
    assert_eq!(gen.router().get("s").unwrap().lock().pending_tokens().len(), 1);

    // Chunks: [pending, 'x'] commits, ['y', '~'] fails.
    let err = gen
        .generate(GenerationRequest::new("xy~").with_session("s").with_config(forced(3)))
        .unwrap_err();
    assert!(matches!(err, EngineError::NumericalAnomaly { .. }));
    assert_eq!(gen.total_num_processed_tokens("s").unwrap(), before + 2);
    assert!(gen.router().get("s").unwrap().lock().pending_tokens().is_empty());

    let resumed = gen
        .generate(GenerationRequest::new("cd").with_session("s").with_config(forced(3)))
        .unwrap();
    let fresh = gen
        .generate(
            GenerationRequest::new(format!("ab{g1}xcd"))
                .with_session("fresh")
                .with_config(forced(3)),
        )
        .unwrap();
    assert_eq!(resumed.generations[0][0].text, fresh.generations[0][0].text);
    assert_eq!(
        gen.total_num_processed_tokens("s").unwrap(),
        gen.total_num_processed_tokens("fresh").unwrap()
    );
}

#[test]
fn failed_first_chunk_keeps_pending_token() {
    let gen = poisoned_generator(EngineConfig::new().with_prompt_sequence_length(2));
    gen.generate(GenerationRequest::new("ab").with_session("s").with_config(forced(3)))
        .unwrap();
    let before = gen.total_num_processed_tokens("s").unwrap();

    // The pending token and '~' share the first chunk, so nothing commits.
    assert!(gen
        .generate(GenerationRequest::new("~").with_session("s").with_config(forced(3)))
        .is_err());
    assert_eq!(gen.total_num_processed_tokens("s").unwrap(), before);
    assert_eq!(gen.router().get("s").unwrap().lock().pending_tokens().len(), 1);
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

#[test]
fn scores_with_prompt_logits() {
    let gen = generator(EngineConfig::new());
    let config = forced(4).with_output_scores(true);

    let out = gen
        .generate(
            GenerationRequest::new("hello?")
                .with_config(config.clone())
                .with_prompt_logits(true),
        )
        .unwrap();
    let score = out.generations[0][0].score.as_ref().unwrap();
    // 7 prompt rows; the last also scores the first generated token.
    assert_eq!(score.len(), 7 + 3);
    assert!(score.iter().all(|row| row.len() == 99));

    let plain = gen
        .generate(GenerationRequest::new("hello?").with_config(config))
        .unwrap();
    let plain_score = plain.generations[0][0].score.as_ref().unwrap();
    assert_eq!(plain_score.len(), 4);
    assert_eq!(plain_score[0], score[6]);
    assert_eq!(plain_score[1..], score[7..]);

    let none = gen
        .generate(GenerationRequest::new("hello?").with_config(forced(4)))
        .unwrap();
    assert!(none.generations[0][0].score.is_none());
}

#[test]
fn snapshots_follow_cache_mode() {
    let external = generator(EngineConfig::new().with_sequence_length(32));
    let out = external
        .generate(
            GenerationRequest::new("abc")
                .with_config(forced(2))
                .with_kv_cache_state(true),
        )
        .unwrap();
    let state = &out.kv_cache_state.unwrap()[0];
    assert_eq!(state.len(), 4);
    assert_eq!(state["past_key_values.1.value"].shape(), [1, 4, 32, 8]);
    assert!(state["past_key_values.0.key"].data().iter().any(|&v| v != 0.0));

    let opaque = generator(EngineConfig::new().with_internal_kv_cache(true));
    let out = opaque
        .generate(
            GenerationRequest::new("abc")
                .with_config(forced(2))
                .with_kv_cache_state(true),
        )
        .unwrap();
    assert!(out.kv_cache_state.unwrap()[0].values().all(KvTensor::is_empty));

    let without = opaque
        .generate(GenerationRequest::new("abc").with_config(forced(2)))
        .unwrap();
    assert!(without.kv_cache_state.is_none());
}

#[test]
fn output_serializes_without_cache_state() {
    let gen = generator(EngineConfig::new());
    let out = gen
        .generate(GenerationRequest::new("hi").with_config(forced(2)))
        .unwrap();
    let json = serde_json::to_value(&out).unwrap();
    assert!(json.get("kv_cache_state").is_none());
    assert_eq!(json["generations"][0][0]["finish_reason"], "length");
    assert_eq!(json["stats"]["generated_tokens"], 2);
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[test]
fn stream_matches_blocking_generation() {
    let gen = generator(EngineConfig::new());
    let blocking = gen
        .generate(GenerationRequest::new("stream me").with_config(forced(6)))
        .unwrap();

    let stream = gen
        .generate_stream(GenerationRequest::new("stream me").with_config(forced(6)))
        .unwrap();
    let mut tokens = Vec::new();
    let mut finished = None;
    for event in stream {
        match event.unwrap() {
            StreamEvent::Token(t) => {
                assert_eq!(t.index, tokens.len());
                tokens.push(t.token_id);
            }
            StreamEvent::Finished(out) => finished = Some(out),
        }
    }

    assert_eq!(tokens, blocking.generations[0][0].token_ids);
    assert_eq!(finished.unwrap().generations, blocking.generations);
}

#[test]
fn open_stream_makes_its_session_busy() {
    let gen = generator(EngineConfig::new());
    let mut stream = gen
        .generate_stream(GenerationRequest::new("busy").with_session("s").with_config(forced(20)))
        .unwrap();
    assert!(matches!(stream.next(), Some(Ok(StreamEvent::Token(_)))));

    let again = GenerationRequest::new("x").with_session("s").with_config(forced(2));
    assert!(matches!(
        gen.generate(again.clone()),
        Err(EngineError::SessionBusy(id)) if id == "s"
    ));
    assert!(matches!(
        gen.generate_stream(again.clone()),
        Err(EngineError::SessionBusy(_))
    ));
    assert!(matches!(gen.kv_cache_state("s"), Err(EngineError::SessionBusy(_))));
    assert!(matches!(
        gen.total_num_processed_tokens("s"),
        Err(EngineError::SessionBusy(_))
    ));
    assert!(matches!(gen.reset_session("s"), Err(EngineError::SessionBusy(_))));
    assert!(gen
        .generate(GenerationRequest::new("x").with_session("other").with_config(forced(2)))
        .is_ok());

    stream.cancel();
    assert!(gen.generate(again).is_ok());
}

#[test]
fn finished_stream_frees_its_session() {
    let gen = generator(EngineConfig::new());
    let mut stream = gen
        .generate_stream(GenerationRequest::new("done").with_session("s").with_config(forced(3)))
        .unwrap();
    let finished = stream
        .by_ref()
        .map(|event| event.unwrap())
        .any(|event| matches!(event, StreamEvent::Finished(_)));
    assert!(finished);

    // The stream object is still alive, but its worker already let go.
    assert!(gen
        .generate(GenerationRequest::new("more").with_session("s").with_config(forced(2)))
        .is_ok());
    drop(stream);
}

#[test]
fn run_dispatches_on_streaming_flag() {
    let gen = generator(EngineConfig::new());
    let request = GenerationRequest::new("x").with_config(forced(3));
    assert!(matches!(
        gen.run(request.clone()).unwrap(),
        GenerationResponse::Complete(_)
    ));
    match gen.run(request.with_streaming(true)).unwrap() {
        GenerationResponse::Stream(stream) => {
            let out = stream.collect_output().unwrap();
            assert_eq!(out.generations[0][0].token_ids.len(), 3);
        }
        GenerationResponse::Complete(_) => panic!("expected a stream"),
    }
}

#[test]
fn cancelled_stream_keeps_only_delivered_tokens() {
    let gen = generator(EngineConfig::new());
    let mut stream = gen
        .generate_stream(
            GenerationRequest::new("hello?")
                .with_session("s")
                .with_config(forced(20)),
        )
        .unwrap();

    let mut delivered = Vec::new();
    for _ in 0..2 {
        match stream.next().unwrap().unwrap() {
            StreamEvent::Token(t) => delivered.push(t.token_id),
            StreamEvent::Finished(_) => panic!("finished early"),
        }
    }
    stream.cancel();

    let handle = gen.router().get("s").unwrap();
    let session = handle.lock();
    // Everything delivered is either in the cache or pending, nothing more.
    assert_eq!(
        session.total_processed_tokens() + session.pending_tokens().len(),
        7 + delivered.len()
    );
    if let Some(&last) = session.pending_tokens().last() {
        assert_eq!(last, delivered[1]);
    }
}

#[test]
fn stream_rejects_batches() {
    let gen = generator(EngineConfig::new());
    let batch = GenerationRequest::batch(vec!["a".into(), "b".into()]);
    assert!(gen.generate_stream(batch).err().unwrap().is_configuration());

    let multi = GenerationRequest::new("a")
        .with_config(GenerationConfig::new().with_num_return_sequences(2));
    assert!(gen.generate_stream(multi).err().unwrap().is_configuration());
}
