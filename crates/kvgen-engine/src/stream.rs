//! Token streaming.
//!
//! A worker thread drives the decode loop and hands each token over a
//! rendezvous channel, so the worker is never more than one token ahead of
//! the consumer. Dropping or cancelling the stream raises the stop flag and
//! hangs up the channel; a token that could not be delivered is taken back
//! off the session before the worker exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use kvgen_tokenizer::TokenId;

use crate::decode::FinishReason;
use crate::error::{EngineError, Result};
use crate::generator::{
    assemble, GenerationOutput, GenerationRequest, Pipeline, PromptResult, Run,
};
use crate::router::{SessionHandle, SessionRouter, StreamClaim};
use crate::session::Session;

/// One streamed token.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamToken {
    pub index: usize,
    pub token_id: TokenId,
    pub text: String,
    /// Logits the token was selected from, when `output_scores` is set.
    pub score: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Token(StreamToken),
    /// Last event of a run that was not cancelled.
    Finished(GenerationOutput),
}

pub(crate) enum StreamSession {
    Routed(SessionHandle, StreamClaim),
    Ephemeral(Session),
}

/// Blocking iterator over a streamed generation.
pub struct GenerationStream {
    receiver: Option<Receiver<Result<StreamEvent>>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl GenerationStream {
    pub(crate) fn spawn(
        pipeline: Pipeline,
        router: Arc<SessionRouter>,
        session: StreamSession,
        prompt: Vec<TokenId>,
        request: GenerationRequest,
    ) -> Result<Self> {
        let (tx, rx) = bounded(0);
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();

        let worker = thread::Builder::new()
            .name("kvgen-stream".into())
            .spawn(move || {
                let outcome = match session {
                    StreamSession::Routed(handle, claim) => {
                        let outcome =
                            stream_run(&pipeline, &mut handle.lock(), &prompt, &request, worker_stop, &tx);
                        // Free the session before the final event reaches the consumer.
                        drop(claim);
                        outcome
                    }
                    StreamSession::Ephemeral(mut session) => {
                        let outcome =
                            stream_run(&pipeline, &mut session, &prompt, &request, worker_stop, &tx);
                        router.release(&session);
                        outcome
                    }
                };
                deliver(outcome, &tx);
            })
            .map_err(|err| {
                tracing::error!(error = %err, "failed to spawn stream worker");
                EngineError::WorkerUnavailable
            })?;

        Ok(Self {
            receiver: Some(rx),
            stop,
            worker: Some(worker),
        })
    }

    /// Stop generating. Tokens already received stay committed to the
    /// session; an undelivered one is discarded.
    pub fn cancel(mut self) {
        self.shutdown();
    }

    /// Drain the stream, returning the final output.
    pub fn collect_output(mut self) -> Result<GenerationOutput> {
        while let Some(event) = self.next() {
            if let StreamEvent::Finished(output) = event? {
                return Ok(output);
            }
        }
        Err(EngineError::WorkerUnavailable)
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.receiver.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("stream worker panicked");
            }
        }
    }
}

impl Iterator for GenerationStream {
    type Item = Result<StreamEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.as_ref()?.recv().ok()
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deliver(outcome: Result<Option<GenerationOutput>>, tx: &Sender<Result<StreamEvent>>) {
    match outcome {
        Ok(Some(output)) => {
            let _ = tx.send(Ok(StreamEvent::Finished(output)));
        }
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(error = %err, "stream failed");
            let _ = tx.send(Err(err));
        }
    }
}

/// Returns `None` when the consumer went away.
fn stream_run(
    pipeline: &Pipeline,
    session: &mut Session,
    prompt: &[TokenId],
    request: &GenerationRequest,
    stop: Arc<AtomicBool>,
    tx: &Sender<Result<StreamEvent>>,
) -> Result<Option<GenerationOutput>> {
    let config = &request.generation_config;
    let mut run: Run = pipeline.start(
        session,
        prompt,
        config,
        config.sampler(0),
        request.include_prompt_logits,
        stop,
    )?;

    while let Some(token) =
        run.decoder
            .step(&pipeline.prefill, pipeline.tokenizer.as_ref(), session)?
    {
        let event = StreamEvent::Token(StreamToken {
            index: token.index,
            token_id: token.id,
            text: token.text,
            score: config.output_scores.then_some(token.logits),
        });
        if tx.send(Ok(event)).is_err() {
            session.pop_pending();
            run.decoder.retract_last();
            tracing::debug!(
                session_id = session.id(),
                delivered = run.decoder.generated().len(),
                "stream consumer disconnected"
            );
            return Ok(None);
        }
    }

    if run.decoder.finish_reason() == Some(FinishReason::Cancelled) {
        return Ok(None);
    }

    let kv_cache_state = if request.include_kv_cache_state {
        Some(pipeline.prefill.engine().snapshot(session.cache())?)
    } else {
        None
    };
    let total_processed = session.total_processed_tokens();
    let (generation, stats) = run.finish();
    Ok(Some(assemble(
        vec![PromptResult {
            generations: vec![generation],
            total_processed,
            kv_cache_state,
            stats: vec![stats],
        }],
        request.include_kv_cache_state,
    )))
}
