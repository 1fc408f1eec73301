//! The decode loop.
//!
//! [`Decoder::step`] produces one token per call. The token it emits is left
//! pending on the session and only run through the model at the start of the
//! next step, so a stopped loop never holds K/V for a token nobody asked for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kvgen_sampling::Sampler;
use kvgen_tokenizer::{DecodingState, TokenId, Tokenizer};
use serde::Serialize;

use crate::config::GenerationConfig;
use crate::error::Result;
use crate::prefill::PrefillEngine;
use crate::session::Session;

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// `max_length` new tokens were produced.
    Length,
    /// The model emitted end-of-sequence.
    Stop,
    /// The caller raised the stop flag.
    Cancelled,
}

/// One emitted token.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedToken {
    pub index: usize,
    pub id: TokenId,
    /// Text this token adds to the output.
    pub text: String,
    /// Logits the token was selected from.
    pub logits: Vec<f32>,
}

pub struct Decoder {
    sampler: Sampler,
    max_new_tokens: usize,
    eos: Option<TokenId>,
    /// Vocabulary entries that are never selected.
    masked: Vec<usize>,
    next_logits: Vec<f32>,
    history: Vec<usize>,
    generated: Vec<TokenId>,
    scores: Vec<Vec<f32>>,
    record_scores: bool,
    decoding: DecodingState,
    stop: Arc<AtomicBool>,
    finish: Option<FinishReason>,
}

impl Decoder {
    /// `first_logits` is the last prefill row; `prompt` seeds the repetition history.
    pub fn new(
        sampler: Sampler,
        config: &GenerationConfig,
        tokenizer: &dyn Tokenizer,
        prompt: &[TokenId],
        first_logits: Vec<f32>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let eos = tokenizer.eos_token();
        let masked = (0..tokenizer.vocab_size())
            .filter(|&id| {
                let token = id as TokenId;
                tokenizer.is_special(token) && (Some(token) != eos || config.force_max_tokens)
            })
            .collect();

        Self {
            sampler,
            max_new_tokens: config.max_length,
            eos: if config.force_max_tokens { None } else { eos },
            masked,
            next_logits: first_logits,
            history: prompt
                .iter()
                .filter_map(|&t| usize::try_from(t).ok())
                .collect(),
            generated: Vec::new(),
            scores: Vec::new(),
            record_scores: config.output_scores,
            decoding: DecodingState::new(),
            stop,
            finish: None,
        }
    }

    /// Produce the next token, or `None` once generation has finished.
    pub fn step(
        &mut self,
        prefill: &PrefillEngine,
        tokenizer: &dyn Tokenizer,
        session: &mut Session,
    ) -> Result<Option<GeneratedToken>> {
        if self.finish.is_some() {
            return Ok(None);
        }
        if self.generated.len() >= self.max_new_tokens {
            self.finish = Some(FinishReason::Length);
            return Ok(None);
        }
        if self.stop.load(Ordering::Acquire) {
            tracing::warn!(
                session_id = session.id(),
                generated = self.generated.len(),
                "generation cancelled"
            );
            self.finish = Some(FinishReason::Cancelled);
            return Ok(None);
        }

        if !session.pending_tokens().is_empty() {
            let pending = session.pending_tokens().to_vec();
            let rows = prefill.advance(session, &pending)?;
            session.clear_pending();
            if let Some(last) = rows.into_iter().last() {
                self.next_logits = last;
            }
        }

        let mut logits = self.next_logits.clone();
        for &id in &self.masked {
            if let Some(l) = logits.get_mut(id) {
                *l = f32::NEG_INFINITY;
            }
        }
        let token = self.sampler.sample_with_history(&logits, &self.history)? as TokenId;

        if Some(token) == self.eos {
            self.finish = Some(FinishReason::Stop);
            return Ok(None);
        }

        if self.record_scores {
            self.scores.push(self.next_logits.clone());
        }
        self.history.push(token as usize);
        self.generated.push(token);
        session.push_pending(token);

        let text = tokenizer.decode_token(token, &mut self.decoding)?;
        Ok(Some(GeneratedToken {
            index: self.generated.len() - 1,
            id: token,
            text,
            logits: self.next_logits.clone(),
        }))
    }

    /// Run `step` until it finishes.
    pub fn run_to_end(
        &mut self,
        prefill: &PrefillEngine,
        tokenizer: &dyn Tokenizer,
        session: &mut Session,
    ) -> Result<FinishReason> {
        while self.step(prefill, tokenizer, session)?.is_some() {}
        Ok(self.finish.unwrap_or(FinishReason::Length))
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish
    }

    pub fn generated(&self) -> &[TokenId] {
        &self.generated
    }

    /// Text of everything generated so far.
    pub fn text(&self) -> &str {
        self.decoding.buffer()
    }

    /// Logits each generated token was selected from (when scores are recorded).
    pub fn scores(&self) -> &[Vec<f32>] {
        &self.scores
    }

    /// Forget the most recent token; used when it could not be delivered.
    pub(crate) fn retract_last(&mut self) -> Option<TokenId> {
        let token = self.generated.pop()?;
        self.history.pop();
        if self.record_scores {
            self.scores.pop();
        }
        Some(token)
    }
}
