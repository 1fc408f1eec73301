//! Prompt processing.
//!
//! Feeds a token sequence into a session cache, one position at a time
//! (`chunk_size == 1`) or in chunks of `chunk_size`. Before each write the
//! capacity policy makes room, so prompts longer than the cache are accepted.

use std::ops::Range;
use std::sync::Arc;

use kvgen_kv::CapacityManager;
use kvgen_tokenizer::TokenId;

use crate::engine::CacheEngine;
use crate::error::{EngineError, Result};
use crate::session::Session;

/// Logits for every fed position, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefillOutput {
    pub logits: Vec<Vec<f32>>,
    pub chunks: usize,
}

/// Writes token runs into a session cache under a capacity policy.
#[derive(Clone)]
pub struct PrefillEngine {
    engine: Arc<dyn CacheEngine>,
    capacity: CapacityManager,
    chunk_size: usize,
}

impl std::fmt::Debug for PrefillEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefillEngine")
            .field("capacity", &self.capacity)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl PrefillEngine {
    /// # Errors
    /// - `Configuration` if `chunk_size` is zero
    /// - `Capacity` if one chunk cannot fit after maximal eviction, or the
    ///   policy disagrees with the engine's cache size
    pub fn new(
        engine: Arc<dyn CacheEngine>,
        capacity: CapacityManager,
        chunk_size: usize,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(EngineError::Configuration(
                "prompt chunk size must be at least 1".into(),
            ));
        }
        if capacity.capacity() != engine.capacity() {
            return Err(EngineError::Capacity(format!(
                "capacity policy ({}) does not match cache size ({})",
                capacity.capacity(),
                engine.capacity()
            )));
        }
        capacity.check_chunk(chunk_size)?;

        Ok(Self {
            engine,
            capacity,
            chunk_size,
        })
    }

    pub fn engine(&self) -> &Arc<dyn CacheEngine> {
        &self.engine
    }

    pub fn capacity(&self) -> &CapacityManager {
        &self.capacity
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split `len` prompt positions into evaluation ranges.
    ///
    /// Multi-token mode only engages when the chunk is shorter than the
    /// prompt; otherwise the whole prompt is one evaluation.
    pub fn plan_chunks(&self, len: usize) -> Vec<Range<usize>> {
        let step = if self.chunk_size == 1 || self.chunk_size < len {
            self.chunk_size
        } else {
            len.max(1)
        };
        (0..len)
            .step_by(step)
            .map(|start| start..(start + step).min(len))
            .collect()
    }

    /// Process `tokens` into the session's cache.
    pub fn run(&self, session: &mut Session, tokens: &[TokenId]) -> Result<PrefillOutput> {
        if tokens.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }

        let plan = self.plan_chunks(tokens.len());
        let mut logits = Vec::with_capacity(tokens.len());
        for range in &plan {
            tracing::debug!(
                session_id = session.id(),
                start = range.start,
                len = range.len(),
                "prefill chunk"
            );
            logits.extend(self.advance(session, &tokens[range.clone()])?);
        }

        Ok(PrefillOutput {
            logits,
            chunks: plan.len(),
        })
    }

    /// One evaluation: evict as planned, run the tokens, bump the counter.
    pub fn advance(&self, session: &mut Session, tokens: &[TokenId]) -> Result<Vec<Vec<f32>>> {
        let filled = self.engine.filled_len(session.cache())?;
        if let Some(eviction) = self.capacity.plan(filled, tokens.len())? {
            tracing::debug!(
                session_id = session.id(),
                start = eviction.start,
                count = eviction.count,
                "evicting cache entries"
            );
            self.engine
                .evict(session.cache_mut(), eviction.start, eviction.count)?;
        }

        let start_position = session.total_processed_tokens();
        let rows = self
            .engine
            .forward(session.cache_mut(), tokens, start_position)?;
        session.record_processed(tokens.len());
        Ok(rows)
    }
}
