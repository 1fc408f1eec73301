//! Per-session generation state.

use kvgen_tokenizer::TokenId;

use crate::engine::CacheState;

/// One independent cache lineage.
///
/// `pending_tokens` holds tokens that were emitted to the caller but not yet
/// run through the model (the last token of a finished turn). The next
/// prefill on this session replays them first, so a multi-turn cache ends up
/// identical to the cache of one prompt holding the whole transcript.
///
/// Sessions are not `Clone`: duplicating one would alias an opaque cache handle.
#[derive(Debug)]
pub struct Session {
    id: String,
    cache: CacheState,
    total_processed_tokens: usize,
    pending_tokens: Vec<TokenId>,
}

impl Session {
    pub fn new(id: impl Into<String>, cache: CacheState) -> Self {
        Self {
            id: id.into(),
            cache,
            total_processed_tokens: 0,
            pending_tokens: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cache(&self) -> &CacheState {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut CacheState {
        &mut self.cache
    }

    /// Tokens run through the model so far, evicted ones included.
    pub fn total_processed_tokens(&self) -> usize {
        self.total_processed_tokens
    }

    pub(crate) fn record_processed(&mut self, n: usize) {
        self.total_processed_tokens += n;
    }

    pub fn pending_tokens(&self) -> &[TokenId] {
        &self.pending_tokens
    }

    pub(crate) fn push_pending(&mut self, token: TokenId) {
        self.pending_tokens.push(token);
    }

    pub(crate) fn pop_pending(&mut self) -> Option<TokenId> {
        self.pending_tokens.pop()
    }

    pub(crate) fn take_pending(&mut self) -> Vec<TokenId> {
        std::mem::take(&mut self.pending_tokens)
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending_tokens.clear();
    }

    /// Nothing has been processed or emitted yet.
    pub fn is_fresh(&self) -> bool {
        self.total_processed_tokens == 0 && self.pending_tokens.is_empty()
    }

    /// Start over with a new cache.
    pub(crate) fn reset(&mut self, cache: CacheState) {
        self.cache = cache;
        self.total_processed_tokens = 0;
        self.pending_tokens.clear();
    }
}
