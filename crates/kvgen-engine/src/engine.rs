//! Cache-ownership engines.
//!
//! Both variants implement [`CacheEngine`], the contract the prefill engine,
//! the decode loop and the capacity policy are written against:
//!
//! - [`ExternalCacheEngine`]: each session carries its materialized
//!   `SessionKVCache`, and snapshots expose the real tensors.
//! - [`OpaqueCacheEngine`]: the engine keeps every cache behind a handle;
//!   sessions only hold the handle and snapshots come back empty.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use kvgen_kv::{opaque_snapshot, KvTensor, SessionKVCache};
use kvgen_models::{ForwardModel, ModelDims};
use kvgen_tokenizer::{TokenId, TokenizerError};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Where a session's cache lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    External,
    Opaque,
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheMode::External => write!(f, "external"),
            CacheMode::Opaque => write!(f, "opaque"),
        }
    }
}

/// A session's view of its cache.
#[derive(Debug)]
pub enum CacheState {
    Materialized(SessionKVCache),
    Opaque(Uuid),
}

/// Shared prefill/decode contract over a session cache.
pub trait CacheEngine: Send + Sync {
    fn cache_mode(&self) -> CacheMode;

    fn dims(&self) -> ModelDims;

    /// Maximum number of cached positions per session.
    fn capacity(&self) -> usize;

    /// Create an empty cache for a new session.
    fn allocate(&self) -> CacheState;

    /// Number of valid entries currently cached.
    fn filled_len(&self, state: &CacheState) -> Result<usize>;

    /// Drop `count` entries starting at `start`.
    fn evict(&self, state: &mut CacheState, start: usize, count: usize) -> Result<()>;

    /// Run `tokens` at absolute positions `start_position..` and commit their
    /// K/V rows. Returns one logits row per token. On error nothing is written.
    fn forward(
        &self,
        state: &mut CacheState,
        tokens: &[TokenId],
        start_position: usize,
    ) -> Result<Vec<Vec<f32>>>;

    /// `past_key_values.{layer}.key|value` tensors for inspection.
    fn snapshot(&self, state: &CacheState) -> Result<BTreeMap<String, KvTensor>>;

    /// Free engine-side resources held for this cache.
    fn release(&self, state: &CacheState);
}

fn to_model_ids(tokens: &[TokenId]) -> Result<Vec<usize>> {
    tokens
        .iter()
        .map(|&t| usize::try_from(t).map_err(|_| EngineError::from(TokenizerError::InvalidToken(t))))
        .collect()
}

/// Evaluate and commit, refusing rows that are not finite.
fn forward_and_commit(
    model: &dyn ForwardModel,
    cache: &mut SessionKVCache,
    tokens: &[TokenId],
    start_position: usize,
) -> Result<Vec<Vec<f32>>> {
    let ids = to_model_ids(tokens)?;
    let out = model.forward(cache, &ids, start_position)?;

    if let Some(row) = out
        .logits
        .iter()
        .position(|row| row.iter().any(|v| !v.is_finite()))
    {
        tracing::warn!(
            position = start_position + row,
            "non-finite logits, cache left unchanged"
        );
        return Err(EngineError::NumericalAnomaly {
            position: start_position + row,
        });
    }

    cache.append_tokens(&out.key_refs(), &out.value_refs())?;
    Ok(out.logits)
}

fn wrong_variant(expected: CacheMode) -> EngineError {
    EngineError::Configuration(format!("cache state does not belong to the {expected} engine"))
}

/// Engine whose sessions own materialized caches.
pub struct ExternalCacheEngine {
    model: Arc<dyn ForwardModel>,
    capacity: usize,
}

impl ExternalCacheEngine {
    pub fn new(model: Arc<dyn ForwardModel>, capacity: usize) -> Self {
        Self { model, capacity }
    }

    fn cache<'a>(&self, state: &'a CacheState) -> Result<&'a SessionKVCache> {
        match state {
            CacheState::Materialized(cache) => Ok(cache),
            CacheState::Opaque(_) => Err(wrong_variant(CacheMode::External)),
        }
    }

    fn cache_mut<'a>(&self, state: &'a mut CacheState) -> Result<&'a mut SessionKVCache> {
        match state {
            CacheState::Materialized(cache) => Ok(cache),
            CacheState::Opaque(_) => Err(wrong_variant(CacheMode::External)),
        }
    }
}

impl CacheEngine for ExternalCacheEngine {
    fn cache_mode(&self) -> CacheMode {
        CacheMode::External
    }

    fn dims(&self) -> ModelDims {
        self.model.dims()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn allocate(&self) -> CacheState {
        CacheState::Materialized(self.model.dims().new_cache(self.capacity))
    }

    fn filled_len(&self, state: &CacheState) -> Result<usize> {
        Ok(self.cache(state)?.seq_len())
    }

    fn evict(&self, state: &mut CacheState, start: usize, count: usize) -> Result<()> {
        Ok(self.cache_mut(state)?.evict(start, count)?)
    }

    fn forward(
        &self,
        state: &mut CacheState,
        tokens: &[TokenId],
        start_position: usize,
    ) -> Result<Vec<Vec<f32>>> {
        let cache = self.cache_mut(state)?;
        forward_and_commit(self.model.as_ref(), cache, tokens, start_position)
    }

    fn snapshot(&self, state: &CacheState) -> Result<BTreeMap<String, KvTensor>> {
        Ok(self.cache(state)?.snapshot())
    }

    fn release(&self, _state: &CacheState) {}
}

/// Engine that keeps every cache internally, keyed by an opaque handle.
pub struct OpaqueCacheEngine {
    model: Arc<dyn ForwardModel>,
    capacity: usize,
    caches: RwLock<HashMap<Uuid, Arc<Mutex<SessionKVCache>>>>,
}

impl OpaqueCacheEngine {
    pub fn new(model: Arc<dyn ForwardModel>, capacity: usize) -> Self {
        Self {
            model,
            capacity,
            caches: RwLock::new(HashMap::new()),
        }
    }

    /// Number of caches currently held.
    pub fn live_caches(&self) -> usize {
        self.caches.read().len()
    }

    fn handle(&self, state: &CacheState) -> Result<Arc<Mutex<SessionKVCache>>> {
        let id = match state {
            CacheState::Opaque(id) => id,
            CacheState::Materialized(_) => return Err(wrong_variant(CacheMode::Opaque)),
        };
        self.caches
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::SessionNotFound(format!("cache handle {id}")))
    }
}

impl CacheEngine for OpaqueCacheEngine {
    fn cache_mode(&self) -> CacheMode {
        CacheMode::Opaque
    }

    fn dims(&self) -> ModelDims {
        self.model.dims()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn allocate(&self) -> CacheState {
        let id = Uuid::new_v4();
        let cache = self.model.dims().new_cache(self.capacity);
        self.caches.write().insert(id, Arc::new(Mutex::new(cache)));
        CacheState::Opaque(id)
    }

    fn filled_len(&self, state: &CacheState) -> Result<usize> {
        Ok(self.handle(state)?.lock().seq_len())
    }

    fn evict(&self, state: &mut CacheState, start: usize, count: usize) -> Result<()> {
        Ok(self.handle(state)?.lock().evict(start, count)?)
    }

    fn forward(
        &self,
        state: &mut CacheState,
        tokens: &[TokenId],
        start_position: usize,
    ) -> Result<Vec<Vec<f32>>> {
        let handle = self.handle(state)?;
        let mut cache = handle.lock();
        forward_and_commit(self.model.as_ref(), &mut cache, tokens, start_position)
    }

    fn snapshot(&self, state: &CacheState) -> Result<BTreeMap<String, KvTensor>> {
        self.handle(state)?;
        let dims = self.model.dims();
        Ok(opaque_snapshot(dims.n_layers, dims.n_heads, dims.head_dim))
    }

    fn release(&self, state: &CacheState) {
        if let CacheState::Opaque(id) = state {
            self.caches.write().remove(id);
        }
    }
}
