//! # kvgen-kv
//!
//! First-class KV cache implementation for kvgen.
//!
//! Supports:
//! - **Chunked writes**: Appends K/V for one or more tokens `[n, n_heads, head_dim]`
//! - **Eviction**: Drops a contiguous range of entries, keeping the rest in order
//! - **Multi-layer**: [`SessionKVCache`] keeps every layer at the same length
//! - **Snapshots**: Materializes `[1, heads, capacity, head_dim]` tensors for inspection
//! - **Capacity policy**: [`CapacityManager`] decides what to evict before a write

use std::collections::BTreeMap;

pub mod capacity;
pub mod tensor;

pub use capacity::{CapacityManager, Eviction};
pub use tensor::KvTensor;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("write of {seq_len} entries exceeds cache capacity {max}")]
    CapacityExceeded { seq_len: usize, max: usize },

    #[error("kv shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("eviction of {count} entries at {start} is out of range (seq_len={seq_len})")]
    EvictionOutOfRange {
        start: usize,
        count: usize,
        seq_len: usize,
    },

    #[error("cache capacity {capacity} is too small: at least {required} slots are required")]
    InvalidCapacity { capacity: usize, required: usize },

    #[error("chunk of {chunk} tokens cannot fit in {available} evictable slots")]
    ChunkTooLarge { chunk: usize, available: usize },
}

impl KVError {
    /// Whether the error comes from the capacity policy rather than a bad write.
    pub fn is_capacity_error(&self) -> bool {
        matches!(
            self,
            KVError::InvalidCapacity { .. } | KVError::ChunkTooLarge { .. }
        )
    }
}

pub type KVResult<T> = Result<T, KVError>;

/// K and V entries of one layer, oldest first.
///
/// `seq_len <= capacity` always holds; slots past `seq_len` are stale.
#[derive(Debug, Clone)]
pub struct LayerKVCache {
    /// `[capacity, n_heads, head_dim]` flattened.
    pub k: Vec<f32>,
    pub v: Vec<f32>,
    pub capacity: usize,
    pub n_heads: usize,
    pub head_dim: usize,
    /// Number of valid entries.
    pub seq_len: usize,
}

impl LayerKVCache {
    pub fn new(capacity: usize, n_heads: usize, head_dim: usize) -> Self {
        let len = capacity * n_heads * head_dim;
        Self {
            k: vec![0.0; len],
            v: vec![0.0; len],
            capacity,
            n_heads,
            head_dim,
            seq_len: 0,
        }
    }

    /// Elements per token: `n_heads * head_dim`.
    pub fn token_width(&self) -> usize {
        self.n_heads * self.head_dim
    }

    /// Keys of the valid entries, `[seq_len, n_heads, head_dim]` flattened.
    pub fn keys(&self) -> &[f32] {
        &self.k[..self.seq_len * self.token_width()]
    }

    /// Values of the valid entries, `[seq_len, n_heads, head_dim]` flattened.
    pub fn values(&self) -> &[f32] {
        &self.v[..self.seq_len * self.token_width()]
    }

    /// Append exactly one entry.
    pub fn append_token(&mut self, k: &[f32], v: &[f32]) -> KVResult<()> {
        let width = self.token_width();
        if let Some(bad) = [k.len(), v.len()].into_iter().find(|&n| n != width) {
            return Err(KVError::ShapeMismatch {
                expected: width,
                got: bad,
            });
        }
        self.append_tokens(k, v)
    }

    /// Append K and V for a run of tokens, `[n, n_heads, head_dim]` flattened.
    ///
    /// # Errors
    /// - `CapacityExceeded`: If the run does not fit in the remaining slots
    /// - `ShapeMismatch`: If the buffers are not a whole number of tokens or differ in length
    pub fn append_tokens(&mut self, k_seq: &[f32], v_seq: &[f32]) -> KVResult<()> {
        let n = self.check_write(k_seq, v_seq)?;
        let width = self.token_width();
        let offset = self.seq_len * width;
        self.k[offset..offset + n * width].copy_from_slice(k_seq);
        self.v[offset..offset + n * width].copy_from_slice(v_seq);
        self.seq_len += n;

        Ok(())
    }

    /// Validate a write and return the number of tokens it carries.
    fn check_write(&self, k_seq: &[f32], v_seq: &[f32]) -> KVResult<usize> {
        let width = self.token_width();
        if k_seq.len() != v_seq.len() || k_seq.len() % width != 0 {
            let got_len = if k_seq.len() % width != 0 {
                k_seq.len()
            } else {
                v_seq.len()
            };
            return Err(KVError::ShapeMismatch {
                expected: width,
                got: got_len,
            });
        }

        let n = k_seq.len() / width;
        if self.seq_len + n > self.capacity {
            return Err(KVError::CapacityExceeded {
                seq_len: self.seq_len + n,
                max: self.capacity,
            });
        }
        Ok(n)
    }

    fn check_evict(&self, start: usize, count: usize) -> KVResult<()> {
        if start + count > self.seq_len {
            return Err(KVError::EvictionOutOfRange {
                start,
                count,
                seq_len: self.seq_len,
            });
        }
        Ok(())
    }

    /// Remove `count` entries starting at `start`; later entries shift down in order.
    pub fn evict(&mut self, start: usize, count: usize) -> KVResult<()> {
        self.check_evict(start, count)?;
        if count == 0 {
            return Ok(());
        }

        let width = self.token_width();
        let src = (start + count) * width..self.seq_len * width;
        let dst = start * width;
        self.k.copy_within(src.clone(), dst);
        self.v.copy_within(src, dst);
        self.seq_len -= count;

        Ok(())
    }
}

/// The K/V entries of every layer for one session.
///
/// Writes and evictions apply to all layers or none, so every layer always
/// holds the same number of entries.
#[derive(Debug, Clone)]
pub struct SessionKVCache {
    layers: Vec<LayerKVCache>,
}

impl SessionKVCache {
    /// # Panics
    /// If `n_layers` is zero.
    pub fn new(n_layers: usize, capacity: usize, n_heads: usize, head_dim: usize) -> Self {
        assert!(n_layers > 0, "a session cache needs at least one layer");
        Self {
            layers: vec![LayerKVCache::new(capacity, n_heads, head_dim); n_layers],
        }
    }

    pub fn layer(&self, layer_idx: usize) -> Option<&LayerKVCache> {
        self.layers.get(layer_idx)
    }

    /// Number of valid entries, identical across layers.
    pub fn seq_len(&self) -> usize {
        self.layers[0].seq_len
    }

    /// Maximum number of cached positions.
    pub fn capacity(&self) -> usize {
        self.layers[0].capacity
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn n_heads(&self) -> usize {
        self.layers[0].n_heads
    }

    pub fn head_dim(&self) -> usize {
        self.layers[0].head_dim
    }

    fn check_layer_count(&self, got: usize) -> KVResult<()> {
        if got != self.layers.len() {
            return Err(KVError::ShapeMismatch {
                expected: self.layers.len(),
                got,
            });
        }
        Ok(())
    }

    /// Append one entry per layer.
    pub fn append_token(&mut self, k_tokens: &[&[f32]], v_tokens: &[&[f32]]) -> KVResult<()> {
        for (layer, k) in self.layers.iter().zip(k_tokens) {
            if k.len() != layer.token_width() {
                return Err(KVError::ShapeMismatch {
                    expected: layer.token_width(),
                    got: k.len(),
                });
            }
        }
        self.append_tokens(k_tokens, v_tokens)
    }

    /// Append K/V for a run of tokens to all layers.
    ///
    /// Every layer is validated before any is written, so a failed call leaves
    /// the cache exactly as it was.
    pub fn append_tokens(&mut self, k_seqs: &[&[f32]], v_seqs: &[&[f32]]) -> KVResult<()> {
        self.check_layer_count(k_seqs.len())?;
        self.check_layer_count(v_seqs.len())?;

        let mut run_len = None;
        for (i, layer) in self.layers.iter().enumerate() {
            let n = layer.check_write(k_seqs[i], v_seqs[i])?;
            match run_len {
                None => run_len = Some(n),
                Some(expected) if expected != n => {
                    return Err(KVError::ShapeMismatch { expected, got: n });
                }
                Some(_) => {}
            }
        }

        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.append_tokens(k_seqs[i], v_seqs[i])?;
        }

        Ok(())
    }

    /// Remove `count` entries starting at `start` from every layer.
    pub fn evict(&mut self, start: usize, count: usize) -> KVResult<()> {
        self.layers[0].check_evict(start, count)?;
        for layer in &mut self.layers {
            layer.evict(start, count)?;
        }
        tracing::trace!(start, count, seq_len = self.seq_len(), "evicted kv entries");
        Ok(())
    }

    /// Materialize every layer as `past_key_values.{i}.key` / `.value` tensors.
    pub fn snapshot(&self) -> BTreeMap<String, KvTensor> {
        let mut tensors = BTreeMap::new();
        for (i, layer) in self.layers.iter().enumerate() {
            tensors.insert(key_name(i), KvTensor::right_aligned(layer, layer.keys()));
            tensors.insert(value_name(i), KvTensor::right_aligned(layer, layer.values()));
        }
        tensors
    }
}

/// Snapshot for a cache the caller cannot see: every tensor has a zero batch dimension.
pub fn opaque_snapshot(n_layers: usize, n_heads: usize, head_dim: usize) -> BTreeMap<String, KvTensor> {
    let mut tensors = BTreeMap::new();
    for i in 0..n_layers {
        tensors.insert(key_name(i), KvTensor::zeros([0, n_heads, 0, head_dim]));
        tensors.insert(value_name(i), KvTensor::zeros([0, n_heads, 0, head_dim]));
    }
    tensors
}

pub fn key_name(layer: usize) -> String {
    format!("past_key_values.{layer}.key")
}

pub fn value_name(layer: usize) -> String {
    format!("past_key_values.{layer}.value")
}
