//! # kvgen-models
//!
//! Forward computation behind the kvgen engine.
//!
//! Provides:
//! - **RMSNorm**: Root Mean Square layer normalization
//! - **RoPE**: Rotary Position Embeddings at absolute positions
//! - **Attention**: causal multi-head attention over cached + fresh K/V rows
//! - **MLP**: SwiGLU feedforward
//! - [`ForwardModel`]: the contract the engine drives, and [`TinyModel`], a
//!   small deterministic transformer implementing it

use kvgen_kv::SessionKVCache;

pub mod tiny;

pub use tiny::{TinyModel, TinyModelConfig};

/// Error type for model computation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("token id {token} is outside the vocabulary (size {vocab_size})")]
    TokenOutOfRange { token: usize, vocab_size: usize },

    #[error("shape mismatch in {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid model config: {0}")]
    InvalidConfig(String),
}

pub type ModelResult<T> = std::result::Result<T, ModelError>;

/// Cache geometry and vocabulary of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDims {
    pub n_layers: usize,
    pub n_heads: usize,
    pub head_dim: usize,
    pub vocab_size: usize,
}

impl ModelDims {
    /// Allocate an empty cache shaped for this model.
    pub fn new_cache(&self, capacity: usize) -> SessionKVCache {
        SessionKVCache::new(self.n_layers, capacity, self.n_heads, self.head_dim)
    }
}

/// Output of one forward evaluation over a run of tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardOutput {
    /// One row of `vocab_size` logits per input token.
    pub logits: Vec<Vec<f32>>,
    /// Per layer, K rows for the input tokens, `[n, n_heads, head_dim]` flattened.
    pub keys: Vec<Vec<f32>>,
    /// Per layer, V rows for the input tokens.
    pub values: Vec<Vec<f32>>,
}

impl ForwardOutput {
    pub fn all_finite(&self) -> bool {
        self.logits.iter().flatten().all(|v| v.is_finite())
    }

    pub fn key_refs(&self) -> Vec<&[f32]> {
        self.keys.iter().map(Vec::as_slice).collect()
    }

    pub fn value_refs(&self) -> Vec<&[f32]> {
        self.values.iter().map(Vec::as_slice).collect()
    }
}

/// The per-token forward oracle.
///
/// Implementations read the cache but never write it: the caller decides
/// whether the returned K/V rows are committed.
pub trait ForwardModel: Send + Sync {
    fn dims(&self) -> ModelDims;

    /// Evaluate `tokens` placed at absolute positions `start_position..`.
    ///
    /// Query `i` attends over every cached entry and then input rows `0..=i`.
    fn forward(
        &self,
        cache: &SessionKVCache,
        tokens: &[usize],
        start_position: usize,
    ) -> ModelResult<ForwardOutput>;
}

/// Root Mean Square Layer Normalization.
///
/// Formula: `y = x / RMS(x) * weight`, where RMS(x) = sqrt(mean(x^2) + eps)
#[derive(Debug, Clone)]
pub struct RMSNorm {
    /// Learnable scale parameter, shape: [d_model]
    pub weight: Vec<f32>,
    /// Epsilon for numerical stability
    pub eps: f32,
}

impl RMSNorm {
    pub fn new(d_model: usize, eps: f32) -> Self {
        Self {
            weight: vec![1.0; d_model],
            eps,
        }
    }

    /// Normalize one `[d_model]` vector.
    pub fn forward(&self, x: &[f32]) -> ModelResult<Vec<f32>> {
        if x.len() != self.weight.len() {
            return Err(ModelError::ShapeMismatch {
                what: "rms_norm input",
                expected: self.weight.len(),
                got: x.len(),
            });
        }

        let mean_sq: f32 = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
        let rms = (mean_sq + self.eps).sqrt();

        Ok(x.iter()
            .zip(self.weight.iter())
            .map(|(&val, &w)| (val / rms) * w)
            .collect())
    }
}

/// Rotary Position Embeddings (RoPE).
///
/// Rotates each `(x[2i], x[2i+1])` pair of every head by `position * inv_freq[i]`.
#[derive(Debug, Clone)]
pub struct RoPE {
    /// Dimension of head (head_dim)
    pub dim: usize,
    /// Base for frequency calculation (default: 10000)
    pub base: f32,
    /// Inverse frequencies: [1/base^(2i/dim) for i in 0..dim/2]
    pub inv_freq: Vec<f32>,
}

impl RoPE {
    pub fn new(dim: usize, base: f32) -> ModelResult<Self> {
        if dim == 0 || dim % 2 != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "head_dim must be even and non-zero for RoPE, got {dim}"
            )));
        }

        let inv_freq: Vec<f32> = (0..dim / 2)
            .map(|i| 1.0 / base.powf(2.0 * i as f32 / dim as f32))
            .collect();

        Ok(Self { dim, base, inv_freq })
    }

    /// Rotate a `[n_heads, head_dim]` vector in place for one absolute position.
    pub fn rotate(&self, x: &mut [f32], position: usize) {
        let pos = position as f32;
        for head in x.chunks_exact_mut(self.dim) {
            for (i, &freq) in self.inv_freq.iter().enumerate() {
                let (sin, cos) = (pos * freq).sin_cos();
                let (a, b) = (head[2 * i], head[2 * i + 1]);
                head[2 * i] = a * cos - b * sin;
                head[2 * i + 1] = a * sin + b * cos;
            }
        }
    }
}

/// Matrix-vector multiply: `x @ W` where W is `[in_dim, out_dim]` row-major.
pub fn matvec(x: &[f32], w: &[f32], in_dim: usize, out_dim: usize) -> Vec<f32> {
    let mut out = vec![0.0; out_dim];
    for (j, &xj) in x.iter().enumerate().take(in_dim) {
        let row = &w[j * out_dim..(j + 1) * out_dim];
        for (o, &wij) in out.iter_mut().zip(row) {
            *o += xj * wij;
        }
    }
    out
}

/// Multi-head attention of one query over a sequence of K/V rows.
///
/// `keys` / `values` yield one `[n_heads * head_dim]` row per position, oldest
/// first. Rows are visited in that order, so the same sequence always produces
/// bit-identical output.
pub fn attention<'a>(
    q: &[f32],
    keys: &[&'a [f32]],
    values: &[&'a [f32]],
    n_heads: usize,
    head_dim: usize,
) -> ModelResult<Vec<f32>> {
    let width = n_heads * head_dim;
    if q.len() != width {
        return Err(ModelError::ShapeMismatch {
            what: "attention query",
            expected: width,
            got: q.len(),
        });
    }
    if keys.len() != values.len() || keys.is_empty() {
        return Err(ModelError::ShapeMismatch {
            what: "attention keys/values",
            expected: keys.len().max(1),
            got: values.len(),
        });
    }

    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut out = vec![0.0; width];
    let mut scores = vec![0.0f32; keys.len()];

    for h in 0..n_heads {
        let span = h * head_dim..(h + 1) * head_dim;
        let qh = &q[span.clone()];

        for (score, k) in scores.iter_mut().zip(keys) {
            let kh = &k[span.clone()];
            *score = qh.iter().zip(kh).map(|(a, b)| a * b).sum::<f32>() * scale;
        }

        let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut denom = 0.0f32;
        for s in scores.iter_mut() {
            *s = (*s - max).exp();
            denom += *s;
        }

        let oh = &mut out[span.clone()];
        for (&weight, v) in scores.iter().zip(values) {
            let p = weight / denom;
            for (o, &vv) in oh.iter_mut().zip(&v[span.clone()]) {
                *o += p * vv;
            }
        }
    }

    Ok(out)
}

/// SwiGLU MLP: `down(silu(x @ gate) * (x @ up))`.
pub fn mlp_swiglu(
    x: &[f32],
    w_gate: &[f32],
    w_up: &[f32],
    w_down: &[f32],
    d_model: usize,
    d_ff: usize,
) -> Vec<f32> {
    let gate = matvec(x, w_gate, d_model, d_ff);
    let up = matvec(x, w_up, d_model, d_ff);
    let act: Vec<f32> = gate
        .iter()
        .zip(&up)
        .map(|(&g, &u)| g / (1.0 + (-g).exp()) * u)
        .collect();
    matvec(&act, w_down, d_ff, d_model)
}
