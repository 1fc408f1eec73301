//! Tiny deterministic transformer.
//!
//! Pre-norm blocks: norm → attention → residual → norm → SwiGLU → residual,
//! followed by a final norm and the vocabulary projection. Weights come from a
//! fixed-seed xorshift stream, so every process builds the same model.

use kvgen_kv::SessionKVCache;
use serde::{Deserialize, Serialize};

use crate::{
    attention, matvec, mlp_swiglu, ForwardModel, ForwardOutput, ModelDims, ModelError,
    ModelResult, RMSNorm, RoPE,
};

/// Configuration for the tiny model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TinyModelConfig {
    pub d_model: usize,
    pub d_ff: usize,
    pub n_heads: usize,
    pub head_dim: usize,
    pub n_layers: usize,
    pub vocab_size: usize,
    pub rope_base: f32,
    pub norm_eps: f32,
    /// Weight initialization seed.
    pub seed: u64,
}

impl Default for TinyModelConfig {
    fn default() -> Self {
        Self {
            d_model: 32,
            d_ff: 64,
            n_heads: 4,
            head_dim: 8,
            n_layers: 2,
            vocab_size: 99,
            rope_base: 10_000.0,
            norm_eps: 1e-5,
            seed: 12345,
        }
    }
}

impl TinyModelConfig {
    pub fn validate(&self) -> ModelResult<()> {
        if self.n_layers == 0 || self.n_heads == 0 || self.vocab_size == 0 || self.d_ff == 0 {
            return Err(ModelError::InvalidConfig(
                "n_layers, n_heads, d_ff and vocab_size must be non-zero".into(),
            ));
        }
        if self.d_model != self.n_heads * self.head_dim {
            return Err(ModelError::InvalidConfig(format!(
                "d_model ({}) must equal n_heads * head_dim ({} * {})",
                self.d_model, self.n_heads, self.head_dim
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "head_dim must be even, got {}",
                self.head_dim
            )));
        }
        Ok(())
    }

    pub fn dims(&self) -> ModelDims {
        ModelDims {
            n_layers: self.n_layers,
            n_heads: self.n_heads,
            head_dim: self.head_dim,
            vocab_size: self.vocab_size,
        }
    }
}

/// Seeded RNG for weight initialization (xorshift64).
struct WeightRng {
    state: u64,
}

impl WeightRng {
    fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Uniform in `[-0.1, 0.1)`.
    fn next_f32(&mut self) -> f32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        ((self.state >> 40) as f32 / (1u64 << 24) as f32 - 0.5) * 0.2
    }

    fn fill(&mut self, n: usize) -> Vec<f32> {
        (0..n).map(|_| self.next_f32()).collect()
    }
}

struct Block {
    norm1: RMSNorm,
    w_q: Vec<f32>,
    w_k: Vec<f32>,
    w_v: Vec<f32>,
    w_o: Vec<f32>,
    norm2: RMSNorm,
    w_gate: Vec<f32>,
    w_up: Vec<f32>,
    w_down: Vec<f32>,
}

/// Small multi-layer transformer with fixed-seed weights.
pub struct TinyModel {
    config: TinyModelConfig,
    // [vocab_size, d_model]
    embeddings: Vec<f32>,
    blocks: Vec<Block>,
    rope: RoPE,
    final_norm: RMSNorm,
    // [d_model, vocab_size]
    lm_head: Vec<f32>,
}

impl TinyModel {
    pub fn new(config: TinyModelConfig) -> ModelResult<Self> {
        config.validate()?;
        let mut rng = WeightRng::new(config.seed);
        let (d, ff, v) = (config.d_model, config.d_ff, config.vocab_size);

        let embeddings = rng.fill(v * d);
        let blocks = (0..config.n_layers)
            .map(|_| Block {
                norm1: RMSNorm::new(d, config.norm_eps),
                w_q: rng.fill(d * d),
                w_k: rng.fill(d * d),
                w_v: rng.fill(d * d),
                w_o: rng.fill(d * d),
                norm2: RMSNorm::new(d, config.norm_eps),
                w_gate: rng.fill(d * ff),
                w_up: rng.fill(d * ff),
                w_down: rng.fill(ff * d),
            })
            .collect();
        let lm_head = rng.fill(d * v);

        Ok(Self {
            rope: RoPE::new(config.head_dim, config.rope_base)?,
            final_norm: RMSNorm::new(d, config.norm_eps),
            embeddings,
            blocks,
            lm_head,
            config,
        })
    }

    pub fn config(&self) -> &TinyModelConfig {
        &self.config
    }

    fn embed(&self, token_id: usize) -> ModelResult<Vec<f32>> {
        if token_id >= self.config.vocab_size {
            return Err(ModelError::TokenOutOfRange {
                token: token_id,
                vocab_size: self.config.vocab_size,
            });
        }
        let d = self.config.d_model;
        Ok(self.embeddings[token_id * d..(token_id + 1) * d].to_vec())
    }

    fn check_cache(&self, cache: &SessionKVCache) -> ModelResult<()> {
        let c = &self.config;
        for (what, expected, got) in [
            ("cache layers", c.n_layers, cache.n_layers()),
            ("cache heads", c.n_heads, cache.n_heads()),
            ("cache head_dim", c.head_dim, cache.head_dim()),
        ] {
            if expected != got {
                return Err(ModelError::ShapeMismatch { what, expected, got });
            }
        }
        Ok(())
    }
}

impl ForwardModel for TinyModel {
    fn dims(&self) -> ModelDims {
        self.config.dims()
    }

    fn forward(
        &self,
        cache: &SessionKVCache,
        tokens: &[usize],
        start_position: usize,
    ) -> ModelResult<ForwardOutput> {
        self.check_cache(cache)?;
        let c = &self.config;
        let d = c.d_model;

        let mut hidden = tokens
            .iter()
            .map(|&t| self.embed(t))
            .collect::<ModelResult<Vec<_>>>()?;

        let mut keys = Vec::with_capacity(c.n_layers);
        let mut values = Vec::with_capacity(c.n_layers);

        for (l, block) in self.blocks.iter().enumerate() {
            let mut queries = Vec::with_capacity(tokens.len());
            let mut new_k = Vec::with_capacity(tokens.len() * d);
            let mut new_v = Vec::with_capacity(tokens.len() * d);

            for (i, x) in hidden.iter().enumerate() {
                let x_norm = block.norm1.forward(x)?;
                let mut q = matvec(&x_norm, &block.w_q, d, d);
                let mut k = matvec(&x_norm, &block.w_k, d, d);
                let v = matvec(&x_norm, &block.w_v, d, d);

                let position = start_position + i;
                self.rope.rotate(&mut q, position);
                self.rope.rotate(&mut k, position);

                queries.push(q);
                new_k.extend_from_slice(&k);
                new_v.extend_from_slice(&v);
            }

            let layer = cache.layer(l).ok_or(ModelError::ShapeMismatch {
                what: "cache layers",
                expected: c.n_layers,
                got: cache.n_layers(),
            })?;
            let mut ctx_k: Vec<&[f32]> = layer.keys().chunks_exact(d).collect();
            let mut ctx_v: Vec<&[f32]> = layer.values().chunks_exact(d).collect();

            for (i, (q, x)) in queries.iter().zip(hidden.iter_mut()).enumerate() {
                ctx_k.push(&new_k[i * d..(i + 1) * d]);
                ctx_v.push(&new_v[i * d..(i + 1) * d]);

                let attn = attention(q, &ctx_k, &ctx_v, c.n_heads, c.head_dim)?;
                let attn_proj = matvec(&attn, &block.w_o, d, d);
                for (h, a) in x.iter_mut().zip(&attn_proj) {
                    *h += a;
                }

                let x_norm2 = block.norm2.forward(x)?;
                let mlp = mlp_swiglu(&x_norm2, &block.w_gate, &block.w_up, &block.w_down, d, c.d_ff);
                for (h, m) in x.iter_mut().zip(&mlp) {
                    *h += m;
                }
            }

            keys.push(new_k);
            values.push(new_v);
        }

        let logits = hidden
            .iter()
            .map(|x| {
                let h = self.final_norm.forward(x)?;
                Ok(matvec(&h, &self.lm_head, d, c.vocab_size))
            })
            .collect::<ModelResult<Vec<_>>>()?;

        Ok(ForwardOutput {
            logits,
            keys,
            values,
        })
    }
}
