//! Engine and per-request generation configuration.
//!
//! Both structs deserialize from JSON with per-field defaults, so a config
//! file only needs the keys it changes.

use std::path::Path;

use kvgen_kv::CapacityManager;
use kvgen_models::TinyModelConfig;
use kvgen_sampling::Sampler;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

fn default_sequence_length() -> usize {
    128
}

fn default_prompt_sequence_length() -> usize {
    16
}

fn default_true() -> bool {
    true
}

/// Configuration consumed when building a [`crate::TextGenerator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cache capacity in positions.
    #[serde(default = "default_sequence_length")]
    pub sequence_length: usize,

    /// Prefill chunk size. `1` selects single-token prefill.
    #[serde(default = "default_prompt_sequence_length")]
    pub prompt_sequence_length: usize,

    /// Keep caches inside the engine instead of materializing them per session.
    #[serde(default)]
    pub internal_kv_cache: bool,

    /// Whether the tokenizer prepends `<s>` to fresh prompts.
    #[serde(default = "default_true")]
    pub prepend_bos: bool,

    #[serde(default)]
    pub model: TinyModelConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sequence_length: default_sequence_length(),
            prompt_sequence_length: default_prompt_sequence_length(),
            internal_kv_cache: false,
            prepend_bos: true,
            model: TinyModelConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            EngineError::Configuration(format!("invalid config {}: {e}", path.display()))
        })
    }

    pub fn with_sequence_length(mut self, n: usize) -> Self {
        self.sequence_length = n;
        self
    }

    pub fn with_prompt_sequence_length(mut self, n: usize) -> Self {
        self.prompt_sequence_length = n;
        self
    }

    pub fn with_internal_kv_cache(mut self, internal: bool) -> Self {
        self.internal_kv_cache = internal;
        self
    }

    pub fn with_prepend_bos(mut self, prepend: bool) -> Self {
        self.prepend_bos = prepend;
        self
    }

    pub fn with_model(mut self, model: TinyModelConfig) -> Self {
        self.model = model;
        self
    }

    /// Checks that do not depend on the tokenizer.
    pub fn validate(&self) -> Result<()> {
        if self.prompt_sequence_length == 0 {
            return Err(EngineError::Configuration(
                "prompt_sequence_length must be at least 1".into(),
            ));
        }
        if self.sequence_length == 0 {
            return Err(EngineError::Capacity(
                "sequence_length must be at least 1".into(),
            ));
        }
        self.model
            .validate()
            .map_err(|e| EngineError::Configuration(e.to_string()))
    }

    /// Build the capacity policy and check that one prefill chunk fits.
    pub fn capacity_manager(&self, freeze_first: bool) -> Result<CapacityManager> {
        self.validate()?;
        let manager = CapacityManager::new(self.sequence_length, freeze_first)?;
        manager.check_chunk(self.prompt_sequence_length)?;
        Ok(manager)
    }
}

fn default_max_length() -> usize {
    16
}

fn default_one() -> usize {
    1
}

fn default_unit() -> f32 {
    1.0
}

/// Per-request sampling and stopping configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of new tokens.
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// `0` disables top-k.
    #[serde(default)]
    pub top_k: usize,

    /// Active only in `(0, 1)`.
    #[serde(default = "default_unit")]
    pub top_p: f32,

    #[serde(default = "default_unit")]
    pub temperature: f32,

    #[serde(default = "default_one")]
    pub num_return_sequences: usize,

    /// `false` selects greedy decoding.
    #[serde(default)]
    pub do_sample: bool,

    #[serde(default)]
    pub output_scores: bool,

    /// Seed for stochastic decoding; unseeded requests draw a fresh one.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Keep generating through end-of-sequence until `max_length`.
    #[serde(default)]
    pub force_max_tokens: bool,

    #[serde(default)]
    pub repetition_penalty: Option<f32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
            top_k: 0,
            top_p: 1.0,
            temperature: 1.0,
            num_return_sequences: 1,
            do_sample: false,
            output_scores: false,
            seed: None,
            force_max_tokens: false,
            repetition_penalty: None,
        }
    }
}

impl GenerationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_length(mut self, n: usize) -> Self {
        self.max_length = n;
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_num_return_sequences(mut self, n: usize) -> Self {
        self.num_return_sequences = n;
        self
    }

    pub fn with_do_sample(mut self, sample: bool) -> Self {
        self.do_sample = sample;
        self
    }

    pub fn with_output_scores(mut self, scores: bool) -> Self {
        self.output_scores = scores;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_force_max_tokens(mut self, force: bool) -> Self {
        self.force_max_tokens = force;
        self
    }

    pub fn with_repetition_penalty(mut self, penalty: f32) -> Self {
        self.repetition_penalty = Some(penalty);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(EngineError::Configuration(msg.to_string()));

        if self.max_length == 0 {
            return fail("max_length must be at least 1");
        }
        if self.num_return_sequences == 0 {
            return fail("num_return_sequences must be at least 1");
        }
        if !(self.top_p.is_finite() && (0.0..=1.0).contains(&self.top_p)) {
            return fail("top_p must be within [0, 1]");
        }
        if self.do_sample && !(self.temperature.is_finite() && self.temperature > 0.0) {
            return fail("temperature must be > 0 when sampling");
        }
        if let Some(penalty) = self.repetition_penalty {
            if !(penalty.is_finite() && penalty > 0.0) {
                return fail("repetition_penalty must be > 0");
            }
        }
        Ok(())
    }

    /// Sampler for the `sequence_index`-th return sequence of a prompt.
    pub fn sampler(&self, sequence_index: usize) -> Sampler {
        if !self.do_sample {
            return Sampler::greedy();
        }

        let mut sampler = Sampler::new()
            .with_temperature(self.temperature)
            .with_top_k(self.top_k)
            .with_top_p(self.top_p);
        if let Some(penalty) = self.repetition_penalty {
            sampler = sampler.with_repetition_penalty(penalty);
        }
        match self.seed {
            Some(seed) => sampler.with_seed(seed.wrapping_add(sequence_index as u64)),
            None => sampler.with_random_seed(),
        }
    }
}
