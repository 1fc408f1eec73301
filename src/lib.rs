//! Stateful autoregressive text generation with per-session KV caches.
//!
//! This crate re-exports the kvgen workspace:
//! - [`tokenizer`]: the tokenizer contract and the character tokenizer
//! - [`kv`]: cache storage and the eviction policy
//! - [`sampling`]: greedy and stochastic next-token selection
//! - [`models`]: the forward-pass contract and the tiny reference model
//! - [`engine`]: prefill, decode, session routing and streaming
//!
//! ```no_run
//! use kvgen::{EngineConfig, GenerationRequest, TextGenerator};
//!
//! let generator = TextGenerator::new(EngineConfig::new())?;
//! let output = generator.generate(GenerationRequest::new("Hello").with_session("chat"))?;
//! println!("{}", output.generations[0][0].text);
//! # Ok::<(), kvgen::EngineError>(())
//! ```

pub use kvgen_engine as engine;
pub use kvgen_kv as kv;
pub use kvgen_models as models;
pub use kvgen_sampling as sampling;
pub use kvgen_tokenizer as tokenizer;

pub use kvgen_engine::{
    CacheMode, EngineConfig, EngineError, FinishReason, Generation, GenerationConfig,
    GenerationOutput, GenerationRequest, GenerationStream, Result, StreamEvent, StreamToken,
    TextGenerator,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
