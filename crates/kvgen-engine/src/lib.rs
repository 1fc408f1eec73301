//! # kvgen-engine
//!
//! Stateful text generation over per-session KV caches.
//!
//! The pieces, bottom up:
//! - [`CacheEngine`]: the prefill/decode contract, with an external
//!   (materialized) and an opaque (engine-owned) cache variant
//! - [`PrefillEngine`]: single-token or chunked prompt processing under a
//!   [`kvgen_kv::CapacityManager`]
//! - [`Decoder`]: the greedy/stochastic decode loop
//! - [`SessionRouter`]: isolated sessions keyed by caller-assigned ids
//! - [`TextGenerator`]: the `generate` entry point, batching prompts in
//!   parallel and streaming single prompts through [`GenerationStream`]
//!
//! ## Sessions
//!
//! A session's cache after several turns is the cache of one prompt holding
//! the whole transcript. The last token of each turn is handed back to the
//! caller but run through the model only at the start of the next turn.

pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod generator;
pub mod prefill;
pub mod router;
pub mod session;
pub mod stream;
#[cfg(feature = "verify")]
pub mod verify;

pub use config::{EngineConfig, GenerationConfig};
pub use decode::{Decoder, FinishReason, GeneratedToken};
pub use engine::{CacheEngine, CacheMode, CacheState, ExternalCacheEngine, OpaqueCacheEngine};
pub use error::{EngineError, Result};
pub use generator::{
    Generation, GenerationOutput, GenerationRequest, GenerationResponse, GenerationStats,
    TextGenerator,
};
pub use kvgen_kv::KvTensor;
pub use kvgen_tokenizer::TokenId;
pub use prefill::{PrefillEngine, PrefillOutput};
pub use router::{SessionHandle, SessionRouter};
pub use session::Session;
pub use stream::{GenerationStream, StreamEvent, StreamToken};
