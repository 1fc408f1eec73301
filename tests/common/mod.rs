#![allow(dead_code)]

use kvgen::{EngineConfig, GenerationConfig, TextGenerator};

/// Large enough that none of the scenarios here wrap the cache.
pub const ROOMY: usize = 256;

pub fn generator(capacity: usize, chunk: usize, internal: bool) -> TextGenerator {
    TextGenerator::new(
        EngineConfig::new()
            .with_sequence_length(capacity)
            .with_prompt_sequence_length(chunk)
            .with_internal_kv_cache(internal),
    )
    .unwrap()
}

pub fn greedy(max_length: usize) -> GenerationConfig {
    GenerationConfig::new().with_max_length(max_length)
}

pub fn scored(max_length: usize) -> GenerationConfig {
    greedy(max_length)
        .with_force_max_tokens(true)
        .with_output_scores(true)
}
