//! # kvgen-tokenizer
//!
//! Deterministic tokenization for kvgen.
//!
//! This crate provides:
//! - A `Tokenizer` trait for pluggable tokenization backends
//! - A closed-vocabulary character tokenizer used by the reference model
//! - Streaming decoding state for token-by-token output
//! - `prepends_bos_token`, the probe that decides whether a model's first
//!   cache slot is pinned during eviction

use std::collections::HashMap;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(TokenId),
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Decoding error: {0}")]
    DecodingError(String),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

/// Core tokenizer trait. Implementations can be swapped without changing app code.
pub trait Tokenizer: Send + Sync {
    /// Encode text into a sequence of token IDs (no special tokens).
    fn encode(&self, text: &str) -> TokenizerResult<Vec<TokenId>>;

    /// Decode a complete sequence of tokens into text, skipping special tokens.
    fn decode(&self, tokens: &[TokenId]) -> TokenizerResult<String>;

    /// Decode a single token and accumulate it into the streaming state.
    fn decode_token(&self, token: TokenId, state: &mut DecodingState) -> TokenizerResult<String>;

    /// Get vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Beginning-of-sequence marker, if the vocabulary has one.
    fn bos_token(&self) -> Option<TokenId>;

    /// End-of-sequence marker, if the vocabulary has one.
    fn eos_token(&self) -> Option<TokenId>;

    /// Whether `encode_prompt(.., true)` inserts the BOS marker.
    fn adds_bos(&self) -> bool;

    /// Encode a prompt, optionally with the leading special tokens the model expects.
    fn encode_prompt(&self, text: &str, add_special_tokens: bool) -> TokenizerResult<Vec<TokenId>> {
        let mut ids = Vec::new();
        if add_special_tokens && self.adds_bos() {
            if let Some(bos) = self.bos_token() {
                ids.push(bos);
            }
        }
        ids.extend(self.encode(text)?);
        Ok(ids)
    }

    /// Whether `token` is a control token that never appears in decoded text.
    fn is_special(&self, token: TokenId) -> bool {
        Some(token) == self.bos_token() || Some(token) == self.eos_token()
    }
}

/// Returns true when the tokenizer implicitly prepends a BOS marker.
///
/// Probes with an empty prompt so the answer does not depend on any text.
pub fn prepends_bos_token(tokenizer: &dyn Tokenizer) -> bool {
    let Some(bos) = tokenizer.bos_token() else {
        return false;
    };
    match tokenizer.encode_prompt("", true) {
        Ok(ids) => ids.first() == Some(&bos),
        Err(_) => false,
    }
}

/// Streaming decoding state.
#[derive(Debug, Clone, Default)]
pub struct DecodingState {
    buffer: String,
    tokens_seen: usize,
}

impl DecodingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Number of tokens pushed through `decode_token`, special tokens included.
    pub fn tokens_seen(&self) -> usize {
        self.tokens_seen
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.tokens_seen = 0;
    }
}

/// BOS marker id in [`CharTokenizer`].
pub const BOS_ID: TokenId = 0;
/// EOS marker id in [`CharTokenizer`].
pub const EOS_ID: TokenId = 1;

const BOS_TEXT: &str = "<s>";
const EOS_TEXT: &str = "</s>";

/// Closed-vocabulary character tokenizer.
///
/// - One token per character: tab, newline and printable ASCII
/// - Two control tokens: `<s>` (id 0) and `</s>` (id 1)
/// - Concatenative: `encode(a + b) == encode(a) ++ encode(b)`, so decoding any
///   non-special id sequence and encoding it again yields the same ids
#[derive(Debug, Clone)]
pub struct CharTokenizer {
    vocab: Vec<char>,
    reverse_vocab: HashMap<char, TokenId>,
    add_bos: bool,
}

impl CharTokenizer {
    /// Create the tokenizer. `add_bos` controls whether prompts get a leading `<s>`.
    pub fn new(add_bos: bool) -> Self {
        let vocab: Vec<char> = ['\t', '\n']
            .into_iter()
            .chain((0x20u8..=0x7e).map(char::from))
            .collect();
        let reverse_vocab = vocab
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as TokenId + 2))
            .collect();

        Self {
            vocab,
            reverse_vocab,
            add_bos,
        }
    }

    fn char_for(&self, token: TokenId) -> TokenizerResult<Option<char>> {
        match token {
            BOS_ID | EOS_ID => Ok(None),
            t if t >= 2 => self
                .vocab
                .get((t - 2) as usize)
                .copied()
                .map(Some)
                .ok_or(TokenizerError::InvalidToken(token)),
            _ => Err(TokenizerError::InvalidToken(token)),
        }
    }

    /// Text form of a token, control tokens included (for diagnostics).
    pub fn token_text(&self, token: TokenId) -> TokenizerResult<String> {
        match token {
            BOS_ID => Ok(BOS_TEXT.to_string()),
            EOS_ID => Ok(EOS_TEXT.to_string()),
            _ => Ok(self.char_for(token)?.map(String::from).unwrap_or_default()),
        }
    }
}

impl Default for CharTokenizer {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> TokenizerResult<Vec<TokenId>> {
        text.chars()
            .map(|c| {
                self.reverse_vocab.get(&c).copied().ok_or_else(|| {
                    TokenizerError::EncodingError(format!("character {c:?} is not in the vocabulary"))
                })
            })
            .collect()
    }

    fn decode(&self, tokens: &[TokenId]) -> TokenizerResult<String> {
        let mut text = String::with_capacity(tokens.len());
        for &id in tokens {
            if let Some(c) = self.char_for(id)? {
                text.push(c);
            }
        }
        Ok(text)
    }

    fn decode_token(&self, token: TokenId, state: &mut DecodingState) -> TokenizerResult<String> {
        let emitted = self.char_for(token)?.map(String::from).unwrap_or_default();
        state.buffer.push_str(&emitted);
        state.tokens_seen += 1;
        Ok(emitted)
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len() + 2
    }

    fn bos_token(&self) -> Option<TokenId> {
        Some(BOS_ID)
    }

    fn eos_token(&self) -> Option<TokenId> {
        Some(EOS_ID)
    }

    fn adds_bos(&self) -> bool {
        self.add_bos
    }
}
