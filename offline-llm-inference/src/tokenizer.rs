//! Byte-level BPE tokenizer over the vocabulary table embedded in the model file.
//!
//! - Encodes text with special `<...>` token lookup, per character lookup and a
//!   single-byte fallback, then applies score-ordered BPE merges.
//! - Decodes token ids back to text, rejecting byte sequences that are not UTF-8.
//! - [`StreamDecoder`] turns a stream of token bytes into complete characters,
//!   holding back a multi-byte character until all of its bytes arrived.

#[cfg(test)]
#[path = "../tests/unit/tokenizer_test.rs"]
mod tests;

use std::collections::HashMap;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::configuration::ModelConfig;
use crate::error::{ModelLoadError, TokenizationError};
use crate::utils::MemoryMapper;

/// Index into the vocabulary.
pub type TokenId = u32;

/// Tokenizer for byte-level BPE models.
///
/// Stateless once built: encode and decode only read the vocabulary.
pub struct Tokenizer {
    /// Each token is a byte sequence, not necessarily valid UTF-8.
    vocab: Vec<Vec<u8>>,
    /// Merge scores for BPE merges (higher is better).
    merge_scores: Vec<f32>,
    lookup: HashMap<Vec<u8>, TokenId>,
    max_token_length: usize,
    bos_token_id: Option<TokenId>,
    eos_token_id: Option<TokenId>,
}

impl Tokenizer {
    pub(crate) fn new(
        vocab: Vec<Vec<u8>>,
        merge_scores: Vec<f32>,
        bos_token_id: Option<TokenId>,
        eos_token_id: Option<TokenId>,
    ) -> Self {
        debug_assert_eq!(vocab.len(), merge_scores.len());

        let mut lookup = HashMap::with_capacity(vocab.len());
        for (id, token) in vocab.iter().enumerate() {
            if !token.is_empty() {
                // First entry wins for duplicated byte sequences.
                lookup.entry(token.clone()).or_insert(id as TokenId);
            }
        }
        let max_token_length = vocab.iter().map(Vec::len).max().unwrap_or_default();

        Self { vocab, merge_scores, lookup, max_token_length, bos_token_id, eos_token_id }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn bos_token_id(&self) -> Option<TokenId> {
        self.bos_token_id
    }

    pub fn eos_token_id(&self) -> Option<TokenId> {
        self.eos_token_id
    }

    /// Returns true when `token` ends a generation.
    pub fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.eos_token_id == Some(token)
    }

    /// Looks up a string in the vocabulary and returns its token id, if present.
    pub fn token_id(&self, text: &str) -> Option<TokenId> {
        self.lookup.get(text.as_bytes()).copied()
    }

    /// Raw bytes of a token.
    pub fn token_bytes(&self, token: TokenId) -> Result<&[u8], TokenizationError> {
        self.vocab.get(token as usize).map(Vec::as_slice).ok_or(TokenizationError::InvalidToken(token))
    }

    /// Encodes a string into a sequence of token ids using BPE.
    ///
    /// 1. Looks up special tokens (`<...>`, at most `max_token_length` bytes) and single characters.
    ///    A character missing from the vocabulary is encoded as its UTF-8 bytes when every byte
    ///    has a single-byte token.
    /// 2. Repeatedly merges the adjacent pair whose concatenation has the highest merge score,
    ///    preferring the leftmost pair on ties, until no more merges are possible.
    pub fn encode(&self, text: &str) -> Result<Vec<TokenId>, TokenizationError> {
        let mut tokens = Vec::with_capacity(text.len());
        let mut chars = text.char_indices().peekable();

        while let Some((offset, ch)) = chars.next() {
            if ch == '<' {
                if let Some(special) = self.special_token_at(&text[offset..]) {
                    let end = offset + special.len;
                    tokens.push(special.id);
                    while chars.next_if(|&(next_offset, _)| next_offset < end).is_some() {}
                    continue;
                }
            }

            let mut buf = [0u8; 4];
            let encoded = ch.encode_utf8(&mut buf).as_bytes();

            if let Some(&id) = self.lookup.get(encoded) {
                tokens.push(id);
                continue;
            }

            let fallback: Option<Vec<TokenId>> = encoded.iter().map(|byte| self.lookup.get(&[*byte][..]).copied()).collect();
            match fallback {
                Some(byte_tokens) => tokens.extend(byte_tokens),
                None => return Err(TokenizationError::UnknownCharacter { ch, offset }),
            }
        }

        self.merge(&mut tokens);

        Ok(tokens)
    }

    fn special_token_at(&self, text: &str) -> Option<SpecialMatch> {
        let window = &text.as_bytes()[..text.len().min(self.max_token_length)];
        let close = window.iter().skip(1).position(|&byte| byte == b'>')? + 1;
        let candidate = &window[..=close];
        self.lookup.get(candidate).map(|&id| SpecialMatch { id, len: candidate.len() })
    }

    fn merge(&self, tokens: &mut Vec<TokenId>) {
        let mut merged_bytes = Vec::with_capacity(self.max_token_length);

        loop {
            let mut best: Option<(f32, TokenId, usize)> = None;

            for idx in 0..tokens.len().saturating_sub(1) {
                merged_bytes.clear();
                merged_bytes.extend_from_slice(&self.vocab[tokens[idx] as usize]);
                merged_bytes.extend_from_slice(&self.vocab[tokens[idx + 1] as usize]);

                if let Some(&id) = self.lookup.get(&merged_bytes) {
                    let score = self.merge_scores[id as usize];
                    if best.is_none_or(|(best_score, _, _)| score > best_score) {
                        best = Some((score, id, idx));
                    }
                }
            }

            let Some((_, id, idx)) = best else { break };

            tokens[idx] = id;
            tokens.remove(idx + 1);
        }
    }

    /// Decodes token ids into text.
    pub fn decode(&self, tokens: &[TokenId]) -> Result<String, TokenizationError> {
        let mut bytes = Vec::new();
        for &token in tokens {
            bytes.extend_from_slice(self.token_bytes(token)?);
        }

        String::from_utf8(bytes).map_err(|err| {
            let utf8_error = err.utf8_error();
            let start = utf8_error.valid_up_to();
            let end = utf8_error.error_len().map_or(err.as_bytes().len(), |len| start + len);
            TokenizationError::InvalidUtf8 { bytes: err.as_bytes()[start..end].to_vec() }
        })
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab.len())
            .field("max_token_length", &self.max_token_length)
            .field("bos_token_id", &self.bos_token_id)
            .field("eos_token_id", &self.eos_token_id)
            .finish_non_exhaustive()
    }
}

struct SpecialMatch {
    id: TokenId,
    len: usize,
}

/// Reads the vocabulary table that follows the header.
///
/// Each entry is `score: f32, len: u32, bytes[len]`; the table must contain exactly
/// `vocab_size` entries and fill `vocab_table_bytes`.
pub(crate) fn read_vocabulary(mapper: &mut MemoryMapper, config: &ModelConfig) -> Result<Tokenizer, ModelLoadError> {
    let path = mapper.path().to_path_buf();
    let invalid = |reason: String| ModelLoadError::InvalidVocabulary { path: path.clone(), reason };

    let table = mapper.get_bytes(config.vocab_table_bytes)?;
    let mut cursor = Cursor::new(table);

    let mut vocab = Vec::with_capacity(config.vocab_size);
    let mut merge_scores = Vec::with_capacity(config.vocab_size);

    for id in 0..config.vocab_size {
        let score = cursor
            .read_f32::<LittleEndian>()
            .map_err(|_| invalid(format!("table ends before the score of token {id}")))?;
        let len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| invalid(format!("table ends before the length of token {id}")))? as usize;

        if len > config.max_token_length {
            return Err(invalid(format!(
                "token {id} is {len} bytes long, the header allows at most {}",
                config.max_token_length
            )));
        }

        let mut token_bytes = vec![0u8; len];
        cursor
            .read_exact(&mut token_bytes)
            .map_err(|_| invalid(format!("token {id} overruns the table by its {len} bytes")))?;

        vocab.push(token_bytes);
        merge_scores.push(score);
    }

    let consumed = cursor.position() as usize;
    if consumed != config.vocab_table_bytes {
        return Err(invalid(format!(
            "{} bytes remain after {} tokens",
            config.vocab_table_bytes - consumed,
            config.vocab_size
        )));
    }

    let tokenizer = Tokenizer::new(vocab, merge_scores, config.bos_token_id, config.eos_token_id);
    log::debug!("{tokenizer:?}");

    Ok(tokenizer)
}

/// Incremental UTF-8 decoder for generated token bytes.
///
/// Complete characters are released as soon as their last byte arrives;
/// an incomplete trailing sequence is kept until the next push.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends token bytes and returns the text that became complete, if any.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Option<String>, TokenizationError> {
        self.pending.extend_from_slice(bytes);

        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(err) => match err.error_len() {
                // Incomplete sequence at the end, wait for more bytes.
                None => err.valid_up_to(),
                Some(len) => {
                    let start = err.valid_up_to();
                    let bytes = self.pending[start..start + len].to_vec();
                    self.pending.clear();
                    return Err(TokenizationError::InvalidUtf8 { bytes });
                }
            },
        };

        if valid_up_to == 0 {
            return Ok(None);
        }

        let text = String::from_utf8_lossy(&self.pending[..valid_up_to]).into_owned();
        self.pending.drain(..valid_up_to);

        Ok(Some(text))
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Ends the stream and returns the bytes of an unfinished character.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}
