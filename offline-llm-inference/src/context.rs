//! Per-session mutable state.

#[cfg(test)]
#[path = "../tests/unit/context_test.rs"]
mod tests;

use std::time::{SystemTime, UNIX_EPOCH};

use crate::configuration::ModelConfig;
use crate::error::InferenceError;
use crate::layers::{KvCache, RunState};
use crate::tokenizer::TokenId;

/// Xorshift random number generator with explicit state.
///
/// Identical seeds produce identical sequences on every platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    /// Replaces the all-zero state, which xorshift cannot leave.
    const ZERO_SEED_STATE: u64 = 0x9E37_79B9_7F4A_7C15;

    pub fn new(seed: u64) -> Self {
        Self { state: if seed == 0 { Self::ZERO_SEED_STATE } else { seed } }
    }

    /// Seeds from the wall clock.
    pub fn from_clock() -> Self {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|elapsed| elapsed.as_nanos() as u64).unwrap_or_default();
        Self::new(nanos)
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        ((self.state.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    /// Returns a random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / 16777216.0
    }
}

/// KV cache, scratch activations and bookkeeping of one conversation.
///
/// `tokens` lists exactly the tokens whose keys and values are cached, so
/// `tokens.len() == position` holds between forward passes. A token that was
/// sampled but not yet evaluated is kept as `pending` and is evaluated first
/// by the next turn.
#[derive(Debug)]
pub struct ExecutionContext {
    pub(crate) state: RunState,
    pub(crate) cache: KvCache,
    pub(crate) position: usize,
    pub(crate) tokens: Vec<TokenId>,
    pub(crate) pending: Option<TokenId>,
    pub(crate) rng: XorShiftRng,
}

impl ExecutionContext {
    /// Reserves every buffer up front; fails with [`InferenceError::Allocation`] instead of aborting.
    pub fn new(config: &ModelConfig, window: usize, rng: XorShiftRng) -> Result<Self, InferenceError> {
        let bytes = KvCache::size_in_bytes(config, window) + RunState::size_in_bytes(config, window);
        let allocation_error = |_| InferenceError::Allocation { bytes };

        let cache = KvCache::new(config, window).map_err(allocation_error)?;
        let state = RunState::new(config, window).map_err(allocation_error)?;
        let mut tokens = Vec::new();
        tokens.try_reserve_exact(window).map_err(allocation_error)?;

        log::debug!("allocated execution context: window {window}, {bytes} bytes");

        Ok(Self { state, cache, position: 0, tokens, pending: None, rng })
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn context_window(&self) -> usize {
        self.cache.window
    }

    /// Tokens currently held by the cache, oldest first.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn pending(&self) -> Option<TokenId> {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.position == 0 && self.pending.is_none()
    }

    /// Drops the cached conversation, keeping the allocation and the RNG.
    pub fn reset(&mut self) {
        self.cache.clear();
        self.position = 0;
        self.tokens.clear();
        self.pending = None;
    }
}
