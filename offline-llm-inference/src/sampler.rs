#[cfg(test)]
#[path = "../tests/unit/sampler_test.rs"]
mod tests;

use crate::context::XorShiftRng;
use crate::tokenizer::TokenId;

/// Knobs of the sampling pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// `0.0` selects greedy decoding.
    pub temperature: f32,
    /// `0` disables top-k filtering.
    pub top_k: usize,
    /// `1.0` disables nucleus filtering.
    pub top_p: f32,
    /// `1.0` disables the repetition penalty.
    pub repetition_penalty: f32,
    /// Number of most recent tokens the penalty looks at.
    pub repeat_last_n: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self { temperature: 1.0, top_k: 0, top_p: 0.9, repetition_penalty: 1.0, repeat_last_n: 64 }
    }
}

impl SamplingParams {
    /// Greedy decoding without penalties.
    pub fn greedy() -> Self {
        Self { temperature: 0.0, top_p: 1.0, ..Self::default() }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if !(self.temperature.is_finite() && self.temperature >= 0.0) {
            return Err(format!("temperature must be a non-negative number, got {}", self.temperature));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(format!("top_p must be between 0.0 and 1.0, got {}", self.top_p));
        }
        if !(self.repetition_penalty.is_finite() && self.repetition_penalty > 0.0) {
            return Err(format!("repetition_penalty must be positive, got {}", self.repetition_penalty));
        }
        Ok(())
    }
}

/// Stores a probability (or a logit before softmax) and its token id.
#[derive(Clone, Copy, Debug)]
pub struct ProbIndex {
    pub prob: f32,
    pub index: TokenId,
}

/// Turns logits into the next token.
///
/// Pipeline: repetition penalty, temperature (greedy at zero), top-k, softmax,
/// top-p, then one multinomial draw. Holds only scratch buffers; all randomness
/// comes from the caller's RNG, so identical inputs give identical tokens.
#[derive(Debug, Default)]
pub struct Sampler {
    probindex: Vec<ProbIndex>,
    recent: Vec<TokenId>,
}

impl Sampler {
    pub fn new(vocab_size: usize) -> Self {
        Self { probindex: Vec::with_capacity(vocab_size), recent: Vec::new() }
    }

    pub fn choose(
        &mut self,
        logits: &[f32],
        params: &SamplingParams,
        history: &[TokenId],
        rng: &mut XorShiftRng,
    ) -> TokenId {
        self.probindex.clear();
        self.probindex.extend(logits.iter().enumerate().map(|(index, &prob)| ProbIndex { prob, index: index as TokenId }));

        self.apply_repetition_penalty(params, history);

        if params.temperature == 0.0 {
            return Self::sample_argmax(&self.probindex);
        }

        let inv_temperature = params.temperature.recip();
        self.probindex.iter_mut().for_each(|candidate| candidate.prob *= inv_temperature);

        let needs_order = params.top_k > 0 || params.top_p < 1.0;
        if needs_order {
            // Total order: higher logit first, lower token id on ties.
            self.probindex.sort_unstable_by(|a, b| b.prob.total_cmp(&a.prob).then(a.index.cmp(&b.index)));
        }

        if params.top_k > 0 {
            self.probindex.truncate(params.top_k);
        }

        Self::softmax(&mut self.probindex);

        let kept = if params.top_p < 1.0 { Self::nucleus_size(&self.probindex, params.top_p) } else { self.probindex.len() };

        let coin = rng.next_f32();
        Self::sample_mult(&self.probindex[..kept], coin)
    }

    /// Divides positive and multiplies negative logits of the distinct tokens among
    /// the last `repeat_last_n` history entries.
    fn apply_repetition_penalty(&mut self, params: &SamplingParams, history: &[TokenId]) {
        if params.repetition_penalty == 1.0 || params.repeat_last_n == 0 {
            return;
        }

        let window_start = history.len().saturating_sub(params.repeat_last_n);
        self.recent.clear();
        self.recent.extend_from_slice(&history[window_start..]);
        self.recent.sort_unstable();
        self.recent.dedup();

        for &token in &self.recent {
            if let Some(candidate) = self.probindex.get_mut(token as usize) {
                if candidate.prob > 0.0 {
                    candidate.prob /= params.repetition_penalty;
                } else {
                    candidate.prob *= params.repetition_penalty;
                }
            }
        }
    }

    /// Returns the token with the highest logit, the lowest id on ties.
    fn sample_argmax(candidates: &[ProbIndex]) -> TokenId {
        let mut best: Option<ProbIndex> = None;
        for &candidate in candidates {
            if best.is_none_or(|current| candidate.prob > current.prob) {
                best = Some(candidate);
            }
        }
        best.map(|candidate| candidate.index).unwrap_or_default()
    }

    fn softmax(candidates: &mut [ProbIndex]) {
        let max_val = candidates.iter().fold(f32::NEG_INFINITY, |acc, candidate| acc.max(candidate.prob));
        let sum = candidates
            .iter_mut()
            .map(|candidate| {
                candidate.prob = (candidate.prob - max_val).exp();
                candidate.prob
            })
            .sum::<f32>();
        let inv_sum = sum.recip();
        candidates.iter_mut().for_each(|candidate| candidate.prob *= inv_sum);
    }

    /// Length of the smallest prefix whose cumulative probability reaches `top_p`, at least one.
    fn nucleus_size(sorted: &[ProbIndex], top_p: f32) -> usize {
        let mut cumulative_prob = 0.0;
        for (i, candidate) in sorted.iter().enumerate() {
            cumulative_prob += candidate.prob;
            if cumulative_prob >= top_p {
                return i + 1;
            }
        }
        sorted.len()
    }

    /// Multinomial sampling from the kept candidates, renormalized by their total mass.
    fn sample_mult(candidates: &[ProbIndex], coin: f32) -> TokenId {
        let total = candidates.iter().map(|candidate| candidate.prob).sum::<f32>();
        let r = coin * total;
        let mut cdf = 0.0;
        for candidate in candidates {
            cdf += candidate.prob;
            if r < cdf {
                return candidate.index;
            }
        }
        candidates.last().map(|candidate| candidate.index).unwrap_or_default()
    }
}
