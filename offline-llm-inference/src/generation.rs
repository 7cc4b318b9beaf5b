//! Generation loop: primes an execution context with a prompt, then samples,
//! decodes and emits text until a stop condition.
//!
//! The loop is synchronous; [`crate::session`] runs it on a worker thread and
//! forwards increments through a channel.

#[cfg(test)]
#[path = "../tests/unit/generation_test.rs"]
mod tests;

use std::time::{Duration, Instant};

use crate::context::{ExecutionContext, XorShiftRng};
use crate::error::{InferenceError, Result};
use crate::models::Model;
use crate::sampler::{Sampler, SamplingParams};
use crate::session::CancellationToken;
use crate::tokenizer::{StreamDecoder, TokenId};

/// What to do when the prompt or the generated text no longer fits into the context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TruncationPolicy {
    /// Fail with [`InferenceError::ContextOverflow`].
    #[default]
    Disabled,
    /// Drop the oldest tokens of the conversation before priming, and end a
    /// generation that fills the window with [`CompletionReason::ContextFull`].
    KeepRecent,
}

/// Parameters of one generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub sampling: SamplingParams,
    pub max_new_tokens: usize,
    /// Generation stops before the first occurrence of any of these strings.
    pub stop_sequences: Vec<String>,
    /// Reseeds the session's RNG; `None` continues its current state.
    pub seed: Option<u64>,
    /// Prepend the model's BOS token when the context is empty.
    pub add_bos: bool,
    /// Number of generated tokens coalesced into one increment.
    pub stream_batch: usize,
    pub truncation: TruncationPolicy,
    /// Cancels the generation once elapsed.
    pub timeout: Option<Duration>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            sampling: SamplingParams::default(),
            max_new_tokens: 256,
            stop_sequences: Vec::new(),
            seed: None,
            add_bos: true,
            stream_batch: 1,
            truncation: TruncationPolicy::Disabled,
            timeout: None,
        }
    }
}

impl GenerationParams {
    pub fn builder() -> GenerationParamsBuilder {
        GenerationParamsBuilder::default()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.sampling.validate().map_err(InferenceError::InvalidParams)?;

        if self.max_new_tokens == 0 {
            return Err(InferenceError::InvalidParams("max_new_tokens must be positive".to_string()));
        }
        if self.stream_batch == 0 {
            return Err(InferenceError::InvalidParams("stream_batch must be positive".to_string()));
        }
        if self.stop_sequences.iter().any(String::is_empty) {
            return Err(InferenceError::InvalidParams("stop sequences must not be empty".to_string()));
        }
        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(InferenceError::InvalidParams("timeout must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct GenerationParamsBuilder {
    temperature: Option<f32>,
    top_k: Option<usize>,
    top_p: Option<f32>,
    repetition_penalty: Option<f32>,
    repeat_last_n: Option<usize>,
    max_new_tokens: Option<usize>,
    stop_sequences: Vec<String>,
    seed: Option<u64>,
    add_bos: Option<bool>,
    stream_batch: Option<usize>,
    truncation: Option<TruncationPolicy>,
    timeout: Option<Duration>,
}

impl GenerationParamsBuilder {
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn top_k(mut self, top_k: Option<usize>) -> Self {
        self.top_k = top_k;
        self
    }
    pub fn top_p(mut self, top_p: Option<f32>) -> Self {
        self.top_p = top_p;
        self
    }
    pub fn repetition_penalty(mut self, penalty: Option<f32>) -> Self {
        self.repetition_penalty = penalty;
        self
    }
    pub fn repeat_last_n(mut self, repeat_last_n: Option<usize>) -> Self {
        self.repeat_last_n = repeat_last_n;
        self
    }
    pub fn max_new_tokens(mut self, max_new_tokens: Option<usize>) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }
    pub fn stop_sequence(mut self, stop: impl Into<String>) -> Self {
        self.stop_sequences.push(stop.into());
        self
    }
    pub fn stop_sequences<I, S>(mut self, stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_sequences.extend(stops.into_iter().map(Into::into));
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn add_bos(mut self, add_bos: Option<bool>) -> Self {
        self.add_bos = add_bos;
        self
    }
    pub fn stream_batch(mut self, stream_batch: Option<usize>) -> Self {
        self.stream_batch = stream_batch;
        self
    }
    pub fn truncation(mut self, truncation: Option<TruncationPolicy>) -> Self {
        self.truncation = truncation;
        self
    }
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
    pub fn build(self) -> Result<GenerationParams> {
        let defaults = GenerationParams::default();
        let sampling_defaults = defaults.sampling;

        let params = GenerationParams {
            sampling: SamplingParams {
                temperature: self.temperature.unwrap_or(sampling_defaults.temperature),
                top_k: self.top_k.unwrap_or(sampling_defaults.top_k),
                top_p: self.top_p.unwrap_or(sampling_defaults.top_p),
                repetition_penalty: self.repetition_penalty.unwrap_or(sampling_defaults.repetition_penalty),
                repeat_last_n: self.repeat_last_n.unwrap_or(sampling_defaults.repeat_last_n),
            },
            max_new_tokens: self.max_new_tokens.unwrap_or(defaults.max_new_tokens),
            stop_sequences: self.stop_sequences,
            seed: self.seed,
            add_bos: self.add_bos.unwrap_or(defaults.add_bos),
            stream_batch: self.stream_batch.unwrap_or(defaults.stream_batch),
            truncation: self.truncation.unwrap_or_default(),
            timeout: self.timeout,
        };
        params.validate()?;
        Ok(params)
    }
}

/// One piece of generated text, numbered from zero per generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextIncrement {
    pub index: usize,
    pub text: String,
}

/// Why a generation ended.
#[derive(Debug)]
pub enum CompletionReason {
    StopSequence,
    EndOfSequence,
    MaxTokens,
    /// The window filled up under [`TruncationPolicy::KeepRecent`].
    ContextFull,
    Cancelled,
    Failed(InferenceError),
}

impl CompletionReason {
    pub fn is_failure(&self) -> bool {
        matches!(self, CompletionReason::Failed(_))
    }

    /// Terminal phase of the state machine for this reason.
    pub fn phase(&self) -> Phase {
        match self {
            CompletionReason::Cancelled => Phase::Cancelled,
            CompletionReason::Failed(_) => Phase::Failed,
            _ => Phase::Completed,
        }
    }
}

impl From<InferenceError> for CompletionReason {
    fn from(err: InferenceError) -> Self {
        CompletionReason::Failed(err)
    }
}

/// States of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Priming,
    Generating,
    Completed,
    Cancelled,
    Failed,
}

/// Counters of one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationStats {
    /// Tokens evaluated while priming, including a carried over token and BOS.
    pub prompt_tokens: usize,
    /// Sampled tokens, not counting the end-of-sequence token.
    pub generated_tokens: usize,
    pub prefill_duration: Duration,
    pub decode_duration: Duration,
}

impl GenerationStats {
    pub fn tokens_per_second(&self) -> f64 {
        let seconds = self.decode_duration.as_secs_f64();
        if self.generated_tokens > 0 && seconds > 0.0 { self.generated_tokens as f64 / seconds } else { 0.0 }
    }
}

/// Terminal event of a generation.
#[derive(Debug)]
pub struct Completion {
    pub reason: CompletionReason,
    pub stats: GenerationStats,
}

/// Tracks token generation timings.
#[derive(Debug, Default)]
struct TokenMetrics {
    prefill_start: Option<Instant>,
    decode_start: Option<Instant>,
    stats: GenerationStats,
}

impl TokenMetrics {
    fn start_prefill(&mut self) {
        self.prefill_start = Some(Instant::now());
    }

    fn increment_prompt_token(&mut self) {
        self.stats.prompt_tokens += 1;
    }

    fn start_generation(&mut self) {
        if let Some(start) = self.prefill_start.take() {
            self.stats.prefill_duration = start.elapsed();
        }
        if self.decode_start.is_none() {
            self.decode_start = Some(Instant::now());
        }
    }

    fn increment_token(&mut self) {
        self.stats.generated_tokens += 1;
    }

    fn finish(&mut self) -> GenerationStats {
        if let Some(start) = self.prefill_start.take() {
            self.stats.prefill_duration = start.elapsed();
        }
        if let Some(start) = self.decode_start.take() {
            self.stats.decode_duration = start.elapsed();
        }
        self.stats
    }
}

/// Withholds text that might be the beginning of a stop sequence.
#[derive(Debug, Default)]
pub(crate) struct StopMatcher {
    stops: Vec<String>,
    held: String,
}

/// Result of feeding text to a [`StopMatcher`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct StopScan {
    /// Text that is safe to emit.
    pub emit: String,
    /// A stop sequence was found; nothing after `emit` may be emitted.
    pub matched: bool,
}

impl StopMatcher {
    pub fn new(stops: &[String]) -> Self {
        Self { stops: stops.to_vec(), held: String::new() }
    }

    pub fn push(&mut self, text: &str) -> StopScan {
        self.held.push_str(text);

        if self.stops.is_empty() {
            return StopScan { emit: std::mem::take(&mut self.held), matched: false };
        }

        if let Some(position) = self.stops.iter().filter_map(|stop| self.held.find(stop.as_str())).min() {
            let emit = self.held[..position].to_string();
            self.held.clear();
            return StopScan { emit, matched: true };
        }

        // Longest suffix that is a proper prefix of some stop sequence.
        let keep_from = self
            .held
            .char_indices()
            .map(|(offset, _)| offset)
            .find(|&offset| {
                let tail = &self.held[offset..];
                self.stops.iter().any(|stop| stop.starts_with(tail))
            })
            .unwrap_or(self.held.len());

        let held = self.held.split_off(keep_from);
        let emit = std::mem::replace(&mut self.held, held);
        StopScan { emit, matched: false }
    }

    /// Releases withheld text once no stop sequence can follow.
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.held)
    }
}

/// Coalesces text of `stream_batch` tokens into one increment.
#[derive(Debug)]
struct Batcher {
    batch_size: usize,
    text: String,
    tokens: usize,
    next_index: usize,
}

impl Batcher {
    fn new(batch_size: usize) -> Self {
        Self { batch_size, text: String::new(), tokens: 0, next_index: 0 }
    }

    /// Adds the text of one token; returns an increment once the batch is full.
    fn push(&mut self, text: &str) -> Option<TextIncrement> {
        self.text.push_str(text);
        self.tokens += 1;
        if self.tokens >= self.batch_size { self.take() } else { None }
    }

    fn take(&mut self) -> Option<TextIncrement> {
        self.tokens = 0;
        if self.text.is_empty() {
            return None;
        }
        let increment = TextIncrement { index: self.next_index, text: std::mem::take(&mut self.text) };
        self.next_index += 1;
        Some(increment)
    }
}

/// Drives one generation over an exclusively borrowed execution context.
pub(crate) struct Generator<'a> {
    model: &'a Model,
    ctx: &'a mut ExecutionContext,
    params: &'a GenerationParams,
    cancel: &'a CancellationToken,
    sampler: Sampler,
    decoder: StreamDecoder,
    stops: StopMatcher,
    batcher: Batcher,
    metrics: TokenMetrics,
    phase: Phase,
}

impl<'a> Generator<'a> {
    pub fn new(
        model: &'a Model,
        ctx: &'a mut ExecutionContext,
        params: &'a GenerationParams,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            model,
            ctx,
            params,
            cancel,
            sampler: Sampler::new(model.config().vocab_size),
            decoder: StreamDecoder::new(),
            stops: StopMatcher::new(&params.stop_sequences),
            batcher: Batcher::new(params.stream_batch),
            metrics: TokenMetrics::default(),
            phase: Phase::Idle,
        }
    }

    /// Runs the generation to its end, handing every increment to `emit`.
    ///
    /// `emit` returns `false` when nobody listens anymore, which cancels the generation.
    pub fn run(mut self, prompt: &str, emit: &mut dyn FnMut(TextIncrement) -> bool) -> Completion {
        if let Some(seed) = self.params.seed {
            self.ctx.rng = XorShiftRng::new(seed);
        }

        let reason = match self.prime(prompt) {
            Ok(()) => self.generate(emit),
            Err(reason) => reason,
        };

        self.enter(reason.phase());
        let stats = self.metrics.finish();

        match &reason {
            CompletionReason::Failed(err) => log::warn!("generation failed: {err}"),
            reason => log::info!(
                "generation finished ({reason:?}): {} prompt tokens in {:.2}s, {} tokens in {:.2}s - {:.2} tokens/sec",
                stats.prompt_tokens,
                stats.prefill_duration.as_secs_f64(),
                stats.generated_tokens,
                stats.decode_duration.as_secs_f64(),
                stats.tokens_per_second()
            ),
        }

        Completion { reason, stats }
    }

    fn enter(&mut self, phase: Phase) {
        log::debug!("generation phase {:?} -> {phase:?}", self.phase);
        self.phase = phase;
    }

    /// Evaluates the carried over token and the prompt, leaving the logits of the
    /// last one in the context.
    fn prime(&mut self, prompt: &str) -> std::result::Result<(), CompletionReason> {
        self.enter(Phase::Priming);
        self.metrics.start_prefill();

        let model = self.model;
        let tokenizer = model.tokenizer();
        let prompt_tokens = tokenizer.encode(prompt).map_err(InferenceError::from)?;

        let mut tokens = Vec::with_capacity(prompt_tokens.len() + 2);
        tokens.extend(self.ctx.pending);
        if self.params.add_bos && self.ctx.is_empty() {
            tokens.extend(tokenizer.bos_token_id());
        }
        tokens.extend(prompt_tokens);

        if tokens.is_empty() {
            return Err(InferenceError::InvalidParams("prompt is empty and there is nothing to continue".into()).into());
        }

        let tokens = self.fit_into_window(tokens)?;
        self.ctx.pending = None;

        for token in tokens {
            if self.cancel.is_cancelled() {
                return Err(CompletionReason::Cancelled);
            }
            model.step(&mut *self.ctx, token)?;
            self.metrics.increment_prompt_token();
        }

        Ok(())
    }

    /// Checks that `tokens` fit after the cached ones, truncating the conversation
    /// when the policy allows it.
    fn fit_into_window(&mut self, tokens: Vec<TokenId>) -> std::result::Result<Vec<TokenId>, CompletionReason> {
        let window = self.ctx.context_window();
        let required = self.ctx.position() + tokens.len();

        if required <= window {
            return Ok(tokens);
        }

        match self.params.truncation {
            TruncationPolicy::Disabled => {
                Err(InferenceError::ContextOverflow { position: required - 1, context_window: window }.into())
            }
            TruncationPolicy::KeepRecent => {
                let reserve = self.params.max_new_tokens.min(window / 2).max(1);
                let keep = window.saturating_sub(reserve).max(1);

                let mut conversation = self.ctx.tokens().to_vec();
                conversation.extend(tokens);
                let kept = conversation.split_off(conversation.len().saturating_sub(keep));

                log::warn!(
                    "prompt does not fit into the context window of {window}: keeping the last {} of {} tokens",
                    kept.len(),
                    kept.len() + conversation.len()
                );

                self.ctx.reset();
                Ok(kept)
            }
        }
    }

    fn generate(&mut self, emit: &mut dyn FnMut(TextIncrement) -> bool) -> CompletionReason {
        self.enter(Phase::Generating);
        self.metrics.start_generation();

        let model = self.model;
        let tokenizer = model.tokenizer();
        let mut previous: Option<TokenId> = None;
        let mut generated = 0;

        let reason = loop {
            if self.cancel.is_cancelled() {
                break CompletionReason::Cancelled;
            }
            if generated >= self.params.max_new_tokens {
                break CompletionReason::MaxTokens;
            }

            if let Some(token) = previous {
                match model.step(&mut *self.ctx, token) {
                    Ok(_) => {}
                    Err(InferenceError::ContextOverflow { .. })
                        if self.params.truncation == TruncationPolicy::KeepRecent =>
                    {
                        break CompletionReason::ContextFull;
                    }
                    Err(err) => break err.into(),
                }
            }

            let ExecutionContext { state, tokens, rng, .. } = &mut *self.ctx;
            let next = self.sampler.choose(&state.logits, &self.params.sampling, tokens, rng);

            if tokenizer.is_end_of_generation(next) {
                previous = None;
                break CompletionReason::EndOfSequence;
            }

            previous = Some(next);
            generated += 1;
            self.metrics.increment_token();

            let text = match tokenizer.token_bytes(next).and_then(|bytes| self.decoder.push(bytes)) {
                Ok(text) => text.unwrap_or_default(),
                Err(err) => break InferenceError::from(err).into(),
            };

            let scan = self.stops.push(&text);
            if scan.matched {
                self.batcher.text.push_str(&scan.emit);
                break CompletionReason::StopSequence;
            }

            if let Some(increment) = self.batcher.push(&scan.emit) {
                if !emit(increment) {
                    log::debug!("stream receiver is gone, cancelling");
                    self.cancel.cancel();
                    break CompletionReason::Cancelled;
                }
            }
        };

        // The last sampled token is evaluated by the next turn.
        self.ctx.pending = previous;

        if !reason.is_failure() {
            self.flush(&reason, emit);
        }

        reason
    }

    /// Emits whatever is withheld at the end of a generation.
    fn flush(&mut self, reason: &CompletionReason, emit: &mut dyn FnMut(TextIncrement) -> bool) {
        let leftover = self.decoder.finish();
        if !leftover.is_empty() {
            log::warn!("dropping {} bytes of an incomplete UTF-8 character: {leftover:02x?}", leftover.len());
        }

        if !matches!(reason, CompletionReason::StopSequence) {
            let held = self.stops.flush();
            self.batcher.text.push_str(&held);
        }

        if let Some(increment) = self.batcher.take() {
            emit(increment);
        }
    }
}
