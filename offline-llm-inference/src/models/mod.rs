use std::path::{Path, PathBuf};

use crate::configuration::{LoadConfig, ModelConfig, QuantizationHint, read_header};
use crate::context::{ExecutionContext, XorShiftRng};
use crate::error::{InferenceError, ModelLoadError, Result};
use crate::tokenizer::{TokenId, Tokenizer, read_vocabulary};
use crate::utils::{MemoryMapper, WeightStore};

mod decoder;

use decoder::{DecoderNetwork, load_network};

/// A loaded model: immutable weights, tokenizer and the thread pool its
/// forward passes run on.
///
/// Shared read-only by every session; all per-conversation state lives in
/// [`ExecutionContext`].
pub struct Model {
    config: ModelConfig,
    context_window: usize,
    tokenizer: Tokenizer,
    network: DecoderNetwork,
    store: WeightStore,
    pool: rayon::ThreadPool,
    path: PathBuf,
}

impl Model {
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Number of positions each execution context holds.
    pub fn context_window(&self) -> usize {
        self.context_window
    }

    pub fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocates a fresh, empty execution context for this model.
    pub fn new_context(&self, rng: XorShiftRng) -> Result<ExecutionContext> {
        ExecutionContext::new(&self.config, self.context_window, rng)
    }

    /// Evaluates `token` at the context's current position.
    ///
    /// Writes the token's keys and values into the cache, advances the position
    /// and returns one unnormalized score per vocabulary entry. A full context is
    /// reported as [`InferenceError::ContextOverflow`] and left untouched.
    pub fn step<'c>(&self, ctx: &'c mut ExecutionContext, token: TokenId) -> Result<&'c [f32]> {
        let position = ctx.position;
        let context_window = ctx.context_window();

        if position >= context_window {
            return Err(InferenceError::ContextOverflow { position, context_window });
        }

        if token as usize >= self.config.vocab_size {
            return Err(InferenceError::Engine {
                position,
                reason: format!("token {token} is outside of the vocabulary of {}", self.config.vocab_size),
            });
        }

        let ExecutionContext { state, cache, .. } = &mut *ctx;
        self.pool.install(|| self.network.forward(&self.store, token, position, state, cache));

        if let Some(index) = ctx.state.logits.iter().position(|logit| !logit.is_finite()) {
            return Err(InferenceError::Engine {
                position,
                reason: format!("logit {index} is {}", ctx.state.logits[index]),
            });
        }

        ctx.position += 1;
        ctx.tokens.push(token);

        Ok(&ctx.state.logits)
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("path", &self.path)
            .field("config", &self.config)
            .field("context_window", &self.context_window)
            .field("threads", &self.pool.current_num_threads())
            .field("network", &self.network)
            .field("store", &self.store)
            .finish()
    }
}

/// Builder pattern for loading models.
pub struct ModelBuilder {
    path: PathBuf,
    context_window: Option<usize>,
    thread_count: usize,
    quantization_hint: QuantizationHint,
}

impl ModelBuilder {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let defaults = LoadConfig::default();
        Self {
            path: path.as_ref().to_path_buf(),
            context_window: defaults.context_window,
            thread_count: defaults.thread_count,
            quantization_hint: defaults.quantization_hint,
        }
    }

    pub fn with_load_config(self, config: &LoadConfig) -> Self {
        self.with_context_window(config.context_window)
            .with_thread_count(config.thread_count)
            .with_quantization_hint(config.quantization_hint)
    }

    pub fn with_context_window(mut self, context_window: Option<usize>) -> Self {
        self.context_window = context_window.filter(|&value| value > 0);
        self
    }

    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count.max(1);
        self
    }

    pub fn with_quantization_hint(mut self, hint: QuantizationHint) -> Self {
        self.quantization_hint = hint;
        self
    }

    /// Maps the file, validates it completely and builds the model.
    pub fn build(self) -> Result<Model, ModelLoadError> {
        let mut mapper = MemoryMapper::open(&self.path)?;

        let config = read_header(&mut mapper)?;
        log::debug!("{config:?}");

        if !self.quantization_hint.accepts(config.quantization) {
            return Err(ModelLoadError::QuantizationMismatch {
                path: self.path,
                expected: self.quantization_hint,
                actual: config.quantization,
            });
        }

        let tokenizer = read_vocabulary(&mut mapper, &config)?;
        mapper.align_to(crate::configuration::WEIGHT_ALIGNMENT)?;
        debug_assert_eq!(mapper.position(), config.weights_offset());

        let (network, store) = load_network(mapper, &config)?;

        let context_window = match self.context_window {
            None => config.seq_len,
            Some(requested) if requested > config.seq_len => {
                log::warn!("context window {requested} exceeds the model's {}, clamping", config.seq_len);
                config.seq_len
            }
            Some(requested) => requested,
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.thread_count)
            .thread_name(|index| format!("olm-worker-{index}"))
            .build()
            .map_err(|err| ModelLoadError::ThreadPool(err.to_string()))?;

        log::info!(
            "loaded {} ({}, {} layers, dim {}, vocab {}, window {}, {} threads, {} mapped bytes)",
            self.path.display(),
            config.quantization,
            config.n_layers,
            config.dim,
            config.vocab_size,
            context_window,
            self.thread_count,
            store.mapped_bytes()
        );

        Ok(Model { config, context_window, tokenizer, network, store, pool, path: self.path })
    }
}
