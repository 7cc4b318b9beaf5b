use std::collections::TryReserveError;

use rayon::prelude::*;

use crate::configuration::ModelConfig;
use crate::tensor::{QuantizedTensor, QuantizedView, matmul_f32, matmul_q8, quantize, softmax};
use crate::tokenizer::TokenId;
use crate::utils::{Span, WeightStore, try_zeroed};

/// Storage of the token embedding table.
#[derive(Debug)]
pub(crate) enum EmbeddingTable {
    /// Dequantized copy owned by the model.
    Owned(Vec<f32>),
    /// Full precision rows read straight from the mapped file.
    Mapped(Span),
}

/// Token embedding layer - converts token ids to dense vectors.
///
/// **Shape**: [vocab_size, dim]
pub struct TokenEmbedding {
    table: EmbeddingTable,
    dim: usize,
}

impl TokenEmbedding {
    pub(crate) fn new(table: EmbeddingTable, dim: usize) -> Self {
        Self { table, dim }
    }

    pub fn forward(&self, store: &WeightStore, token: TokenId, output: &mut [f32]) {
        let start_idx = token as usize * self.dim;
        let end_idx = start_idx + self.dim;
        let table = match &self.table {
            EmbeddingTable::Owned(values) => values.as_slice(),
            EmbeddingTable::Mapped(span) => store.f32s(*span),
        };
        output[..self.dim].copy_from_slice(&table[start_idx..end_idx]);
    }
}

impl std::fmt::Debug for TokenEmbedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let owned = matches!(self.table, EmbeddingTable::Owned(_));
        f.debug_struct("TokenEmbedding").field("dim", &self.dim).field("owned", &owned).finish()
    }
}

/// RMS layer normalization.
///
/// ```text
/// RMSNorm(x) = x / RMS(x) * γ
/// where RMS(x) = sqrt(mean(x²) + ε)
/// ```
pub struct RMSNorm {
    pub weight: Vec<f32>,
    pub eps: f32,
}

impl RMSNorm {
    pub fn new(weight: Vec<f32>, eps: f32) -> Self {
        Self { weight, eps }
    }

    fn factor(&self, input: &[f32]) -> f32 {
        let sum_of_squares = input.iter().map(|&x| x * x).sum::<f32>();
        1.0f32 / ((sum_of_squares / input.len() as f32) + self.eps).sqrt()
    }

    pub fn forward(&self, output: &mut [f32], input: &[f32]) {
        debug_assert_eq!(output.len(), input.len());
        debug_assert_eq!(input.len(), self.weight.len());

        let rms_norm_factor = self.factor(input);

        output.iter_mut().zip(input.iter()).zip(self.weight.iter()).for_each(|((out, &inp), &w)| {
            *out = w * (rms_norm_factor * inp);
        });
    }

    pub fn forward_inplace(&self, x: &mut [f32]) {
        debug_assert_eq!(x.len(), self.weight.len());

        let rms_norm_factor = self.factor(x);

        x.iter_mut().zip(self.weight.iter()).for_each(|(val, &w)| {
            *val = w * (rms_norm_factor * *val);
        });
    }
}

impl std::fmt::Debug for RMSNorm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RMSNorm").field("dim", &self.weight.len()).field("eps", &self.eps).finish()
    }
}

/// Rotary position embedding applied to each query and key head.
///
/// Rotates the pair `(x[i], x[i + head_dim / 2])` by `pos * theta^(-2i / head_dim)`.
#[derive(Debug)]
pub struct RoPE {
    pub head_dim: usize,
    pub theta: f32,
}

impl RoPE {
    pub fn new(head_dim: usize, theta: f32) -> Self {
        Self { head_dim, theta }
    }

    pub fn compute_freqs(&self, pos: usize) -> Vec<(f32, f32)> {
        let head_dim_half = self.head_dim / 2;

        (0..head_dim_half)
            .map(|dim_idx| {
                let freq = self.theta.powf(-(dim_idx as f32) / head_dim_half as f32);
                let angle = pos as f32 * freq;
                (angle.cos(), angle.sin())
            })
            .collect()
    }

    pub fn apply(&self, slice: &mut [f32], freqs: &[(f32, f32)]) {
        let head_dim_half = slice.len() / 2;
        let (first_half, second_half) = slice.split_at_mut(head_dim_half);

        first_half.iter_mut().zip(second_half.iter_mut()).zip(freqs.iter()).for_each(
            |((x, y), &(cos_freq, sin_freq))| {
                let x_val = *x;
                let y_val = *y;
                *x = x_val * cos_freq - y_val * sin_freq;
                *y = x_val * sin_freq + y_val * cos_freq;
            },
        );
    }
}

/// Location of a weight matrix inside the mapped file.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LinearWeight {
    Q8 { q: Span, s: Span },
    F32(Span),
}

/// Linear layer over mapped weights, `out_features` rows of `in_features` values.
///
/// Quantized weights are multiplied with the input quantized on the fly,
/// full precision weights with the input as is.
pub struct Linear {
    weight: LinearWeight,
    pub in_features: usize,
    pub out_features: usize,
    pub group_size: usize,
}

impl Linear {
    pub(crate) fn new(weight: LinearWeight, in_features: usize, out_features: usize, group_size: usize) -> Self {
        Self { weight, in_features, out_features, group_size }
    }

    pub fn forward(&self, store: &WeightStore, output: &mut [f32], input: &[f32], scratch: &mut QuantizedTensor) {
        let input = &input[..self.in_features];
        match self.weight {
            LinearWeight::Q8 { q, s } => {
                quantize(scratch, input, self.group_size);
                let weights = QuantizedView { q: store.i8s(q), s: store.f32s(s) };
                matmul_q8(output, scratch, weights, self.in_features, self.out_features, self.group_size);
            }
            LinearWeight::F32(span) => {
                matmul_f32(output, input, store.f32s(span), self.in_features, self.out_features);
            }
        }
    }
}

impl std::fmt::Debug for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linear")
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .field("quantized", &matches!(self.weight, LinearWeight::Q8 { .. }))
            .finish()
    }
}

/// Key/value cache of one execution context.
///
/// Layout: `[n_layers][window][kv_dim]` for keys and values alike.
#[derive(Debug)]
pub struct KvCache {
    pub key: Vec<f32>,
    pub value: Vec<f32>,
    pub window: usize,
    pub kv_dim: usize,
}

impl KvCache {
    pub fn new(config: &ModelConfig, window: usize) -> Result<Self, TryReserveError> {
        let kv_dim = config.kv_dim();
        let len = config.n_layers * window * kv_dim;
        Ok(Self { key: try_zeroed(len)?, value: try_zeroed(len)?, window, kv_dim })
    }

    /// Bytes needed by a cache of `window` positions.
    pub fn size_in_bytes(config: &ModelConfig, window: usize) -> usize {
        2 * config.n_layers * window * config.kv_dim() * std::mem::size_of::<f32>()
    }

    fn layer_offset(&self, layer_idx: usize) -> usize {
        layer_idx * self.window * self.kv_dim
    }

    /// Forgets every cached position.
    pub fn clear(&mut self) {
        self.key.fill(0.0);
        self.value.fill(0.0);
    }
}

/// Multi-head attention with grouped query attention.
///
/// `n_heads` query heads share `n_kv_heads` key/value heads. Query and key
/// heads are RMS-normalized when the architecture carries QK norms, then
/// rotated with RoPE.
///
/// ```text
/// Attention(Q,K,V) = softmax(QK^T / √d_k)V
/// ```
pub struct MultiHeadAttention {
    pub wq: Linear,
    pub wk: Linear,
    pub wv: Linear,
    pub wo: Linear,
    pub qk_norm: Option<(RMSNorm, RMSNorm)>,
    pub rope: RoPE,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub kv_mul: usize,
}

impl MultiHeadAttention {
    pub fn new(
        wq: Linear,
        wk: Linear,
        wv: Linear,
        wo: Linear,
        qk_norm: Option<(RMSNorm, RMSNorm)>,
        config: &ModelConfig,
    ) -> Self {
        Self {
            wq,
            wk,
            wv,
            wo,
            qk_norm,
            rope: RoPE::new(config.head_dim, config.rope_theta),
            n_heads: config.n_heads,
            n_kv_heads: config.n_kv_heads,
            head_dim: config.head_dim,
            kv_mul: config.n_heads / config.n_kv_heads,
        }
    }

    /// Attends over positions `0..=pos` with the normalized input in `state.xb`,
    /// leaving the per-head results in `state.xb`.
    pub fn forward(
        &self,
        store: &WeightStore,
        pos: usize,
        layer_idx: usize,
        state: &mut RunState,
        cache: &mut KvCache,
    ) {
        let dim = self.wq.in_features;
        let kv_dim = cache.kv_dim;
        let kv_cache_offset = cache.layer_offset(layer_idx);
        let current_pos_offset = kv_cache_offset + pos * kv_dim;
        let current = current_pos_offset..current_pos_offset + kv_dim;

        self.wq.forward(store, &mut state.q, &state.xb[..dim], &mut state.xq);
        self.wk.forward(store, &mut cache.key[current.clone()], &state.xb[..dim], &mut state.xq);
        self.wv.forward(store, &mut cache.value[current], &state.xb[..dim], &mut state.xq);

        let rope_freqs = self.rope.compute_freqs(pos);
        self.apply_qk_normalization_and_rope(current_pos_offset, &rope_freqs, state, cache);

        self.compute_attention(pos, kv_cache_offset, state, cache);
    }

    fn apply_qk_normalization_and_rope(
        &self,
        current_pos_offset: usize,
        rope_freqs: &[(f32, f32)],
        state: &mut RunState,
        cache: &mut KvCache,
    ) {
        for head_idx in 0..self.n_heads {
            let q_slice = &mut state.q[head_idx * self.head_dim..(head_idx + 1) * self.head_dim];

            if let Some((q_norm, _)) = &self.qk_norm {
                state.temp_workspace[..self.head_dim].copy_from_slice(q_slice);
                q_norm.forward(q_slice, &state.temp_workspace[..self.head_dim]);
            }
            self.rope.apply(q_slice, rope_freqs);
        }

        for head_idx in 0..self.n_kv_heads {
            let k_start = current_pos_offset + head_idx * self.head_dim;
            let k_slice = &mut cache.key[k_start..k_start + self.head_dim];

            if let Some((_, k_norm)) = &self.qk_norm {
                state.temp_workspace[..self.head_dim].copy_from_slice(k_slice);
                k_norm.forward(k_slice, &state.temp_workspace[..self.head_dim]);
            }
            self.rope.apply(k_slice, rope_freqs);
        }
    }

    fn compute_attention(&self, pos: usize, kv_cache_offset: usize, state: &mut RunState, cache: &KvCache) {
        let attention_scale = (self.head_dim as f32).sqrt().recip();
        let kv_dim = cache.kv_dim;
        let all_heads_dim = self.n_heads * self.head_dim;
        let q = &state.q;

        state
            .att
            .par_chunks_mut(cache.window)
            .zip(state.xb[..all_heads_dim].par_chunks_mut(self.head_dim))
            .enumerate()
            .for_each(|(head_idx, (att_slice, xb_slice))| {
                let q_head = &q[head_idx * self.head_dim..(head_idx + 1) * self.head_dim];
                let kv_head_offset = kv_cache_offset + (head_idx / self.kv_mul) * self.head_dim;

                let att_head = &mut att_slice[0..=pos];

                att_head.iter_mut().enumerate().for_each(|(time_step, att_score)| {
                    let k_start = kv_head_offset + time_step * kv_dim;
                    *att_score = q_head
                        .iter()
                        .zip(&cache.key[k_start..k_start + self.head_dim])
                        .map(|(&q, &k)| q * k)
                        .sum::<f32>()
                        * attention_scale;
                });

                softmax(att_head);

                xb_slice.fill(0.0);
                for (time_step, &attention_weight) in att_head.iter().enumerate() {
                    let v_start = kv_head_offset + time_step * kv_dim;
                    xb_slice
                        .iter_mut()
                        .zip(&cache.value[v_start..v_start + self.head_dim])
                        .for_each(|(out, &value)| *out += attention_weight * value);
                }
            });
    }
}

impl std::fmt::Debug for MultiHeadAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiHeadAttention")
            .field("n_heads", &self.n_heads)
            .field("n_kv_heads", &self.n_kv_heads)
            .field("head_dim", &self.head_dim)
            .field("qk_norm", &self.qk_norm.is_some())
            .field("wq", &self.wq)
            .field("wo", &self.wo)
            .finish()
    }
}

/// Feed-forward network with SwiGLU activation.
///
/// `SwiGLU(x) = Swish(W1·x) ⊙ (W3·x)`, projected back with `W2`.
pub struct FeedForward {
    pub w1: Linear, // Gate projection
    pub w2: Linear, // Down projection
    pub w3: Linear, // Up projection
}

impl FeedForward {
    pub fn new(w1: Linear, w2: Linear, w3: Linear) -> Self {
        Self { w1, w2, w3 }
    }

    /// Reads the normalized input from `state.xb` and writes the result back into it.
    pub fn forward(&self, store: &WeightStore, state: &mut RunState) {
        let dim = self.w1.in_features;

        self.w1.forward(store, &mut state.hb, &state.xb[..dim], &mut state.xq);
        self.w3.forward(store, &mut state.hb2, &state.xb[..dim], &mut state.xq);

        state.hb.iter_mut().zip(state.hb2.iter()).for_each(|(gate_val, &linear_val)| {
            let swish_output = *gate_val * (1.0f32 + (-*gate_val).exp()).recip();
            *gate_val = swish_output * linear_val;
        });

        self.w2.forward(store, &mut state.xb[..dim], &state.hb, &mut state.xq);
    }
}

impl std::fmt::Debug for FeedForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedForward").field("hidden_dim", &self.w1.out_features).finish()
    }
}

/// Scratch buffers of one forward pass.
///
/// Allocated once per execution context so the hot path never allocates
/// (apart from the RoPE frequency table).
#[derive(Debug)]
pub struct RunState {
    /// Residual stream. Shape: [dim]
    pub x: Vec<f32>,
    /// Normalized input and attention output. Shape: [max(dim, n_heads * head_dim)]
    pub xb: Vec<f32>,
    /// Projection output before the residual add. Shape: [dim]
    pub xb2: Vec<f32>,
    /// Shape: [hidden_dim]
    pub hb: Vec<f32>,
    /// Shape: [hidden_dim]
    pub hb2: Vec<f32>,
    /// Quantized copy of whichever activation feeds the next matmul.
    pub xq: QuantizedTensor,
    /// Shape: [n_heads * head_dim]
    pub q: Vec<f32>,
    /// Attention weights. Shape: [n_heads, window]
    pub att: Vec<f32>,
    /// Shape: [vocab_size]
    pub logits: Vec<f32>,
    /// Shape: [head_dim]
    pub temp_workspace: Vec<f32>,
}

impl RunState {
    pub fn new(config: &ModelConfig, window: usize) -> Result<Self, TryReserveError> {
        let ModelConfig { group_size, n_heads, head_dim, dim, hidden_dim, vocab_size, .. } = *config;

        let all_heads_dim = n_heads * head_dim;
        let activation_dim = dim.max(all_heads_dim);
        let quantized_dim = activation_dim.max(hidden_dim);

        let mut xq = QuantizedTensor { q: try_zeroed(quantized_dim)?, s: Vec::new() };
        if group_size > 0 {
            xq.s = try_zeroed(quantized_dim / group_size)?;
        }

        Ok(Self {
            x: try_zeroed(dim)?,
            xb: try_zeroed(activation_dim)?,
            xb2: try_zeroed(dim)?,
            hb: try_zeroed(hidden_dim)?,
            hb2: try_zeroed(hidden_dim)?,
            xq,
            q: try_zeroed(all_heads_dim)?,
            att: try_zeroed(n_heads * window)?,
            logits: try_zeroed(vocab_size)?,
            temp_workspace: try_zeroed(head_dim)?,
        })
    }

    /// Approximate bytes held by the scratch buffers.
    pub fn size_in_bytes(config: &ModelConfig, window: usize) -> usize {
        let all_heads_dim = config.n_heads * config.head_dim;
        let floats = 3 * config.dim.max(all_heads_dim)
            + 2 * config.hidden_dim
            + all_heads_dim
            + config.n_heads * window
            + config.vocab_size
            + config.head_dim;
        floats * std::mem::size_of::<f32>() + config.dim.max(all_heads_dim).max(config.hidden_dim)
    }
}
