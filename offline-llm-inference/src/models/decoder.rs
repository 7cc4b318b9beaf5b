use crate::configuration::{ModelConfig, Quantization, SCALE_ALIGNMENT};
use crate::error::ModelLoadError;
use crate::layers::*;
use crate::tensor::dequantize;
use crate::tokenizer::TokenId;
use crate::utils::{MemoryMapper, Span, WeightStore, try_zeroed};

/// Decoder-only transformer: embedding, `n_layers` blocks, final norm and classifier.
pub struct DecoderNetwork {
    token_embedding: TokenEmbedding,
    blocks: Vec<DecoderBlock>,
    final_norm: RMSNorm,
    lm_head: Linear,
}

impl DecoderNetwork {
    /// Forward pass for one token at `pos`, leaving the logits in `state.logits`.
    ///
    /// 1. **Token Embedding**: token id to a dense vector
    /// 2. **Decoder Blocks**: self-attention and FFN with residual connections
    /// 3. **Final Normalization**: RMSNorm of the residual stream
    /// 4. **Classification Head**: projection to vocabulary scores
    pub fn forward(&self, store: &WeightStore, token: TokenId, pos: usize, state: &mut RunState, cache: &mut KvCache) {
        self.token_embedding.forward(store, token, &mut state.x);

        for (layer_idx, block) in self.blocks.iter().enumerate() {
            block.forward(store, pos, layer_idx, state, cache);
        }

        self.final_norm.forward_inplace(&mut state.x);

        self.lm_head.forward(store, &mut state.logits, &state.x, &mut state.xq);
    }
}

impl std::fmt::Debug for DecoderNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        struct BlocksSummary<'a, T>(&'a [T]);

        impl<T: std::fmt::Debug> std::fmt::Debug for BlocksSummary<'_, T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_list()
                    .entries(self.0.iter().take(1))
                    .entry(&format_args!("... and {} more", self.0.len().saturating_sub(1)))
                    .finish()
            }
        }

        f.debug_struct("DecoderNetwork")
            .field("token_embedding", &self.token_embedding)
            .field("blocks", &BlocksSummary(&self.blocks))
            .field("final_norm", &self.final_norm)
            .field("lm_head", &self.lm_head)
            .finish()
    }
}

/// Decoder layer combining self-attention and feed-forward.
#[derive(Debug)]
struct DecoderBlock {
    attn_norm: RMSNorm,
    attention: MultiHeadAttention,
    ffn_norm: RMSNorm,
    feed_forward: FeedForward,
}

impl DecoderBlock {
    fn forward(&self, store: &WeightStore, pos: usize, layer_idx: usize, state: &mut RunState, cache: &mut KvCache) {
        let dim = state.x.len();
        let all_heads_dim = state.q.len();

        // Attention block with residual connection
        self.attn_norm.forward(&mut state.xb[..dim], &state.x);
        self.attention.forward(store, pos, layer_idx, state, cache);
        self.attention.wo.forward(store, &mut state.xb2, &state.xb[..all_heads_dim], &mut state.xq);

        state.x.iter_mut().zip(state.xb2.iter()).for_each(|(x_val, &delta)| *x_val += delta);

        // Feed-forward block with residual connection
        self.ffn_norm.forward(&mut state.xb[..dim], &state.x);
        self.feed_forward.forward(store, state);

        state.x.iter_mut().zip(state.xb[..dim].iter()).for_each(|(x_val, &delta)| *x_val += delta);
    }
}

/// Locations of every weight block, in file order.
struct DecoderWeights {
    rms_att_weight: Span,
    rms_ffn_weight: Span,
    rms_final_weight: Span,
    qk_norm_weights: Option<(Span, Span)>,
    token_embedding: LinearWeight,
    wq: Vec<LinearWeight>,
    wk: Vec<LinearWeight>,
    wv: Vec<LinearWeight>,
    wo: Vec<LinearWeight>,
    w1: Vec<LinearWeight>,
    w2: Vec<LinearWeight>,
    w3: Vec<LinearWeight>,
    wcls: LinearWeight,
}

/// Reads the weight section and builds the network.
///
/// Expects the mapper at the start of the weight section. Every block is bounds
/// and alignment checked before the mapping is frozen into a [`WeightStore`].
pub(crate) fn load_network(
    mut mapper: MemoryMapper,
    config: &ModelConfig,
) -> Result<(DecoderNetwork, WeightStore), ModelLoadError> {
    let weights = locate_weights(&mut mapper, config)?;

    let copy_norm = |span: Span, idx: usize, len: usize| {
        RMSNorm::new(mapper.f32s(span)[idx * len..(idx + 1) * len].to_vec(), config.norm_eps)
    };

    let blocks = (0..config.n_layers)
        .map(|layer_idx| {
            let qk_norm = weights
                .qk_norm_weights
                .map(|(q, k)| (copy_norm(q, layer_idx, config.head_dim), copy_norm(k, layer_idx, config.head_dim)));
            create_decoder_block(config, layer_idx, &weights, qk_norm, &copy_norm)
        })
        .collect();

    let final_norm = copy_norm(weights.rms_final_weight, 0, config.dim);
    let token_embedding = create_token_embedding(&mapper, config, weights.token_embedding)?;
    let lm_head = Linear::new(weights.wcls, config.dim, config.vocab_size, config.group_size);

    let network = DecoderNetwork { token_embedding, blocks, final_norm, lm_head };

    Ok((network, mapper.into_store()))
}

/// Walks the weight section in file order:
/// 1. normalization weights (f32)
/// 2. token embeddings
/// 3. attention and feed-forward matrices, one kind at a time for all layers
/// 4. classifier, unless shared with the embeddings
fn locate_weights(mapper: &mut MemoryMapper, config: &ModelConfig) -> Result<DecoderWeights, ModelLoadError> {
    let ModelConfig { dim, n_layers, head_dim, vocab_size, hidden_dim, shared_classifier, .. } = *config;

    let all_heads_dim = config.all_heads_dim();
    let kv_dim = config.kv_dim();

    let rms_att_weight = mapper.take_f32(n_layers * dim)?;
    let rms_ffn_weight = mapper.take_f32(n_layers * dim)?;
    let rms_final_weight = mapper.take_f32(dim)?;
    let qk_norm_weights = if config.architecture.has_qk_norm() {
        Some((mapper.take_f32(n_layers * head_dim)?, mapper.take_f32(n_layers * head_dim)?))
    } else {
        None
    };

    let token_embedding = take_matrix(mapper, config, vocab_size * dim)?;

    let mut take_layers = |size_each: usize| -> Result<Vec<LinearWeight>, ModelLoadError> {
        (0..n_layers).map(|_| take_matrix(mapper, config, size_each)).collect()
    };

    let wq = take_layers(dim * all_heads_dim)?;
    let wk = take_layers(dim * kv_dim)?;
    let wv = take_layers(dim * kv_dim)?;
    let wo = take_layers(all_heads_dim * dim)?;
    let w1 = take_layers(dim * hidden_dim)?;
    let w2 = take_layers(hidden_dim * dim)?;
    let w3 = take_layers(dim * hidden_dim)?;

    let wcls = if shared_classifier { token_embedding } else { take_matrix(mapper, config, dim * vocab_size)? };

    Ok(DecoderWeights {
        rms_att_weight,
        rms_ffn_weight,
        rms_final_weight,
        qk_norm_weights,
        token_embedding,
        wq,
        wk,
        wv,
        wo,
        w1,
        w2,
        w3,
        wcls,
    })
}

/// Reserves one matrix of `size` values: `i8[size]` zero padded to a 4-byte
/// boundary then `f32[size / group_size]` scales for Q8_0, `f32[size]` for F32.
fn take_matrix(mapper: &mut MemoryMapper, config: &ModelConfig, size: usize) -> Result<LinearWeight, ModelLoadError> {
    match config.quantization {
        Quantization::Q8_0 => {
            let q = mapper.take_i8(size)?;
            mapper.align_to(SCALE_ALIGNMENT)?;
            let s = mapper.take_f32(size / config.group_size)?;
            Ok(LinearWeight::Q8 { q, s })
        }
        Quantization::F32 => Ok(LinearWeight::F32(mapper.take_f32(size)?)),
    }
}

fn create_token_embedding(
    mapper: &MemoryMapper,
    config: &ModelConfig,
    weight: LinearWeight,
) -> Result<TokenEmbedding, ModelLoadError> {
    let table = match weight {
        LinearWeight::F32(span) => EmbeddingTable::Mapped(span),
        LinearWeight::Q8 { q, s } => {
            // Dequantized once so lookups are plain copies.
            let len = config.vocab_size * config.dim;
            let mut table = try_zeroed(len).map_err(|_| ModelLoadError::Allocation {
                path: mapper.path().to_path_buf(),
                bytes: len * std::mem::size_of::<f32>(),
            })?;
            dequantize(mapper.i8s(q), mapper.f32s(s), &mut table, config.group_size);
            EmbeddingTable::Owned(table)
        }
    };

    Ok(TokenEmbedding::new(table, config.dim))
}

fn create_decoder_block(
    config: &ModelConfig,
    layer_idx: usize,
    weights: &DecoderWeights,
    qk_norm: Option<(RMSNorm, RMSNorm)>,
    copy_norm: &impl Fn(Span, usize, usize) -> RMSNorm,
) -> DecoderBlock {
    let ModelConfig { dim, hidden_dim, group_size, .. } = *config;
    let all_heads_dim = config.all_heads_dim();
    let kv_dim = config.kv_dim();

    let attn_norm = copy_norm(weights.rms_att_weight, layer_idx, dim);

    let wq = Linear::new(weights.wq[layer_idx], dim, all_heads_dim, group_size);
    let wk = Linear::new(weights.wk[layer_idx], dim, kv_dim, group_size);
    let wv = Linear::new(weights.wv[layer_idx], dim, kv_dim, group_size);
    let wo = Linear::new(weights.wo[layer_idx], all_heads_dim, dim, group_size);

    let attention = MultiHeadAttention::new(wq, wk, wv, wo, qk_norm, config);

    let ffn_norm = copy_norm(weights.rms_ffn_weight, layer_idx, dim);

    let w1 = Linear::new(weights.w1[layer_idx], dim, hidden_dim, group_size);
    let w2 = Linear::new(weights.w2[layer_idx], hidden_dim, dim, group_size);
    let w3 = Linear::new(weights.w3[layer_idx], dim, hidden_dim, group_size);

    let feed_forward = FeedForward::new(w1, w2, w3);

    DecoderBlock { attn_norm, attention, ffn_norm, feed_forward }
}
